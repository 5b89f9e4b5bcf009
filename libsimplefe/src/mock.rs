//! In-memory board and transfer queue for exercising the session, pump and
//! streams without hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::DeviceConfig;
use crate::device::{DeviceControl, Direction, FifoLevels, FpgaStatus, FPGA_CLK};
use crate::error::{Result, SfeError, TransportError};
use crate::pump::{Completion, Slot, TransferQueue};

const GPIO_CDONE: u8 = 6;

struct BoardState {
    gpio: [u8; 16],
    cdone: bool,
    divider: u8,
    control: u8,
    control_writes: Vec<u8>,
    register_writes: usize,
    adc_dac_enabled: bool,
    clock: u32,
    clock_readings: VecDeque<u32>,
    fifo: FifoLevels,
    fifo_reads: usize,
    status_fault: Option<TransportError>,
    max_packet: usize,
}

/// Models the FPGA registers behind the SPI bridge.
pub struct MockBoard {
    config: DeviceConfig,
    state: Mutex<BoardState>,
}

impl MockBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            config: Self::config(),
            state: Mutex::new(BoardState {
                gpio: [1; 16],
                cdone: true,
                divider: 0,
                control: 0,
                control_writes: Vec::new(),
                register_writes: 0,
                adc_dac_enabled: false,
                clock: FPGA_CLK,
                clock_readings: VecDeque::new(),
                fifo: FifoLevels { adc: 0x20, dac: 0x20 },
                fifo_reads: 0,
                status_fault: None,
                max_packet: 1024,
            }),
        })
    }

    /// Device config with a short clock retry interval.
    pub fn config() -> DeviceConfig {
        DeviceConfig {
            clock_retry_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    pub fn set_cdone(&self, done: bool) {
        self.state.lock().cdone = done;
    }

    pub fn divider(&self) -> u8 {
        self.state.lock().divider
    }

    pub fn status(&self) -> FpgaStatus {
        let s = self.state.lock();
        FpgaStatus::decode([0, s.divider, s.control])
    }

    pub fn adc_dac_enabled(&self) -> bool {
        self.state.lock().adc_dac_enabled
    }

    /// Values written to the control register since the last `clear_log`.
    pub fn control_writes(&self) -> Vec<u8> {
        self.state.lock().control_writes.clone()
    }

    pub fn register_writes(&self) -> usize {
        self.state.lock().register_writes
    }

    pub fn clear_log(&self) {
        self.state.lock().control_writes.clear();
    }

    /// Queues clock readings returned before falling back to nominal.
    pub fn push_clock_readings(&self, readings: &[u32]) {
        self.state.lock().clock_readings.extend(readings);
    }

    pub fn set_fifo_levels(&self, levels: FifoLevels) {
        self.state.lock().fifo = levels;
    }

    pub fn fifo_reads(&self) -> usize {
        self.state.lock().fifo_reads
    }

    /// Makes every later FIFO and clock query fail with `err`.
    pub fn fail_status_queries(&self, err: TransportError) {
        self.state.lock().status_fault = Some(err);
    }

    pub fn set_max_packet_size(&self, size: usize) {
        self.state.lock().max_packet = size;
    }
}

impl DeviceControl for MockBoard {
    fn set_gpio(&self, gpio: u8, value: u8) -> Result<()> {
        self.state.lock().gpio[gpio as usize & 0x0F] = value;
        Ok(())
    }

    fn get_gpio(&self, gpio: u8) -> Result<u8> {
        let s = self.state.lock();
        if gpio == GPIO_CDONE {
            return Ok(s.cdone as u8);
        }
        Ok(s.gpio[gpio as usize & 0x0F])
    }

    fn spi_transfer(&self, data: &mut [u8]) -> Result<()> {
        let mut s = self.state.lock();
        if s.gpio[self.config.adc_dac_cs_gpio as usize] == 0 {
            s.adc_dac_enabled = data.first() == Some(&0x04);
            return Ok(());
        }
        if s.gpio[self.config.fpga_cs_gpio as usize] != 0 || data.is_empty() {
            return Ok(());
        }

        let op = data[0];
        if op & 0x80 != 0 && data.len() >= 2 {
            s.register_writes += 1;
            match (op >> 5) & 0x03 {
                0 => {
                    s.control = data[1];
                    s.control_writes.push(data[1]);
                }
                1 => s.divider = data[1] & 0x7F,
                _ => {}
            }
        } else if op >> 5 == 0x03 && data.len() >= 3 {
            // Bit 7 of the divider byte is not part of the field.
            data[1] = 0x80 | s.divider;
            data[2] = s.control;
        }
        Ok(())
    }

    fn fifo_levels(&self) -> Result<FifoLevels> {
        let mut s = self.state.lock();
        s.fifo_reads += 1;
        if let Some(err) = s.status_fault.clone() {
            return Err(SfeError::Transfer(err));
        }
        Ok(s.fifo)
    }

    fn clock_rate(&self) -> Result<u32> {
        let mut s = self.state.lock();
        if let Some(err) = s.status_fault.clone() {
            return Err(SfeError::Transfer(err));
        }
        Ok(s.clock_readings.pop_front().unwrap_or(s.clock))
    }

    fn max_packet_size(&self, _direction: Direction) -> usize {
        self.state.lock().max_packet
    }
}

type RxSource = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(Slot, bool)>,
    hold: bool,
    faults: VecDeque<TransportError>,
    sent: Vec<u8>,
    sent_sizes: Vec<usize>,
    buffers: Vec<(usize, usize)>,
    rx_source: Option<RxSource>,
}

/// Completes submitted slots in order after a short delay. TX payloads are
/// recorded; RX payloads come from an optional source closure.
#[derive(Clone)]
pub struct LoopbackQueue {
    direction: Direction,
    delay: Duration,
    state: Arc<Mutex<QueueState>>,
}

impl LoopbackQueue {
    pub fn tx() -> Self {
        Self::new(Direction::Tx)
    }

    pub fn rx() -> Self {
        Self::new(Direction::Rx)
    }

    fn new(direction: Direction) -> Self {
        Self {
            direction,
            delay: Duration::from_millis(1),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// While held, nothing completes unless cancelled.
    pub fn hold(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Fails the next completion with `err`.
    pub fn inject_fault(&self, err: TransportError) {
        self.state.lock().faults.push_back(err);
    }

    pub fn set_rx_source<F>(&self, source: F)
    where
        F: FnMut(&mut [u8]) -> usize + Send + 'static,
    {
        self.state.lock().rx_source = Some(Box::new(source));
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn sent(&self) -> Vec<u8> {
        self.state.lock().sent.clone()
    }

    pub fn sent_sizes(&self) -> Vec<usize> {
        self.state.lock().sent_sizes.clone()
    }

    /// `(slot index, buffer address)` for every submission so far.
    pub fn submitted_buffers(&self) -> Vec<(usize, usize)> {
        self.state.lock().buffers.clone()
    }
}

impl TransferQueue for LoopbackQueue {
    fn submit(&mut self, slot: Slot) -> std::result::Result<(), TransportError> {
        let mut s = self.state.lock();
        s.buffers.push((slot.index, slot.data.as_ptr() as usize));
        s.pending.push_back((slot, false));
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        thread::sleep(self.delay.min(timeout));
        let mut s = self.state.lock();
        let cancelled = s.pending.front()?.1;
        if s.hold && !cancelled {
            return None;
        }
        let (mut slot, _) = s.pending.pop_front()?;

        if cancelled {
            return Some(Completion {
                slot,
                actual_len: 0,
                status: Err(TransportError::Cancelled),
            });
        }
        if let Some(err) = s.faults.pop_front() {
            return Some(Completion {
                slot,
                actual_len: 0,
                status: Err(err),
            });
        }

        let actual_len = match self.direction {
            Direction::Tx => {
                let len = slot.data.len();
                s.sent.extend_from_slice(&slot.data);
                s.sent_sizes.push(len);
                len
            }
            Direction::Rx => match s.rx_source.as_mut() {
                Some(source) => source(&mut slot.data),
                None => {
                    slot.data.fill(128);
                    slot.data.len()
                }
            },
        };
        Some(Completion {
            slot,
            actual_len,
            status: Ok(()),
        })
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn cancel_all(&mut self) {
        for entry in self.state.lock().pending.iter_mut() {
            entry.1 = true;
        }
    }
}

//! simpleFE session: sample-rate divider, channel lanes and board status.
//!
//! The board exposes a handful of vendor requests (GPIO, FIFO levels, clock
//! rate) and an SPI bridge to the FPGA. [`DeviceControl`] is that raw
//! surface; [`DeviceSession`] layers the FPGA register protocol and the
//! shared channel-enable bookkeeping on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{DeviceConfig, PACKETS_PER_SEC};
use crate::error::{Result, SfeError};
use crate::rate_control::divided_rate;
use crate::usb::{UsbControl, UsbTransport};

pub const FPGA_CLK: u32 = 30_000_000;
pub const MAX_DIVIDER: u8 = 127;
const CLOCK_TOLERANCE: u32 = 1_000_000;
const CLOCK_ATTEMPTS: usize = 4;

const GPIO_FPGA_RST: u8 = 5;
const GPIO_CDONE: u8 = 6;

const REG_WRITE: u8 = 1 << 7;
const REG_CONTROL: u8 = 0x00;
const REG_DIVIDER: u8 = 0x01;
const OP_STATUS: u8 = 0x03;
const SYS_EN: u8 = 0x01;
const ADC_DAC_ENABLE: u8 = 0x04;
const LANE_SETTLE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// I and Q lane selection for one direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Lanes {
    pub i: bool,
    pub q: bool,
}

impl Lanes {
    pub const NONE: Lanes = Lanes { i: false, q: false };
    pub const I: Lanes = Lanes { i: true, q: false };
    pub const IQ: Lanes = Lanes { i: true, q: true };

    pub fn count(self) -> u32 {
        self.i as u32 + self.q as u32
    }

    pub fn any(self) -> bool {
        self.i || self.q
    }

    fn tx_bits(self) -> u8 {
        ((self.q as u8) << 4) | ((self.i as u8) << 3)
    }

    fn rx_bits(self) -> u8 {
        ((self.q as u8) << 2) | ((self.i as u8) << 1)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FifoLevels {
    pub adc: u8,
    pub dac: u8,
}

impl FifoLevels {
    pub fn decode(data: [u8; 2]) -> Self {
        Self {
            adc: data[0] & 0x3F,
            dac: data[1] & 0x3F,
        }
    }
}

/// Decoded FPGA status register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FpgaStatus {
    pub divider: u8,
    pub sys_en: bool,
    pub tx: Lanes,
    pub rx: Lanes,
}

impl FpgaStatus {
    pub fn decode(data: [u8; 3]) -> Self {
        let bits = data[2];
        Self {
            divider: data[1] & 0x7F,
            sys_en: bits & SYS_EN != 0,
            rx: Lanes {
                i: bits & 0x02 != 0,
                q: bits & 0x04 != 0,
            },
            tx: Lanes {
                i: bits & 0x08 != 0,
                q: bits & 0x10 != 0,
            },
        }
    }
}

/// Raw board access. Implemented over USB by [`crate::usb::UsbControl`].
pub trait DeviceControl: Send + Sync {
    fn set_gpio(&self, gpio: u8, value: u8) -> Result<()>;

    fn get_gpio(&self, gpio: u8) -> Result<u8>;

    /// Shifts `data` out over SPI, replacing it with the bytes shifted in.
    fn spi_transfer(&self, data: &mut [u8]) -> Result<()>;

    fn fifo_levels(&self) -> Result<FifoLevels>;

    fn clock_rate(&self) -> Result<u32>;

    fn max_packet_size(&self, direction: Direction) -> usize;
}

impl<T: DeviceControl + ?Sized> DeviceControl for Arc<T> {
    fn set_gpio(&self, gpio: u8, value: u8) -> Result<()> {
        (**self).set_gpio(gpio, value)
    }

    fn get_gpio(&self, gpio: u8) -> Result<u8> {
        (**self).get_gpio(gpio)
    }

    fn spi_transfer(&self, data: &mut [u8]) -> Result<()> {
        (**self).spi_transfer(data)
    }

    fn fifo_levels(&self) -> Result<FifoLevels> {
        (**self).fifo_levels()
    }

    fn clock_rate(&self) -> Result<u32> {
        (**self).clock_rate()
    }

    fn max_packet_size(&self, direction: Direction) -> usize {
        (**self).max_packet_size(direction)
    }
}

/// Every rate the divider can produce, fastest first.
pub fn supported_sample_rates() -> Vec<u32> {
    (0..=MAX_DIVIDER).map(|d| divided_rate(FPGA_CLK, d)).collect()
}

/// Smallest supported rate at or above `requested`.
pub fn nearest_sample_rate(requested: u32) -> Result<u32> {
    supported_sample_rates()
        .into_iter()
        .rev()
        .find(|&r| r >= requested)
        .ok_or(SfeError::UnsupportedSampleRate { requested })
}

/// Divider for `rate`, provided the rate it yields is within `tolerance`
/// (relative) of the request.
fn divider_for(rate: u32, tolerance: f64) -> Result<u8> {
    let unsupported = SfeError::UnsupportedSampleRate { requested: rate };
    if rate == 0 {
        return Err(unsupported);
    }
    let ratio = FPGA_CLK / rate;
    if ratio < 4 {
        return Err(unsupported);
    }
    let div = u8::try_from((ratio - 4) / 2)
        .ok()
        .filter(|&d| d <= MAX_DIVIDER)
        .ok_or(unsupported)?;

    let actual = divided_rate(FPGA_CLK, div);
    if actual.abs_diff(rate) as f64 > rate as f64 * tolerance {
        log::debug!("sample rate {rate} is off target (divider {div} gives {actual})");
        return Err(SfeError::UnsupportedSampleRate { requested: rate });
    }
    Ok(div)
}

#[derive(Debug, Default)]
struct ChannelState {
    divider: Option<u8>,
    sample_rate: u32,
    actual_rate: u32,
    tx: Lanes,
    rx: Lanes,
}

type FailureHook = Box<dyn Fn() + Send + Sync>;

/// Identifies a hook registered with [`DeviceSession::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// An open simpleFE, shared by its TX and RX streams.
pub struct DeviceSession {
    control: Box<dyn DeviceControl>,
    config: DeviceConfig,
    state: Mutex<ChannelState>,
    failed: AtomicBool,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    registered: Vec<(HookId, FailureHook)>,
}

impl DeviceSession {
    /// Opens the first simpleFE on the bus. The returned transport opens
    /// the streaming endpoints.
    pub fn open(config: DeviceConfig) -> Result<(Arc<Self>, UsbTransport)> {
        let (control, transport) = UsbControl::open(&config)?;
        let session = Self::with_control(Box::new(control), config)?;
        Ok((session, transport))
    }

    /// Builds a session over an already opened board: checks the FPGA is
    /// configured, powers the ADC/DAC and resets the FPGA.
    pub fn with_control(control: Box<dyn DeviceControl>, config: DeviceConfig) -> Result<Arc<Self>> {
        if control.get_gpio(GPIO_CDONE)? == 0 {
            return Err(SfeError::InvalidState("FPGA bitstream is not loaded"));
        }

        let session = Arc::new(Self {
            control,
            config,
            state: Mutex::new(ChannelState::default()),
            failed: AtomicBool::new(false),
            hooks: Mutex::new(Hooks::default()),
        });

        let cs = session.config.adc_dac_cs_gpio;
        session.select(cs, &mut [ADC_DAC_ENABLE])?;
        session.reset_board()?;

        let status = session.fpga_status()?;
        {
            let mut state = session.state.lock();
            state.divider = Some(status.divider);
            state.sample_rate = divided_rate(FPGA_CLK, status.divider);
        }
        log::info!(
            "simpleFE opened, divider {} ({} S/s)",
            status.divider,
            divided_rate(FPGA_CLK, status.divider)
        );
        Ok(session)
    }

    pub fn control(&self) -> &dyn DeviceControl {
        self.control.as_ref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_failed() {
            Err(SfeError::DeviceFailed)
        } else {
            Ok(())
        }
    }

    /// Runs one SPI exchange with chip select `cs` held low.
    fn select(&self, cs: u8, data: &mut [u8]) -> Result<()> {
        self.control.set_gpio(cs, 0)?;
        let res = self.control.spi_transfer(data);
        self.control.set_gpio(cs, 1)?;
        res
    }

    fn write_register(&self, reg: u8, value: u8) -> Result<()> {
        log::trace!("FPGA reg {reg} <- {value:#04x}");
        let cs = self.config.fpga_cs_gpio;
        self.select(cs, &mut [REG_WRITE | (reg << 5), value])
    }

    fn write_control(&self, value: u8) -> Result<()> {
        self.write_register(REG_CONTROL, value)
    }

    pub fn fpga_status(&self) -> Result<FpgaStatus> {
        let mut data = [OP_STATUS << 5, 0, 0];
        let cs = self.config.fpga_cs_gpio;
        self.select(cs, &mut data)?;
        Ok(FpgaStatus::decode(data))
    }

    pub fn reset_board(&self) -> Result<()> {
        self.ensure_alive()?;
        self.control.set_gpio(GPIO_FPGA_RST, 0)?;
        self.control.set_gpio(GPIO_FPGA_RST, 1)
    }

    /// Programs the divider for `rate`. Rates no divider reaches within
    /// `rate_tolerance` are [`SfeError::UnsupportedSampleRate`]. Fails with
    /// [`SfeError::Busy`] if the FPGA is already running at a different
    /// divider.
    pub fn set_sample_rate(&self, rate: u32) -> Result<u32> {
        self.ensure_alive()?;
        let div = divider_for(rate, self.config.rate_tolerance)?;
        let mut state = self.state.lock();

        let status = self.fpga_status()?;
        if status.sys_en && status.divider != div {
            return Err(SfeError::Busy {
                current_divider: status.divider,
                requested_divider: div,
            });
        }
        if status.divider != div {
            log::debug!("clock divider {} -> {}", status.divider, div);
            self.write_register(REG_DIVIDER, div & 0x7F)?;
        }

        state.divider = Some(div);
        state.sample_rate = divided_rate(FPGA_CLK, div);
        Ok(state.sample_rate)
    }

    /// Nominal sample rate of the programmed divider.
    pub fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    pub fn divider(&self) -> Option<u8> {
        self.state.lock().divider
    }

    pub fn lanes(&self, direction: Direction) -> Lanes {
        let state = self.state.lock();
        match direction {
            Direction::Tx => state.tx,
            Direction::Rx => state.rx,
        }
    }

    /// Turns on the DAC lanes. With RX running only the TX path is held in
    /// reset while the lanes change.
    pub fn enable_tx(&self, lanes: Lanes) -> Result<()> {
        self.ensure_alive()?;
        if !lanes.any() {
            return Err(SfeError::InvalidState("no TX lane selected"));
        }
        let mut state = self.state.lock();
        let rx = state.rx.rx_bits();
        let first = if state.rx.any() { rx | SYS_EN } else { lanes.tx_bits() };
        self.write_control(first)?;
        thread::sleep(LANE_SETTLE);
        self.write_control(lanes.tx_bits() | rx | SYS_EN)?;
        state.tx = lanes;
        log::debug!("TX lanes enabled: {lanes:?}");
        Ok(())
    }

    /// Turns on the ADC lanes, resetting the RX path first.
    pub fn enable_rx(&self, lanes: Lanes) -> Result<()> {
        self.ensure_alive()?;
        if !lanes.any() {
            return Err(SfeError::InvalidState("no RX lane selected"));
        }
        let mut state = self.state.lock();
        let tx = state.tx.tx_bits();
        self.write_control(tx | SYS_EN)?;
        thread::sleep(LANE_SETTLE);
        self.write_control(tx | lanes.rx_bits() | SYS_EN)?;
        state.rx = lanes;
        log::debug!("RX lanes enabled: {lanes:?}");
        Ok(())
    }

    /// Disables one direction's lanes. The FPGA system enable is only dropped
    /// once the sibling direction has no lanes left either.
    pub fn release(&self, direction: Direction) -> Result<()> {
        let mut state = self.state.lock();
        let was = match direction {
            Direction::Tx => std::mem::take(&mut state.tx),
            Direction::Rx => std::mem::take(&mut state.rx),
        };
        if !was.any() || self.is_failed() {
            return Ok(());
        }

        match direction {
            Direction::Tx if state.rx.any() => {
                let rx = state.rx.rx_bits();
                self.write_control(rx)?;
                thread::sleep(LANE_SETTLE);
                self.write_control(rx | SYS_EN)?;
            }
            Direction::Rx if state.tx.any() => {
                self.write_control(state.tx.tx_bits() | SYS_EN)?;
            }
            _ => {
                log::debug!("no channel left, stopping FPGA");
                self.write_control(0)?;
            }
        }
        Ok(())
    }

    pub fn fifo_levels(&self) -> Result<FifoLevels> {
        self.ensure_alive()?;
        self.control.fifo_levels()
    }

    pub fn clock_rate(&self) -> Result<u32> {
        self.ensure_alive()?;
        self.control.clock_rate()
    }

    /// Reads the board clock until it is within 1 MHz of nominal.
    pub fn stable_clock_rate(&self) -> Result<u32> {
        let mut clock = 0;
        for attempt in 0..CLOCK_ATTEMPTS {
            clock = self.clock_rate()?;
            if clock.abs_diff(FPGA_CLK) <= CLOCK_TOLERANCE {
                log::info!("board clock {clock} Hz");
                return Ok(clock);
            }
            log::warn!("board is not ready (clock {clock} Hz)");
            if attempt + 1 < CLOCK_ATTEMPTS {
                thread::sleep(self.config.clock_retry_interval);
            }
        }
        Err(SfeError::ClockUnstable(clock))
    }

    /// Stores the sample rate a measured `clock_hz` yields at the current
    /// divider and returns it.
    pub fn record_actual_rate(&self, clock_hz: u32) -> Result<u32> {
        let mut state = self.state.lock();
        let div = state
            .divider
            .ok_or(SfeError::InvalidState("sample rate not set"))?;
        state.actual_rate = divided_rate(clock_hz, div);
        Ok(state.actual_rate)
    }

    /// Sample rate measured when TX last started; 0 before that.
    pub fn actual_sample_rate(&self) -> u32 {
        self.state.lock().actual_rate
    }

    pub fn samples_per_transfer(&self, packets: usize) -> usize {
        (self.sample_rate() as f64 / PACKETS_PER_SEC as f64 * packets as f64) as usize
    }

    pub fn bytes_per_slot(&self, direction: Direction, packets: usize) -> usize {
        self.control.max_packet_size(direction) * packets
    }

    /// Registers `hook` to run once the session fails. A hook registered
    /// after the failure runs immediately.
    pub fn on_failure<F>(&self, hook: F) -> HookId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.lock();
        let id = HookId(hooks.next_id);
        hooks.next_id += 1;
        if self.is_failed() {
            drop(hooks);
            hook();
            return id;
        }
        hooks.registered.push((id, Box::new(hook)));
        id
    }

    /// Unregisters a hook that is no longer needed.
    pub fn remove_failure_hook(&self, id: HookId) {
        self.hooks.lock().registered.retain(|(h, _)| *h != id);
    }

    pub fn failure_hook_count(&self) -> usize {
        self.hooks.lock().registered.len()
    }

    /// Marks the session dead and wakes everything waiting on it.
    pub fn fail(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("simpleFE failed: {reason}");
        let hooks = std::mem::take(&mut self.hooks.lock().registered);
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

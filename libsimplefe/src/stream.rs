//! Blocking sample streams on top of the transfer pump.
//!
//! The application thread writes (TX) or reads (RX) samples through a
//! [`SharedRingBuffer`]; the pump's event thread converts between the ring
//! and wire bytes. Starved TX transfers are sent as silence and full RX
//! rings drop the incoming transfer. Each of those events prints a single
//! `U` or `O` to stderr and bumps a counter.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use num_complex::Complex32;

use crate::config::StreamConfig;
use crate::device::{DeviceSession, Direction, HookId, Lanes};
use crate::error::Result;
use crate::pump::{Flow, StatsSnapshot, TransferPump, TransferQueue};
use crate::ring_buffer::{Conversion, SharedRingBuffer};
use crate::wire::{fill_silence, ComplexToWire, RealToWire, WireToComplex, WireToReal};

/// Transfers' worth of data the ring holds.
const RING_TRANSFERS: usize = 4;

/// A sample type and the lanes it occupies on the device.
pub trait StreamSample: Copy + Default + Send + Sync + 'static {
    const LANES: Lanes;
}

impl StreamSample for f32 {
    const LANES: Lanes = Lanes::I;
}

impl StreamSample for Complex32 {
    const LANES: Lanes = Lanes::IQ;
}

fn close_on_failure<T>(session: &DeviceSession, ring: &Arc<SharedRingBuffer<T>>) -> HookId
where
    T: Copy + Default + Send + 'static,
{
    let weak = Arc::downgrade(ring);
    session.on_failure(move || {
        if let Some(ring) = weak.upgrade() {
            ring.close();
        }
    })
}

pub struct TxStream<T, C> {
    session: Arc<DeviceSession>,
    hook: HookId,
    ring: Arc<SharedRingBuffer<T>>,
    pump: TransferPump,
    underruns: Arc<AtomicU64>,
    _conv: PhantomData<C>,
}

pub type RealTxStream = TxStream<f32, RealToWire>;
pub type ComplexTxStream = TxStream<Complex32, ComplexToWire>;

impl<T, C> TxStream<T, C>
where
    T: StreamSample,
    C: Conversion<T, Output = u8> + Default + Send + 'static,
{
    /// Enables the TX lanes for `T` and starts pumping the ring out.
    pub fn start<Q>(session: Arc<DeviceSession>, queue: Q, config: &StreamConfig) -> Result<Self>
    where
        Q: TransferQueue + 'static,
    {
        let capacity = (RING_TRANSFERS * session.samples_per_transfer(config.packets_per_transfer))
            .max(C::GRANULE * 2);
        let ring = Arc::new(SharedRingBuffer::with_capacity(capacity));
        let underruns = Arc::new(AtomicU64::new(0));
        let hook = close_on_failure(&session, &ring);

        if let Err(e) = session.enable_tx(T::LANES) {
            session.remove_failure_hook(hook);
            return Err(e);
        }
        let fill = {
            let ring = ring.clone();
            let underruns = underruns.clone();
            let conv = C::default();
            move |buf: &mut [u8]| {
                if ring.try_read(buf, &conv) == 0 {
                    fill_silence(buf);
                    underruns.fetch_add(1, Ordering::Relaxed);
                    eprint!("U");
                }
                Flow::Continue
            }
        };
        let pump = match TransferPump::start_tx(session.clone(), queue, config, fill) {
            Ok(pump) => pump,
            Err(e) => {
                session.remove_failure_hook(hook);
                if let Err(release) = session.release(Direction::Tx) {
                    log::warn!("releasing TX lanes after failed start: {release}");
                }
                return Err(e);
            }
        };
        log::debug!("TX ring holds {capacity} samples");

        Ok(Self {
            session,
            hook,
            ring,
            pump,
            underruns,
            _conv: PhantomData,
        })
    }

    /// Queues every sample, blocking while the ring is full.
    pub fn write(&self, samples: &[T]) -> Result<()> {
        let chunk = self.ring.capacity();
        for part in samples.chunks(chunk) {
            self.ring.write_blocking(part)?;
        }
        Ok(())
    }

    /// Queues all of `samples` if they fit right now; returns how many were
    /// taken (0 or `samples.len()`).
    pub fn try_write(&self, samples: &[T]) -> usize {
        self.ring.try_write(samples)
    }

    /// Samples waiting to be sent.
    pub fn buffered(&self) -> usize {
        self.ring.count()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.pump.statistics()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.ring.close();
        self.pump.stop()
    }
}

pub struct RxStream<T, C> {
    session: Arc<DeviceSession>,
    hook: HookId,
    ring: Arc<SharedRingBuffer<u8>>,
    pump: TransferPump,
    overruns: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    conv: C,
    _sample: PhantomData<T>,
}

pub type RealRxStream = RxStream<f32, WireToReal>;
pub type ComplexRxStream = RxStream<Complex32, WireToComplex>;

impl<T, C> RxStream<T, C>
where
    T: StreamSample,
    C: Conversion<u8, Output = T> + Default,
{
    /// Enables the RX lanes for `T` and starts filling the ring.
    pub fn start<Q>(session: Arc<DeviceSession>, queue: Q, config: &StreamConfig) -> Result<Self>
    where
        Q: TransferQueue + 'static,
    {
        let capacity = RING_TRANSFERS * session.bytes_per_slot(Direction::Rx, config.packets_per_transfer);
        let ring = Arc::new(SharedRingBuffer::with_capacity(capacity));
        let overruns = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let hook = close_on_failure(&session, &ring);

        if let Err(e) = session.enable_rx(T::LANES) {
            session.remove_failure_hook(hook);
            return Err(e);
        }
        let paired = T::LANES.count() == 2;
        let drain = {
            let ring = ring.clone();
            let overruns = overruns.clone();
            let dropped = dropped.clone();
            move |data: &[u8]| {
                if paired && data.len() % 2 != 0 {
                    // A torn I/Q pair would swap the lanes from here on.
                    dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("dropping odd-length RX transfer ({} bytes)", data.len());
                } else if !data.is_empty() && ring.try_write(data) == 0 {
                    overruns.fetch_add(1, Ordering::Relaxed);
                    eprint!("O");
                }
                Flow::Continue
            }
        };
        let pump = match TransferPump::start_rx(session.clone(), queue, config, drain) {
            Ok(pump) => pump,
            Err(e) => {
                session.remove_failure_hook(hook);
                if let Err(release) = session.release(Direction::Rx) {
                    log::warn!("releasing RX lanes after failed start: {release}");
                }
                return Err(e);
            }
        };
        log::debug!("RX ring holds {capacity} bytes");

        Ok(Self {
            session,
            hook,
            ring,
            pump,
            overruns,
            dropped,
            conv: C::default(),
            _sample: PhantomData,
        })
    }

    /// Fills `out` completely, blocking until enough data has arrived.
    pub fn read(&self, out: &mut [T]) -> Result<usize> {
        let per_sample = self.conv.source_len(1).max(1);
        let chunk = (self.ring.capacity() / per_sample).max(1);
        for part in out.chunks_mut(chunk) {
            self.ring.read_blocking(part, &self.conv)?;
        }
        Ok(out.len())
    }

    /// Wire bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.ring.count()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Transfers discarded for carrying a partial I/Q pair.
    pub fn dropped_transfers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.pump.statistics()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.ring.close();
        self.pump.stop()
    }
}

impl<T, C> Drop for TxStream<T, C> {
    fn drop(&mut self) {
        self.session.remove_failure_hook(self.hook);
    }
}

impl<T, C> Drop for RxStream<T, C> {
    fn drop(&mut self) {
        self.session.remove_failure_hook(self.hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SfeError;
    use crate::mock::{LoopbackQueue, MockBoard};
    use crate::pump::PumpState;
    use crate::wire::{pack_complex, FRAME_BYTES, SILENCE_FRAME};
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config() -> StreamConfig {
        StreamConfig {
            num_transfers: 4,
            packets_per_transfer: 8,
            poll_interval: Duration::from_millis(2),
            drain_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn session(board: &Arc<MockBoard>) -> Arc<DeviceSession> {
        let s = DeviceSession::with_control(Box::new(board.clone()), MockBoard::config()).unwrap();
        s.set_sample_rate(1_000_000).unwrap();
        s
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn tx_sends_written_samples_between_silence() {
        let board = MockBoard::new();
        let session = session(&board);
        let queue = LoopbackQueue::tx();
        let mut tx = ComplexTxStream::start(session.clone(), queue.clone(), &test_config()).unwrap();
        assert_eq!(session.lanes(Direction::Tx), Lanes::IQ);

        // Larger than the ring, so the write has to wait for the pump.
        let samples = vec![Complex32::new(0.5, 0.5); 12_000];
        tx.write(&samples).unwrap();

        let mut expected = [0u8; FRAME_BYTES];
        pack_complex(&mut expected, &samples[..2]);
        let count = |sent: &[u8]| sent.chunks(FRAME_BYTES).filter(|f| *f == expected).count();
        wait_until(|| count(&queue.sent()) == 6000);
        tx.stop().unwrap();

        let sent = queue.sent();
        assert!(sent
            .chunks(FRAME_BYTES)
            .all(|f| f == expected || f == SILENCE_FRAME));
        assert!(tx.underruns() > 0);
        assert_eq!(session.lanes(Direction::Tx), Lanes::NONE);
    }

    #[test]
    fn rx_decodes_interleaved_pairs() {
        let board = MockBoard::new();
        let session = session(&board);
        let queue = LoopbackQueue::rx();
        queue.set_rx_source(|buf| {
            for pair in buf.chunks_mut(2) {
                pair.copy_from_slice(&[255, 1]);
            }
            buf.len()
        });
        let mut rx = ComplexRxStream::start(session, queue, &test_config()).unwrap();

        let mut out = vec![Complex32::default(); 20_000];
        assert_eq!(rx.read(&mut out).unwrap(), 20_000);
        assert!(out.iter().all(|&s| s == Complex32::new(1.0, -1.0)));
        rx.stop().unwrap();
    }

    #[test]
    fn rx_drops_odd_length_transfers() {
        let board = MockBoard::new();
        let session = session(&board);
        let queue = LoopbackQueue::rx();
        queue.set_rx_source(|buf| {
            buf[..11].fill(128);
            11
        });
        let mut rx = ComplexRxStream::start(session, queue, &test_config()).unwrap();
        wait_until(|| rx.dropped_transfers() >= 3);
        assert_eq!(rx.buffered(), 0);
        rx.stop().unwrap();
    }

    #[test]
    fn rx_counts_overruns_when_nobody_reads() {
        let board = MockBoard::new();
        let session = session(&board);
        let mut rx = RealRxStream::start(session.clone(), LoopbackQueue::rx(), &test_config()).unwrap();
        assert_eq!(session.lanes(Direction::Rx), Lanes::I);
        wait_until(|| rx.overruns() > 0);
        assert_eq!(rx.buffered(), 4 * 1024 * 8);
        rx.stop().unwrap();
    }

    #[test]
    fn session_failure_wakes_a_blocked_reader() {
        let board = MockBoard::new();
        let session = session(&board);
        let queue = LoopbackQueue::rx();
        queue.hold(true);
        let mut rx = RealRxStream::start(session.clone(), queue, &test_config()).unwrap();

        let res = thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut out = [0f32; 16];
                rx.read(&mut out)
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!reader.is_finished());
            session.fail("unplugged");
            reader.join().unwrap()
        });
        assert!(matches!(res, Err(SfeError::DeviceFailed)));

        wait_until(|| rx.pump.state() == PumpState::Stopped);
        rx.stop().unwrap();
    }

    #[test]
    fn session_failure_wakes_a_blocked_writer() {
        let board = MockBoard::new();
        let session = session(&board);
        let queue = LoopbackQueue::tx();
        queue.hold(true);
        let mut tx = ComplexTxStream::start(session.clone(), queue, &test_config()).unwrap();

        let res = thread::scope(|s| {
            let writer = s.spawn(|| {
                // Nothing drains while the queue is held, so this fills the ring.
                let samples = vec![Complex32::new(0.5, -0.5); 4 * tx.ring.capacity()];
                tx.write(&samples)
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!writer.is_finished());
            session.fail("unplugged");
            writer.join().unwrap()
        });
        assert!(matches!(res, Err(SfeError::DeviceFailed)));

        wait_until(|| tx.pump.state() == PumpState::Stopped);
        tx.stop().unwrap();
    }

    #[test]
    fn dropped_streams_leave_no_failure_hooks() {
        let board = MockBoard::new();
        let session = session(&board);
        for _ in 0..3 {
            let mut tx = RealTxStream::start(session.clone(), LoopbackQueue::tx(), &test_config()).unwrap();
            let mut rx = RealRxStream::start(session.clone(), LoopbackQueue::rx(), &test_config()).unwrap();
            assert_eq!(session.failure_hook_count(), 2);
            tx.stop().unwrap();
            rx.stop().unwrap();
        }
        assert_eq!(session.failure_hook_count(), 0);
    }

    #[test]
    fn failed_start_releases_lanes() {
        let board = MockBoard::new();
        board.set_max_packet_size(64);
        let session = session(&board);
        let res = ComplexTxStream::start(session.clone(), LoopbackQueue::tx(), &test_config());
        assert!(matches!(res, Err(SfeError::RateTooHigh { .. })));
        assert_eq!(session.lanes(Direction::Tx), Lanes::NONE);
        assert_eq!(session.failure_hook_count(), 0);
        assert!(!board.status().sys_en);
    }
}

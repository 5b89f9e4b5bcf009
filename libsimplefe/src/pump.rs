//! Continuous transfer pump, one event thread per direction.
//!
//! Every slot is submitted once at start and then recycled from its own
//! completion: TX slots are resized by the [`RateController`] and refilled by
//! the producer callback, RX slots are handed to the consumer callback. A
//! single exit flag stops both the resubmission and the event loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use crate::config::{StreamConfig, PACKETS_PER_SEC};
use crate::device::{DeviceSession, Direction, FifoLevels};
use crate::error::{Result, SfeError, TransportError};
use crate::rate_control::{tx_bytes_per_sec, RateController};

/// One reusable transfer buffer.
#[derive(Debug)]
pub struct Slot {
    pub index: usize,
    /// Transfer payload; its length is the number of bytes to move.
    pub data: Vec<u8>,
    /// How `data` splits into per-frame packets.
    pub packets: Vec<usize>,
}

impl Slot {
    pub fn new(index: usize, capacity: usize, n_packets: usize) -> Self {
        Self {
            index,
            data: Vec::with_capacity(capacity),
            packets: vec![0; n_packets],
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub slot: Slot,
    pub actual_len: usize,
    pub status: std::result::Result<(), TransportError>,
}

/// The device side of a pump: somewhere to submit slots and reap them.
pub trait TransferQueue: Send {
    fn submit(&mut self, slot: Slot) -> std::result::Result<(), TransportError>;

    /// Next finished slot, or `None` if nothing finished within `timeout`.
    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion>;

    /// Slots submitted and not yet returned by `wait_complete`.
    fn pending(&self) -> usize;

    /// Asks every pending slot to finish early; they still come back through
    /// `wait_complete`.
    fn cancel_all(&mut self);
}

/// What a fill or drain callback wants the pump to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpState {
    Idle,
    Armed,
    Running,
    Draining,
    Stopped,
}

impl PumpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PumpState::Idle,
            1 => PumpState::Armed,
            2 => PumpState::Running,
            3 => PumpState::Draining,
            _ => PumpState::Stopped,
        }
    }
}

/// Counters updated by the event thread and readable from anywhere.
#[derive(Debug)]
pub struct PumpStatistics {
    started: Instant,
    transfers: AtomicU64,
    packets_ok: AtomicU64,
    packets_failed: AtomicU64,
    bytes: AtomicU64,
    retired_slots: AtomicU64,
    discarded_transfers: AtomicU64,
}

impl PumpStatistics {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            transfers: AtomicU64::new(0),
            packets_ok: AtomicU64::new(0),
            packets_failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            retired_slots: AtomicU64::new(0),
            discarded_transfers: AtomicU64::new(0),
        }
    }

    fn record_success(&self, packets: u64, bytes: usize) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.packets_ok.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, packets: u64) {
        self.packets_failed.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transfers: self.transfers.load(Ordering::Relaxed),
            packets_ok: self.packets_ok.load(Ordering::Relaxed),
            packets_failed: self.packets_failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            retired_slots: self.retired_slots.load(Ordering::Relaxed),
            discarded_transfers: self.discarded_transfers.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub transfers: u64,
    pub packets_ok: u64,
    pub packets_failed: u64,
    pub bytes: u64,
    pub retired_slots: u64,
    pub discarded_transfers: u64,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Bytes per second since the pump started.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StatusQuery {
    Fifo,
    Clock,
}

#[derive(Debug, Clone, Copy)]
enum StatusReply {
    Fifo(FifoLevels),
    Clock(u32),
}

/// Runs device status requests off the event thread so a slow control
/// transfer never holds up slot recycling.
struct StatusWorker {
    tx: Option<Sender<StatusQuery>>,
    replies: Receiver<StatusReply>,
    handle: Option<JoinHandle<()>>,
}

impl StatusWorker {
    fn spawn(session: Arc<DeviceSession>) -> Result<Self> {
        let (tx, rx) = bounded::<StatusQuery>(4);
        let (reply_tx, replies) = unbounded();
        let handle = thread::Builder::new()
            .name("sfe-status".into())
            .spawn(move || {
                for query in rx {
                    let reply = match query {
                        StatusQuery::Fifo => session.fifo_levels().map(StatusReply::Fifo),
                        StatusQuery::Clock => session.clock_rate().map(StatusReply::Clock),
                    };
                    match reply {
                        Ok(reply) => {
                            if reply_tx.send(reply).is_err() {
                                break;
                            }
                        }
                        Err(SfeError::DeviceFailed) => break,
                        Err(SfeError::Transfer(e)) if e.is_fatal() => {
                            session.fail(&format!("status query {query:?}: {e}"));
                            break;
                        }
                        Err(e) => log::warn!("status query {query:?} failed: {e}"),
                    }
                }
            })
            .map_err(|e| SfeError::Usb(e.to_string()))?;
        Ok(Self {
            tx: Some(tx),
            replies,
            handle: Some(handle),
        })
    }

    fn request(&self, query: StatusQuery) {
        if let Some(tx) = &self.tx {
            match tx.try_send(query) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => log::debug!("status worker busy, skipping {query:?}"),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

impl Drop for StatusWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Per-direction completion handling.
trait SlotHandler: Send {
    /// Prepares a successfully completed slot for resubmission.
    fn complete(&mut self, slot: &mut Slot, actual_len: usize, stats: &PumpStatistics) -> Flow;

    /// Folds in anything that arrived asynchronously since the last call.
    fn poll(&mut self) {}
}

struct TxHandler<F> {
    rate: RateController,
    fill: F,
    status: StatusWorker,
}

impl<F> SlotHandler for TxHandler<F>
where
    F: FnMut(&mut [u8]) -> Flow + Send,
{
    fn complete(&mut self, slot: &mut Slot, _actual_len: usize, _stats: &PumpStatistics) -> Flow {
        let checks = self.rate.record_packets(slot.packets.len() as u32);
        let total = self.rate.next_transfer(&mut slot.packets);
        slot.data.resize(total, 0);
        let flow = (self.fill)(&mut slot.data);

        if checks.fifo {
            self.status.request(StatusQuery::Fifo);
        }
        if checks.clock {
            self.status.request(StatusQuery::Clock);
        }
        flow
    }

    fn poll(&mut self) {
        while let Ok(reply) = self.status.replies.try_recv() {
            match reply {
                StatusReply::Fifo(levels) => {
                    self.rate.observe_fifo_level(levels.dac);
                }
                StatusReply::Clock(clock) => {
                    let rate = self.rate.set_clock_rate(clock);
                    log::debug!("board clock {clock} Hz, sample rate now {rate}");
                }
            }
        }
    }
}

struct RxHandler<F> {
    drain: F,
    seen: usize,
    discard: usize,
    slot_bytes: usize,
}

impl<F> SlotHandler for RxHandler<F>
where
    F: FnMut(&[u8]) -> Flow + Send,
{
    fn complete(&mut self, slot: &mut Slot, actual_len: usize, stats: &PumpStatistics) -> Flow {
        self.seen += 1;
        let flow = if self.seen <= self.discard {
            stats.discarded_transfers.fetch_add(1, Ordering::Relaxed);
            Flow::Continue
        } else {
            let len = actual_len.min(slot.data.len());
            (self.drain)(&slot.data[..len])
        };
        slot.data.resize(self.slot_bytes, 0);
        flow
    }
}

struct PumpShared {
    direction: Direction,
    session: Arc<DeviceSession>,
    exit: AtomicBool,
    state: AtomicU8,
    stats: PumpStatistics,
}

impl PumpShared {
    fn new(direction: Direction, session: Arc<DeviceSession>) -> Self {
        Self {
            direction,
            session,
            exit: AtomicBool::new(false),
            state: AtomicU8::new(PumpState::Idle as u8),
            stats: PumpStatistics::new(),
        }
    }

    fn set_state(&self, state: PumpState) {
        log::debug!("{:?} pump -> {:?}", self.direction, state);
        self.state.store(state as u8, Ordering::Release);
    }

    fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    fn retire(&self, err: &TransportError) {
        self.stats.retired_slots.fetch_add(1, Ordering::Relaxed);
        if err.is_fatal() {
            self.session.fail(&format!("{:?} transfer: {err}", self.direction));
            self.request_exit();
        } else {
            log::warn!("{:?} transfer failed, retiring slot: {err}", self.direction);
        }
    }
}

fn event_loop<Q, H>(mut queue: Q, mut handler: H, shared: &PumpShared, poll: Duration, drain_timeout: Duration)
where
    Q: TransferQueue,
    H: SlotHandler,
{
    let mut deadline: Option<Instant> = None;
    let mut cancelled = false;

    loop {
        if shared.session.is_failed() {
            shared.request_exit();
        }

        if shared.exiting() {
            if queue.pending() == 0 {
                break;
            }
            let deadline = *deadline.get_or_insert_with(|| {
                shared.set_state(PumpState::Draining);
                Instant::now() + drain_timeout
            });
            if !cancelled && (shared.session.is_failed() || Instant::now() >= deadline) {
                log::debug!(
                    "{:?} pump cancelling {} outstanding transfers",
                    shared.direction,
                    queue.pending()
                );
                queue.cancel_all();
                cancelled = true;
            }
        } else if queue.pending() == 0 {
            log::warn!("{:?} pump has no transfer slots left", shared.direction);
            shared.request_exit();
            continue;
        }

        handler.poll();

        let Some(done) = queue.wait_complete(poll) else {
            continue;
        };
        let packets = done.slot.packets.len() as u64;
        match done.status {
            Ok(()) => {
                shared.stats.record_success(packets, done.actual_len);
                if shared.exiting() {
                    continue;
                }
                let mut slot = done.slot;
                if handler.complete(&mut slot, done.actual_len, &shared.stats) == Flow::Stop {
                    log::debug!("{:?} callback requested stop", shared.direction);
                    shared.request_exit();
                    continue;
                }
                if let Err(e) = queue.submit(slot) {
                    shared.retire(&e);
                }
            }
            Err(TransportError::Cancelled) if shared.exiting() => {}
            Err(e) => {
                shared.stats.record_failure(packets);
                shared.retire(&e);
            }
        }
    }

    shared.set_state(PumpState::Stopped);
}

/// A running TX or RX stream of transfers.
pub struct TransferPump {
    shared: Arc<PumpShared>,
    thread: Option<JoinHandle<()>>,
}

impl TransferPump {
    /// Starts transmitting. `fill` is called from the event thread with the
    /// bytes of each outgoing transfer and must fill all of them.
    pub fn start_tx<Q, F>(
        session: Arc<DeviceSession>,
        mut queue: Q,
        config: &StreamConfig,
        mut fill: F,
    ) -> Result<Self>
    where
        Q: TransferQueue + 'static,
        F: FnMut(&mut [u8]) -> Flow + Send + 'static,
    {
        check_config(config)?;
        if session.is_failed() {
            return Err(SfeError::DeviceFailed);
        }
        let lanes = session.lanes(Direction::Tx);
        if !lanes.any() {
            return Err(SfeError::InvalidState("TX lanes are not enabled"));
        }
        let divider = session
            .divider()
            .ok_or(SfeError::InvalidState("sample rate not set"))?;

        let clock = session.stable_clock_rate()?;
        let rate = session.record_actual_rate(clock)?;
        let bytes_per_sec = tx_bytes_per_sec(rate, lanes.count());
        let limit = session.control().max_packet_size(Direction::Tx) as u64 * PACKETS_PER_SEC as u64;
        if bytes_per_sec > limit {
            return Err(SfeError::RateTooHigh {
                bytes_per_sec,
                limit,
            });
        }

        let mut rate_control = RateController::new(config.rate.clone(), rate, divider, lanes.count());
        let shared = Arc::new(PumpShared::new(Direction::Tx, session.clone()));
        shared.set_state(PumpState::Armed);

        let packets = config.packets_per_transfer;
        let capacity = session.bytes_per_slot(Direction::Tx, packets)
            + config.tx_prime_bytes.max(0) as usize
            + config.rate.quantum_bytes.unsigned_abs() as usize;
        for i in 0..config.num_transfers {
            let mut slot = Slot::new(i, capacity, packets);
            let prime = if i == 0 { config.tx_prime_bytes } else { 0 };
            let total = rate_control.prime_transfer(&mut slot.packets, prime);
            slot.data.resize(total, 0);
            if fill(&mut slot.data) == Flow::Stop {
                shared.request_exit();
            }
            if let Err(e) = queue.submit(slot) {
                queue.cancel_all();
                shared.set_state(PumpState::Stopped);
                return Err(e.into());
            }
        }
        log::info!(
            "TX started: {} transfers x {} packets, {} S/s on {} lane(s)",
            config.num_transfers,
            packets,
            rate,
            lanes.count()
        );

        let handler = TxHandler {
            rate: rate_control,
            fill,
            status: StatusWorker::spawn(session)?,
        };
        Self::spawn(shared, queue, handler, config)
    }

    /// Starts receiving. `drain` is called from the event thread with the
    /// bytes of each incoming transfer.
    pub fn start_rx<Q, F>(
        session: Arc<DeviceSession>,
        mut queue: Q,
        config: &StreamConfig,
        drain: F,
    ) -> Result<Self>
    where
        Q: TransferQueue + 'static,
        F: FnMut(&[u8]) -> Flow + Send + 'static,
    {
        check_config(config)?;
        if session.is_failed() {
            return Err(SfeError::DeviceFailed);
        }
        if !session.lanes(Direction::Rx).any() {
            return Err(SfeError::InvalidState("RX lanes are not enabled"));
        }

        let shared = Arc::new(PumpShared::new(Direction::Rx, session.clone()));
        shared.set_state(PumpState::Armed);

        let packets = config.packets_per_transfer;
        let max_packet = session.control().max_packet_size(Direction::Rx);
        let slot_bytes = max_packet * packets;
        for i in 0..config.num_transfers {
            let mut slot = Slot::new(i, slot_bytes, packets);
            slot.data.resize(slot_bytes, 0);
            slot.packets.iter_mut().for_each(|p| *p = max_packet);
            if let Err(e) = queue.submit(slot) {
                queue.cancel_all();
                shared.set_state(PumpState::Stopped);
                return Err(e.into());
            }
        }
        log::info!(
            "RX started: {} transfers x {} bytes",
            config.num_transfers,
            slot_bytes
        );

        let handler = RxHandler {
            drain,
            seen: 0,
            discard: config.rx_discard_transfers,
            slot_bytes,
        };
        Self::spawn(shared, queue, handler, config)
    }

    fn spawn<Q, H>(shared: Arc<PumpShared>, queue: Q, handler: H, config: &StreamConfig) -> Result<Self>
    where
        Q: TransferQueue + 'static,
        H: SlotHandler + 'static,
    {
        let poll = config.poll_interval;
        let drain_timeout = config.drain_timeout;
        let thread_shared = shared.clone();
        let name = match shared.direction {
            Direction::Tx => "sfe-tx",
            Direction::Rx => "sfe-rx",
        };

        shared.set_state(PumpState::Running);
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || event_loop(queue, handler, &thread_shared, poll, drain_timeout))
            .map_err(|e| SfeError::Usb(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn state(&self) -> PumpState {
        PumpState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Asks the event thread to wind down without waiting for it.
    pub fn request_stop(&self) {
        self.shared.request_exit();
    }

    /// Stops the stream, waits for outstanding transfers, then releases this
    /// direction's lanes on the device.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.request_exit();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| SfeError::InvalidState("pump thread panicked"))?;
        }
        let stats = self.statistics();
        log::info!(
            "{:?} stopped after {} transfers ({:.0} B/s)",
            self.shared.direction,
            stats.transfers,
            stats.throughput()
        );
        self.shared.session.release(self.shared.direction)
    }
}

impl Drop for TransferPump {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("stopping {:?} pump on drop: {e}", self.shared.direction);
            }
        }
    }
}

fn check_config(config: &StreamConfig) -> Result<()> {
    if config.num_transfers == 0 || config.packets_per_transfer == 0 {
        return Err(SfeError::Contract("stream needs at least one transfer of one packet"));
    }
    Ok(())
}

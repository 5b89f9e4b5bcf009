//! Transmit byte-rate pacing.
//!
//! The DAC drains its FIFO at the board clock rate, which drifts a little
//! from the nominal rate the divider implies. The controller sizes every TX
//! transfer from the current bytes-per-second estimate and nudges it by a
//! fixed quantum whenever the FIFO level leaves the watermark band.

use crate::config::{RateControlConfig, PACKETS_PER_SEC};
use crate::wire::FRAME_BYTES;

/// Wire bytes per second for `channels` DAC lanes at `sample_rate`.
pub fn tx_bytes_per_sec(sample_rate: u32, channels: u32) -> u64 {
    sample_rate as u64 * channels as u64 * 10 / 8
}

/// Sample rate produced by `divider` from a board clock of `clock_hz`.
pub fn divided_rate(clock_hz: u32, divider: u8) -> u32 {
    clock_hz / (divider as u32 * 2 + 4)
}

/// Device status queries that fell due after a batch of packets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusChecks {
    pub fifo: bool,
    pub clock: bool,
}

#[derive(Debug)]
pub struct RateController {
    config: RateControlConfig,
    divider: u8,
    channels: u32,
    bytes_per_sec: u64,
    hold: u32,
    hold_limit: u32,
    adjustment: i64,
    frame_remain: i64,
    fifo_packets: u32,
    clock_packets: u32,
    corrections: u64,
}

impl RateController {
    pub fn new(config: RateControlConfig, sample_rate: u32, divider: u8, channels: u32) -> Self {
        let hold_limit = config.warmup_observations;
        Self {
            config,
            divider,
            channels,
            bytes_per_sec: tx_bytes_per_sec(sample_rate, channels),
            hold: 0,
            hold_limit,
            adjustment: 0,
            frame_remain: 0,
            fifo_packets: 0,
            clock_packets: 0,
            corrections: 0,
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn pending_adjustment(&self) -> i64 {
        self.adjustment
    }

    /// Bytes carried into the next transfer to keep totals frame aligned.
    pub fn frame_remainder(&self) -> i64 {
        self.frame_remain
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Feeds one DAC FIFO reading (0..=63) and returns the adjustment the
    /// next transfer will carry.
    pub fn observe_fifo_level(&mut self, level: u8) -> i64 {
        if self.hold < self.hold_limit {
            self.hold += 1;
            self.adjustment = 0;
            return 0;
        }

        self.adjustment = if level > self.config.high_watermark {
            -self.config.quantum_bytes
        } else if level < self.config.low_watermark {
            self.config.quantum_bytes
        } else {
            0
        };

        if self.adjustment != 0 {
            self.hold = 0;
            self.hold_limit = self.config.settle_observations;
            self.corrections += 1;
            log::debug!(
                "DAC FIFO level {level:#04x}, adjusting next transfer by {}",
                self.adjustment
            );
        }
        self.adjustment
    }

    /// Re-derives the byte rate from a measured board clock and returns the
    /// resulting sample rate.
    pub fn set_clock_rate(&mut self, clock_hz: u32) -> u32 {
        let rate = divided_rate(clock_hz, self.divider);
        self.bytes_per_sec = tx_bytes_per_sec(rate, self.channels);
        rate
    }

    pub fn nominal_transfer_bytes(&self, n_packets: usize) -> u64 {
        self.bytes_per_sec * n_packets as u64 / PACKETS_PER_SEC as u64
    }

    /// Sizes the next transfer, consuming any pending FIFO correction.
    /// `lengths` receives the per-packet split; the total is returned.
    pub fn next_transfer(&mut self, lengths: &mut [usize]) -> usize {
        let adj = std::mem::take(&mut self.adjustment);
        self.plan(lengths, adj)
    }

    /// Sizes a transfer with `extra` bytes on top of nominal, leaving any
    /// pending correction for the following transfer.
    pub fn prime_transfer(&mut self, lengths: &mut [usize], extra: i64) -> usize {
        self.plan(lengths, extra)
    }

    fn plan(&mut self, lengths: &mut [usize], extra: i64) -> usize {
        let n = lengths.len();
        if n == 0 {
            return 0;
        }
        let frame = FRAME_BYTES as i64;
        let mut total = (self.nominal_transfer_bytes(n) as i64 + extra + self.frame_remain).max(0);
        self.frame_remain = total % frame;
        total -= self.frame_remain;

        let total = total as usize;
        let len0 = total / n;
        lengths.iter_mut().for_each(|l| *l = len0);
        lengths[0] = total - len0 * (n - 1);
        total
    }

    /// Counts completed packets and reports which status queries are due.
    pub fn record_packets(&mut self, n: u32) -> StatusChecks {
        let mut checks = StatusChecks::default();
        self.fifo_packets += n;
        self.clock_packets += n;
        if self.fifo_packets >= self.config.fifo_check_packets {
            self.fifo_packets = 0;
            checks.fifo = true;
        }
        if self.clock_packets >= self.config.clock_check_packets {
            self.clock_packets = 0;
            checks.clock = true;
        }
        checks
    }
}

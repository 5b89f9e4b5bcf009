//! Pulse shaping for a BPSK test signal.

use std::f32::consts::PI;

use crate::blkconv::BlockConvolver;
use crate::error::{Result, SfeError};

/// Symbol amplitude that keeps the shaped waveform inside the DAC range.
pub const DEFAULT_SCALE: f32 = 0.85 / 1.35;

/// Root-raised-cosine taps, `sps` samples per symbol and roll-off `beta`,
/// scaled so the centre tap is 1.
pub fn root_raised_cosine(n_taps: usize, sps: usize, beta: f32) -> Vec<f32> {
    let centre = (n_taps as f32 - 1.0) / 2.0;
    let peak = 1.0 - beta + 4.0 * beta / PI;

    (0..n_taps)
        .map(|i| {
            let t = (i as f32 - centre) / sps as f32;
            let h = if t.abs() < 1e-6 {
                peak
            } else if beta > 0.0 && ((4.0 * beta * t).abs() - 1.0).abs() < 1e-5 {
                let a = PI / (4.0 * beta);
                beta / 2f32.sqrt() * ((1.0 + 2.0 / PI) * a.sin() + (1.0 - 2.0 / PI) * a.cos())
            } else {
                let num = (PI * t * (1.0 - beta)).sin() + 4.0 * beta * t * (PI * t * (1.0 + beta)).cos();
                let den = PI * t * (1.0 - (4.0 * beta * t).powi(2));
                num / den
            };
            h / peak
        })
        .collect()
}

/// Turns a bit stream into a shaped BPSK baseband, one filter block at a
/// time. Symbols straddling a block boundary are finished at the start of
/// the next block.
pub struct BpskModulator {
    filter: BlockConvolver,
    sps: usize,
    scale: f32,
    phase: usize,
}

impl BpskModulator {
    pub fn new(taps: &[f32], fft_len: usize, sps: usize) -> Result<Self> {
        if sps == 0 {
            return Err(SfeError::Contract("samples per symbol must be non-zero"));
        }
        Ok(Self {
            filter: BlockConvolver::new(taps, fft_len)?,
            sps,
            scale: DEFAULT_SCALE,
            phase: 0,
        })
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn block_size(&self) -> usize {
        self.filter.block_size()
    }

    /// Produces the next shaped block. A set bit maps to `-scale`, a clear
    /// bit to `+scale`; once `bits` runs dry the remaining symbols are
    /// silent.
    pub fn modulate<I>(&mut self, bits: &mut I) -> &[f32]
    where
        I: Iterator<Item = bool>,
    {
        let (sps, scale) = (self.sps, self.scale);
        let mut phase = self.phase;
        for x in self.filter.block_mut() {
            *x = if phase == 0 {
                match bits.next() {
                    Some(true) => -scale,
                    Some(false) => scale,
                    None => 0.0,
                }
            } else {
                0.0
            };
            phase = (phase + 1) % sps;
        }
        self.phase = phase;

        self.filter.process();
        self.filter.block()
    }

    pub fn reset(&mut self) {
        self.phase = 0;
        self.filter.reset();
    }
}

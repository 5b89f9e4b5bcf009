use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::{Result, SfeError};

/// Overlap-add FIR filter evaluated in the frequency domain.
///
/// The filter owns its processing block: fill [`block_mut`](Self::block_mut)
/// with exactly [`block_size`](Self::block_size) samples, call
/// [`process`](Self::process), and read the filtered samples back from the
/// same buffer. Consecutive blocks form one continuous stream; the
/// `n_taps - 1` sample tail of each block is carried into the next.
pub struct BlockConvolver {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    taps_spectrum: Vec<Complex32>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
    block: Vec<f32>,
    overlap: Vec<f32>,
    scaling: f32,
    fft_len: usize,
    blk_size: usize,
}

impl BlockConvolver {
    pub fn new(taps: &[f32], fft_len: usize) -> Result<Self> {
        if taps.is_empty() || taps.len() > fft_len {
            return Err(SfeError::Contract("tap count must be in 1..=fft_len"));
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        let mut scratch = vec![Complex32::default(); scratch_len];

        let mut taps_spectrum = vec![Complex32::default(); fft_len];
        for (bin, &t) in taps_spectrum.iter_mut().zip(taps) {
            bin.re = t;
        }
        fft.process_with_scratch(&mut taps_spectrum, &mut scratch);

        let blk_size = fft_len + 1 - taps.len();
        log::debug!(
            "block convolver: {} taps, fft {}, block {}",
            taps.len(),
            fft_len,
            blk_size
        );

        Ok(Self {
            fft,
            ifft,
            taps_spectrum,
            work: vec![Complex32::default(); fft_len],
            scratch,
            block: vec![0.0; blk_size],
            overlap: vec![0.0; taps.len() - 1],
            scaling: 1.0 / fft_len as f32,
            fft_len,
            blk_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.blk_size
    }

    pub fn fft_len(&self) -> usize {
        self.fft_len
    }

    pub fn block(&self) -> &[f32] {
        &self.block
    }

    pub fn block_mut(&mut self) -> &mut [f32] {
        &mut self.block
    }

    /// Forgets the carried tail, as if the stream restarted.
    pub fn reset(&mut self) {
        self.overlap.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Filters the internal block in place.
    pub fn process(&mut self) {
        for (w, &x) in self.work.iter_mut().zip(&self.block) {
            *w = Complex32::new(x, 0.0);
        }
        for w in &mut self.work[self.blk_size..] {
            *w = Complex32::default();
        }

        self.fft
            .process_with_scratch(&mut self.work, &mut self.scratch);

        for (w, h) in self.work.iter_mut().zip(&self.taps_spectrum) {
            *w = *w * *h * self.scaling;
        }

        self.ifft
            .process_with_scratch(&mut self.work, &mut self.scratch);

        // Overlap-add: the old tail lands on the head of this block before
        // the new tail is taken from the end of it.
        for (w, &o) in self.work.iter_mut().zip(&self.overlap) {
            w.re += o;
        }
        for (o, w) in self.overlap.iter_mut().zip(&self.work[self.blk_size..]) {
            *o = w.re;
        }
        for (x, w) in self.block.iter_mut().zip(&self.work) {
            *x = w.re;
        }
    }

    /// Copies `samples` in, filters, and copies the result back out.
    pub fn process_block(&mut self, samples: &mut [f32]) -> Result<()> {
        if samples.len() != self.blk_size {
            return Err(SfeError::Contract("block length must equal block_size"));
        }
        self.block.copy_from_slice(samples);
        self.process();
        samples.copy_from_slice(&self.block);
        Ok(())
    }
}

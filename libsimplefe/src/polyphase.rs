//! Arbitrary-ratio rate conversion on a polyphase filter bank.
//!
//! The prototype filter is designed at `n_phase` times the input rate. Phase
//! `p` of the bank evaluated at input index `n` gives the interpolated
//! signal at high-rate position `n * n_phase + p`. A fractional cursor walks
//! those positions, `rate * n_phase` per output sample, and linearly
//! interpolates between the two positions either side of it.
//!
//! `rate` is the number of input samples consumed per output sample:
//! `rate < 1` interpolates, `rate > 1` decimates.

use crate::error::{Result, SfeError};

/// A prototype filter split into `n_phase` interleaved sub-filters.
#[derive(Debug, Clone)]
pub struct PhaseBank {
    phases: Vec<Vec<f32>>,
    phase_len: usize,
}

impl PhaseBank {
    pub fn new(taps: &[f32], n_phase: usize) -> Result<Self> {
        if taps.is_empty() || n_phase == 0 {
            return Err(SfeError::Contract("phase bank needs taps and at least one phase"));
        }
        let phase_len = taps.len().div_ceil(n_phase);
        let phases = (0..n_phase)
            .map(|p| {
                (0..phase_len)
                    .map(|i| taps.get(i * n_phase + p).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        Ok(Self { phases, phase_len })
    }

    pub fn n_phase(&self) -> usize {
        self.phases.len()
    }

    pub fn phase_len(&self) -> usize {
        self.phase_len
    }

    pub fn taps(&self, phase: usize) -> &[f32] {
        &self.phases[phase]
    }
}

/// Playback position in high-rate units, kept relative to the start of the
/// next input block.
#[derive(Debug, Default, Clone)]
struct Cursor {
    pos: i64,
    mu: f64,
    /// First interpolation endpoint of a sample whose second endpoint lies in
    /// the next block.
    leftover: Option<f32>,
}

impl Cursor {
    /// Emits every output whose interpolation endpoints fall inside the
    /// current block of `n_in` inputs. `sample(phase, n)` yields the bank
    /// output for `phase` at input index `n` of the current block.
    fn run<F>(&mut self, n_in: usize, n_phase: usize, step: f64, out: &mut [f32], sample: F) -> usize
    where
        F: Fn(usize, usize) -> f32,
    {
        let n_phase_i = n_phase as i64;
        let n_in_i = n_in as i64;
        let mut n_out = 0;
        let mut t = self.pos as f64 + self.mu;

        if let Some(last) = self.leftover.take() {
            let mu = self.mu as f32;
            out[n_out] = last * (1.0 - mu) + mu * sample(0, 0);
            n_out += 1;
            t += step;
        }

        loop {
            let pos0 = t.floor() as i64;
            let mu = t - pos0 as f64;
            let pos1 = pos0 + 1;
            let n0 = pos0 / n_phase_i;
            let n1 = pos1 / n_phase_i;
            let phase0 = (pos0 % n_phase_i) as usize;
            let phase1 = (pos1 % n_phase_i) as usize;

            self.pos = pos0;
            self.mu = mu;
            if n0 >= n_in_i {
                break;
            }
            if n1 >= n_in_i {
                self.leftover = Some(sample(phase0, n0 as usize));
                break;
            }

            let mu32 = mu as f32;
            out[n_out] =
                sample(phase0, n0 as usize) * (1.0 - mu32) + mu32 * sample(phase1, n1 as usize);
            n_out += 1;
            t += step;
        }

        self.pos -= n_in_i * n_phase_i;
        n_out
    }
}

/// Common interface of the two converter flavours.
pub trait PathConverter {
    /// Converts `input`, writing the produced samples to the head of
    /// `output` and returning how many were produced.
    fn process(&mut self, input: &[f32], output: &mut [f32], rate: f32) -> Result<usize>;

    /// Output capacity `process` requires for `n_in` inputs at `rate`.
    fn max_output_len(&self, n_in: usize, rate: f32) -> usize;

    fn reset(&mut self);
}

fn output_bound(n_in: usize, n_phase: usize, rate: f32) -> usize {
    let step = rate as f64 * n_phase as f64;
    ((n_in * n_phase) as f64 / step).ceil() as usize + 1
}

fn check_call(
    n_in: usize,
    blksize: usize,
    out_len: usize,
    rate: f32,
    min_rate: f32,
    bound: usize,
) -> Result<()> {
    if !rate.is_finite() || rate < min_rate {
        return Err(SfeError::Contract("conversion rate below the supported minimum"));
    }
    if n_in > blksize {
        return Err(SfeError::Contract("input block larger than blksize"));
    }
    if out_len < bound {
        return Err(SfeError::Contract("output buffer too small for requested rate"));
    }
    Ok(())
}

/// Resampler for `rate >= 1 / n_phase`. Every phase is evaluated for every
/// input sample, which pays off when several outputs land on each input.
pub struct Resampler {
    bank: PhaseBank,
    history: Vec<f32>,
    phase_out: Vec<Vec<f32>>,
    cursor: Cursor,
    blksize: usize,
}

impl Resampler {
    pub fn new(taps: &[f32], upsample: usize, blksize: usize) -> Result<Self> {
        let bank = PhaseBank::new(taps, upsample)?;
        let history = vec![0.0; bank.phase_len() - 1];
        let phase_out = vec![vec![0.0; blksize]; upsample];
        Ok(Self {
            bank,
            history,
            phase_out,
            cursor: Cursor::default(),
            blksize,
        })
    }

    pub fn bank(&self) -> &PhaseBank {
        &self.bank
    }

    fn filter_block(&mut self, input: &[f32]) {
        for (i, &x) in input.iter().enumerate() {
            for (taps, out) in self.bank.phases.iter().zip(self.phase_out.iter_mut()) {
                let mut accu = taps[0] * x;
                for (h, past) in taps[1..].iter().zip(&self.history) {
                    accu += h * past;
                }
                out[i] = accu;
            }
            if !self.history.is_empty() {
                let last = self.history.len() - 1;
                self.history.copy_within(0..last, 1);
                self.history[0] = x;
            }
        }
    }
}

impl PathConverter for Resampler {
    fn process(&mut self, input: &[f32], output: &mut [f32], rate: f32) -> Result<usize> {
        let n_phase = self.bank.n_phase();
        check_call(
            input.len(),
            self.blksize,
            output.len(),
            rate,
            1.0 / n_phase as f32,
            self.max_output_len(input.len(), rate),
        )?;
        if input.is_empty() {
            return Ok(0);
        }

        self.filter_block(input);
        let phase_out = &self.phase_out;
        let step = rate as f64 * n_phase as f64;
        Ok(self
            .cursor
            .run(input.len(), n_phase, step, output, |p, n| phase_out[p][n]))
    }

    fn max_output_len(&self, n_in: usize, rate: f32) -> usize {
        output_bound(n_in, self.bank.n_phase(), rate)
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|v| *v = 0.0);
        self.cursor = Cursor::default();
    }
}

/// Decimator for `rate >= 1`. Keeps a window of raw input history and only
/// evaluates the phases the cursor actually lands on.
pub struct Decimator {
    bank: PhaseBank,
    history: Vec<f32>,
    cursor: Cursor,
    blksize: usize,
}

impl Decimator {
    pub fn new(taps: &[f32], upsample: usize, blksize: usize) -> Result<Self> {
        let bank = PhaseBank::new(taps, upsample)?;
        let history = vec![0.0; bank.phase_len() + blksize];
        Ok(Self {
            bank,
            history,
            cursor: Cursor::default(),
            blksize,
        })
    }

    pub fn bank(&self) -> &PhaseBank {
        &self.bank
    }
}

impl PathConverter for Decimator {
    fn process(&mut self, input: &[f32], output: &mut [f32], rate: f32) -> Result<usize> {
        let n_in = input.len();
        check_call(
            n_in,
            self.blksize,
            output.len(),
            rate,
            1.0,
            self.max_output_len(n_in, rate),
        )?;
        if n_in == 0 {
            return Ok(0);
        }

        let len = self.history.len();
        self.history.copy_within(n_in.., 0);
        self.history[len - n_in..].copy_from_slice(input);

        let n_phase = self.bank.n_phase();
        let base = len - n_in;
        let history = &self.history;
        let bank = &self.bank;
        let sample = |phase: usize, n: usize| -> f32 {
            bank.taps(phase)
                .iter()
                .enumerate()
                .map(|(j, h)| h * history[base + n - j])
                .sum()
        };
        let step = rate as f64 * n_phase as f64;
        Ok(self.cursor.run(n_in, n_phase, step, output, sample))
    }

    fn max_output_len(&self, n_in: usize, rate: f32) -> usize {
        output_bound(n_in, self.bank.n_phase(), rate)
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|v| *v = 0.0);
        self.cursor = Cursor::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_signal(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn lowpass(n_taps: usize, n_phase: usize) -> Vec<f32> {
        let centre = (n_taps - 1) as f32 / 2.0;
        (0..n_taps)
            .map(|i| {
                let x = (i as f32 - centre) / n_phase as f32;
                let sinc = if x == 0.0 {
                    1.0
                } else {
                    (std::f32::consts::PI * x).sin() / (std::f32::consts::PI * x)
                };
                let w = 0.54
                    - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (n_taps - 1) as f32).cos();
                sinc * w
            })
            .collect()
    }

    fn run_chunked<C: PathConverter>(conv: &mut C, input: &[f32], chunk: usize, rate: f32) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0.0; conv.max_output_len(chunk, rate)];
        for block in input.chunks(chunk) {
            let n = conv.process(block, &mut buf, rate).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len(), "output lengths differ");
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "sample {i}: {x} vs {y}");
        }
    }

    #[test]
    fn bank_splits_taps_by_phase() {
        let taps: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let bank = PhaseBank::new(&taps, 4).unwrap();
        assert_eq!(bank.phase_len(), 3);
        assert_eq!(bank.taps(0), &[0.0, 4.0, 8.0]);
        assert_eq!(bank.taps(1), &[1.0, 5.0, 9.0]);
        assert_eq!(bank.taps(2), &[2.0, 6.0, 0.0]);
        assert_eq!(bank.taps(3), &[3.0, 7.0, 0.0]);
    }

    #[test]
    fn unit_step_reproduces_full_rate_fir() {
        let n_phase = 4;
        let taps = lowpass(31, n_phase);
        let input = random_signal(64, 7);
        let mut rs = Resampler::new(&taps, n_phase, 64).unwrap();

        let mut out = vec![0.0; rs.max_output_len(64, 0.25)];
        let n = rs.process(&input, &mut out, 0.25).unwrap();
        // The last high-rate position waits for the next block.
        assert_eq!(n, 64 * n_phase - 1);

        let mut stuffed = vec![0.0; 64 * n_phase];
        for (i, x) in input.iter().enumerate() {
            stuffed[i * n_phase] = *x;
        }
        let expected: Vec<f32> = (0..n)
            .map(|m| {
                taps.iter()
                    .enumerate()
                    .filter(|(k, _)| *k <= m)
                    .map(|(k, h)| h * stuffed[m - k])
                    .sum()
            })
            .collect();
        assert_close(&out[..n], &expected, 1e-5);
    }

    #[test]
    fn unit_rate_runs_the_zero_phase_filter() {
        let taps = lowpass(23, 3);
        let input = random_signal(40, 8);
        let bank = PhaseBank::new(&taps, 3).unwrap();
        let expected: Vec<f32> = (0..input.len())
            .map(|n| {
                bank.taps(0)
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j <= n)
                    .map(|(j, h)| h * input[n - j])
                    .sum()
            })
            .collect();

        let mut rs = Resampler::new(&taps, 3, 40).unwrap();
        let mut dec = Decimator::new(&taps, 3, 40).unwrap();
        let a = run_chunked(&mut rs, &input, 40, 1.0);
        let b = run_chunked(&mut dec, &input, 40, 1.0);
        assert_close(&a, &expected, 1e-5);
        assert_close(&b, &expected, 1e-5);
    }

    #[test]
    fn resampler_single_sample_blocks_match_one_block() {
        let taps = lowpass(48, 4);
        let input = random_signal(200, 9);
        for rate in [0.375f32, 0.8125, 1.5] {
            let mut whole = Resampler::new(&taps, 4, 200).unwrap();
            let mut single = Resampler::new(&taps, 4, 200).unwrap();
            let a = run_chunked(&mut whole, &input, 200, rate);
            let b = run_chunked(&mut single, &input, 1, rate);
            assert!(!a.is_empty());
            assert_close(&a, &b, 1e-6);
        }
    }

    #[test]
    fn decimator_single_sample_blocks_match_one_block() {
        let taps = lowpass(64, 8);
        let input = random_signal(300, 10);
        for rate in [1.0f32, 2.5, 3.125] {
            let mut whole = Decimator::new(&taps, 8, 300).unwrap();
            let mut single = Decimator::new(&taps, 8, 300).unwrap();
            let a = run_chunked(&mut whole, &input, 300, rate);
            let b = run_chunked(&mut single, &input, 1, rate);
            assert!(!a.is_empty());
            assert_close(&a, &b, 1e-6);
        }
    }

    #[test]
    fn ragged_blocks_match_one_block() {
        let taps = lowpass(40, 5);
        let input = random_signal(257, 11);
        let mut whole = Resampler::new(&taps, 5, 257).unwrap();
        let a = run_chunked(&mut whole, &input, 257, 0.6);

        let mut ragged = Resampler::new(&taps, 5, 64).unwrap();
        let mut b = Vec::new();
        let mut buf = vec![0.0; ragged.max_output_len(64, 0.6)];
        let mut rest = &input[..];
        let mut size = 1;
        while !rest.is_empty() {
            let take = size.min(rest.len());
            let n = ragged.process(&rest[..take], &mut buf, 0.6).unwrap();
            b.extend_from_slice(&buf[..n]);
            rest = &rest[take..];
            size = size % 13 + 5;
        }
        // 0.6 * 5 = 3.0 is exact, so both walks visit identical positions.
        assert_close(&a, &b, 1e-6);
    }

    #[test]
    fn output_count_follows_rate() {
        let taps = lowpass(32, 4);
        let mut dec = Decimator::new(&taps, 4, 1000).unwrap();
        let input = random_signal(1000, 12);
        let out = run_chunked(&mut dec, &input, 1000, 4.0);
        assert_eq!(out.len(), 250);

        let mut rs = Resampler::new(&taps, 4, 1000).unwrap();
        let out = run_chunked(&mut rs, &input, 100, 0.5);
        // Even positions never straddle an input boundary, so nothing is
        // parked at block ends.
        assert_eq!(out.len(), 2000);
    }

    #[test]
    fn contract_violations_produce_nothing() {
        let taps = lowpass(16, 4);
        let mut rs = Resampler::new(&taps, 4, 8).unwrap();
        let mut dec = Decimator::new(&taps, 4, 8).unwrap();
        let input = [0.5f32; 8];
        let mut small = [0.0f32; 4];
        let mut big = [0.0f32; 64];

        assert!(rs.process(&input, &mut small, 0.5).is_err());
        assert!(rs.process(&input, &mut big, 0.2).is_err());
        assert!(rs.process(&[0.0; 9], &mut big, 1.0).is_err());
        assert!(dec.process(&input, &mut big, 0.9).is_err());
        assert!(dec.process(&input, &mut big, f32::NAN).is_err());

        // The rejected calls left no trace in the filter state.
        let mut fresh = Resampler::new(&taps, 4, 8).unwrap();
        let mut a = [0.0f32; 64];
        let mut b = [0.0f32; 64];
        let na = rs.process(&input, &mut a, 0.5).unwrap();
        let nb = fresh.process(&input, &mut b, 0.5).unwrap();
        assert_eq!(na, nb);
        assert_eq!(a, b);
    }
}

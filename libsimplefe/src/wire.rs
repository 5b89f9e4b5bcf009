//! Sample formats exchanged with the simpleFE.
//!
//! TX: four 10-bit DAC codes per 5-byte frame. Byte 0 carries the top two
//! bits of each code (code 0 in bits 1:0, code 3 in bits 7:6); bytes 1..=4
//! carry the low eight bits of codes 0..=3.
//!
//! RX: one offset-binary byte per ADC value, I and Q interleaved for complex
//! streams.

use num_complex::Complex32;

use crate::ring_buffer::Conversion;

pub const FRAME_BYTES: usize = 5;
pub const VALUES_PER_FRAME: usize = 4;

const DAC_SCALE: f32 = 511.0;
const DAC_BIAS: i16 = 512;
const DAC_MASK: u16 = 0x3FF;
const ADC_INV_SCALE: f32 = 1.0 / 127.0;

/// Four mid-scale codes: what the DAC outputs for 0.0.
pub const SILENCE_FRAME: [u8; FRAME_BYTES] = [0xAA, 0x00, 0x00, 0x00, 0x00];

/// Quantizes a value in [-1, 1) to a 10-bit DAC code.
#[inline]
pub fn quantize(x: f32) -> u16 {
    ((x * DAC_SCALE) as i16).wrapping_add(DAC_BIAS) as u16 & DAC_MASK
}

/// Maps a DAC code back to the centre of its quantization bin, so that
/// `quantize(dequantize(c)) == c` holds for every code.
#[inline]
pub fn dequantize(code: u16) -> f32 {
    let k = (code & DAC_MASK) as i16 - DAC_BIAS;
    let centre = match k {
        0 => 0.0,
        k if k > 0 => k as f32 + 0.5,
        k => k as f32 - 0.5,
    };
    centre / DAC_SCALE
}

#[inline]
pub fn pack_frame(codes: [u16; 4]) -> [u8; 5] {
    let [u0, u1, u2, u3] = codes;
    [
        ((u0 >> 8) | ((u1 >> 8) << 2) | ((u2 >> 8) << 4) | ((u3 >> 8) << 6)) as u8,
        (u0 & 0xFF) as u8,
        (u1 & 0xFF) as u8,
        (u2 & 0xFF) as u8,
        (u3 & 0xFF) as u8,
    ]
}

#[inline]
pub fn unpack_frame(frame: &[u8]) -> [u16; 4] {
    let hi = frame[0] as u16;
    [
        ((hi & 0x03) << 8) | frame[1] as u16,
        (((hi >> 2) & 0x03) << 8) | frame[2] as u16,
        (((hi >> 4) & 0x03) << 8) | frame[3] as u16,
        (((hi >> 6) & 0x03) << 8) | frame[4] as u16,
    ]
}

/// Packs real values, four per frame. A trailing partial frame is ignored.
/// Returns the number of bytes written.
pub fn pack_real(dst: &mut [u8], src: &[f32]) -> usize {
    let mut j = 0;
    for (quad, out) in src
        .chunks_exact(VALUES_PER_FRAME)
        .zip(dst.chunks_exact_mut(FRAME_BYTES))
    {
        out.copy_from_slice(&pack_frame([
            quantize(quad[0]),
            quantize(quad[1]),
            quantize(quad[2]),
            quantize(quad[3]),
        ]));
        j += FRAME_BYTES;
    }
    j
}

/// Packs complex samples, two per frame (I0, Q0, I1, Q1).
pub fn pack_complex(dst: &mut [u8], src: &[Complex32]) -> usize {
    let mut j = 0;
    for (pair, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(FRAME_BYTES)) {
        out.copy_from_slice(&pack_frame([
            quantize(pair[0].re),
            quantize(pair[0].im),
            quantize(pair[1].re),
            quantize(pair[1].im),
        ]));
        j += FRAME_BYTES;
    }
    j
}

/// Inverse of [`pack_real`]; returns the number of values written.
pub fn unpack_real(dst: &mut [f32], src: &[u8]) -> usize {
    let mut j = 0;
    for (frame, out) in src
        .chunks_exact(FRAME_BYTES)
        .zip(dst.chunks_exact_mut(VALUES_PER_FRAME))
    {
        for (o, code) in out.iter_mut().zip(unpack_frame(frame)) {
            *o = dequantize(code);
        }
        j += VALUES_PER_FRAME;
    }
    j
}

/// Fills `dst` with silence frames.
pub fn fill_silence(dst: &mut [u8]) {
    for frame in dst.chunks_mut(FRAME_BYTES) {
        frame.copy_from_slice(&SILENCE_FRAME[..frame.len()]);
    }
}

#[inline]
pub fn decode_adc(byte: u8) -> f32 {
    (byte as f32 - 128.0) * ADC_INV_SCALE
}

/// Converts real samples from the ring into TX wire bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealToWire;

impl Conversion<f32> for RealToWire {
    type Output = u8;
    const GRANULE: usize = VALUES_PER_FRAME;

    fn source_len(&self, dst_len: usize) -> usize {
        dst_len / FRAME_BYTES * VALUES_PER_FRAME
    }

    fn convert(&self, dst: &mut [u8], src: &[f32]) -> usize {
        pack_real(dst, src)
    }
}

/// Converts complex samples from the ring into TX wire bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComplexToWire;

impl Conversion<Complex32> for ComplexToWire {
    type Output = u8;
    const GRANULE: usize = 2;

    fn source_len(&self, dst_len: usize) -> usize {
        dst_len / FRAME_BYTES * 2
    }

    fn convert(&self, dst: &mut [u8], src: &[Complex32]) -> usize {
        pack_complex(dst, src)
    }
}

/// Decodes buffered RX bytes (I, Q interleaved) into complex samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireToComplex;

impl Conversion<u8> for WireToComplex {
    type Output = Complex32;
    const GRANULE: usize = 2;

    fn source_len(&self, dst_len: usize) -> usize {
        dst_len * 2
    }

    fn convert(&self, dst: &mut [Complex32], src: &[u8]) -> usize {
        let mut j = 0;
        for (pair, out) in src.chunks_exact(2).zip(dst.iter_mut()) {
            *out = Complex32::new(decode_adc(pair[0]), decode_adc(pair[1]));
            j += 1;
        }
        j
    }
}

/// Decodes buffered RX bytes of a single-lane stream into real samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireToReal;

impl Conversion<u8> for WireToReal {
    type Output = f32;

    fn source_len(&self, dst_len: usize) -> usize {
        dst_len
    }

    fn convert(&self, dst: &mut [f32], src: &[u8]) -> usize {
        for (out, b) in dst.iter_mut().zip(src) {
            *out = decode_adc(*b);
        }
        src.len().min(dst.len())
    }
}

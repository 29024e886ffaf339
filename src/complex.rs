//! IQ sample types and the hardware wire-format conversion

use byte_slice_cast::AsSliceOf;
use num_complex::{Complex, Complex64};

/// A single IQ sample as stored in the ring buffer and fed to the estimator
pub type IqSample = Complex64;

/// The raw sample type off the wire: interleaved signed 8-bit I/Q
pub type ComplexByte = Complex<i8>;

/// Full-scale magnitude of one signed 8-bit component
pub const FULL_SCALE: f64 = 128.0;

pub fn byte_to_iq(cb: ComplexByte) -> IqSample {
    Complex64::new(cb.re as f64 / FULL_SCALE, cb.im as f64 / FULL_SCALE)
}

/// Convert whole I/Q pairs, ignoring a trailing odd byte
pub fn iq_from_bytes(bytes: &[u8]) -> Vec<IqSample> {
    // Reinterpreting u8 as i8 can never fail on alignment or length
    let signed = bytes.as_slice_of::<i8>().unwrap_or(&[]);
    signed
        .chunks_exact(2)
        .map(|pair| byte_to_iq(ComplexByte::new(pair[0], pair[1])))
        .collect()
}

/// Streaming converter that carries a split I/Q pair across reads.
///
/// Pipe reads return arbitrary byte counts, so a read can end between the
/// I and Q byte of a sample.
#[derive(Debug, Default)]
pub struct IqDecoder {
    pending: Option<u8>,
}

impl IqDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Vec<IqSample> {
        let mut out = Vec::with_capacity((bytes.len() + 1) / 2);
        let mut rest = bytes;
        if let Some(i) = self.pending.take() {
            match rest.split_first() {
                Some((&q, tail)) => {
                    out.push(byte_to_iq(ComplexByte::new(i as i8, q as i8)));
                    rest = tail;
                }
                None => {
                    self.pending = Some(i);
                    return out;
                }
            }
        }
        let whole = rest.len() & !1;
        out.extend(iq_from_bytes(&rest[..whole]));
        if whole < rest.len() {
            self.pending = Some(rest[whole]);
        }
        out
    }
}

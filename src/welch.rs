//! Welch power-spectral-density estimation over blocks of IQ samples.
//!
//! The input is split into Hann-windowed segments of `nperseg` samples with
//! 50% overlap, each segment is transformed, and the per-bin power is
//! averaged. Segments are not detrended.

use std::{f64::consts::PI, fmt, str::FromStr, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    complex::IqSample,
    error::{Error, Result},
};

/// Used in place of a zero or negative resolution bandwidth
pub const DEFAULT_RBW_HZ: f64 = 10_000.0;
pub const DEFAULT_IMPEDANCE_OHMS: f64 = 50.0;
/// Longest segment, a 2^20-point FFT
pub const MAX_NPERSEG: usize = 1 << 20;
/// Fraction of each segment shared with the next
pub const OVERLAP: f64 = 0.5;
/// Samples are normalised to unit full scale before estimation
const FULL_SCALE_POWER: f64 = 1.0;
// Keeps log10 finite for bins with exactly zero power
const POWER_FLOOR: f64 = 1e-20;

/// Output scale of the power array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scale {
    Db,
    #[default]
    Dbm,
    Dbfs,
    V2PerHz,
}

impl FromStr for Scale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dB" => Ok(Scale::Db),
            "dBm" => Ok(Scale::Dbm),
            "dBFS" => Ok(Scale::Dbfs),
            "V2/Hz" | "V²/Hz" => Ok(Scale::V2PerHz),
            other => Err(Error::UnknownScale(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Scale {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Scale> for String {
    fn from(scale: Scale) -> Self {
        scale.to_string()
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scale::Db => "dB",
            Scale::Dbm => "dBm",
            Scale::Dbfs => "dBFS",
            Scale::V2PerHz => "V2/Hz",
        })
    }
}

/// Frequency axis and matching power array
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

/// Smallest power of two that is at least `x` (and at least 1), `None` past `usize`
pub fn next_power_of_two(x: f64) -> Option<usize> {
    if x <= 1.0 {
        return Some(1);
    }
    if !(x <= usize::MAX as f64) {
        return None;
    }
    (x.ceil() as usize).checked_next_power_of_two()
}

/// Segment length giving a resolution bandwidth of at most `rbw`.
/// Fails when that would take more than [`MAX_NPERSEG`] samples.
pub fn nperseg(fs: f64, rbw: f64) -> Result<usize> {
    match next_power_of_two(fs / rbw) {
        Some(n) if n <= MAX_NPERSEG => Ok(n),
        _ => Err(Error::InvalidArgument(format!(
            "resolution bandwidth {rbw} Hz at {fs} Hz needs more than {MAX_NPERSEG} samples per segment"
        ))),
    }
}

fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    // Periodic form, as used for spectral analysis
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

pub struct WelchEstimator {
    center_freq: f64,
    fs: f64,
    rbw: f64,
    impedance: f64,
    with_shift: bool,
    nperseg: usize,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for WelchEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WelchEstimator")
            .field("center_freq", &self.center_freq)
            .field("fs", &self.fs)
            .field("rbw", &self.rbw)
            .field("impedance", &self.impedance)
            .field("with_shift", &self.with_shift)
            .field("nperseg", &self.nperseg)
            .finish()
    }
}

impl WelchEstimator {
    /// Build an estimator centred at `center_freq` with shifting enabled
    pub fn new(center_freq: f64, fs: f64, rbw: f64) -> Result<Self> {
        if !(fs.is_finite() && fs > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "sample rate must be positive, got {fs}"
            )));
        }
        let rbw = if rbw.is_finite() && rbw > 0.0 {
            rbw
        } else {
            warn!(rbw, fallback = DEFAULT_RBW_HZ, "Invalid resolution bandwidth");
            DEFAULT_RBW_HZ
        };
        let nperseg = nperseg(fs, rbw)?;
        let fft = FftPlanner::new().plan_fft_forward(nperseg);
        Ok(Self {
            center_freq,
            fs,
            rbw,
            impedance: DEFAULT_IMPEDANCE_OHMS,
            with_shift: true,
            nperseg,
            window: hann(nperseg),
            fft,
        })
    }

    pub fn with_shift(mut self, with_shift: bool) -> Self {
        self.with_shift = with_shift;
        self
    }

    pub fn with_impedance(mut self, ohms: f64) -> Result<Self> {
        if !(ohms.is_finite() && ohms > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "antenna impedance must be positive, got {ohms}"
            )));
        }
        self.impedance = ohms;
        Ok(self)
    }

    pub fn nperseg(&self) -> usize {
        self.nperseg
    }

    pub fn sample_rate(&self) -> f64 {
        self.fs
    }

    pub fn center_freq(&self) -> f64 {
        self.center_freq
    }

    pub fn rbw(&self) -> f64 {
        self.rbw
    }

    /// Width of one frequency bin in Hz
    pub fn bin_width(&self) -> f64 {
        self.fs / self.nperseg as f64
    }

    /// Averaged per-bin power, baseband ordered (`0..fs`)
    pub fn periodogram(&self, iq: &[IqSample]) -> Result<Vec<f64>> {
        let n = self.nperseg;
        if iq.len() < n {
            return Err(Error::InsufficientData {
                needed: n,
                available: iq.len(),
            });
        }
        if iq.iter().any(|s| !(s.re.is_finite() && s.im.is_finite())) {
            return Err(Error::InvalidPsd("non-finite input sample"));
        }
        let noverlap = (n as f64 * OVERLAP) as usize;
        let step = n - noverlap;
        let segments = (iq.len() - n) / step + 1;
        let win_sum: f64 = self.window.iter().sum();
        let norm = 1.0 / (win_sum * win_sum * segments as f64);

        let mut acc = vec![0f64; n];
        let mut buf = vec![Complex::new(0.0, 0.0); n];
        let mut scratch = vec![Complex::new(0.0, 0.0); self.fft.get_inplace_scratch_len()];
        for seg in 0..segments {
            let chunk = &iq[seg * step..seg * step + n];
            for ((b, s), w) in buf.iter_mut().zip(chunk).zip(&self.window) {
                *b = Complex::new(s.re * w, s.im * w);
            }
            self.fft.process_with_scratch(&mut buf, &mut scratch);
            for (a, b) in acc.iter_mut().zip(&buf) {
                *a += b.norm_sqr();
            }
        }
        acc.iter_mut().for_each(|a| *a *= norm);
        Ok(acc)
    }

    /// Run the estimate and apply `scale`.
    ///
    /// With shifting the axis runs `center - fs/2 .. center + fs/2`,
    /// otherwise it is baseband `0 .. fs`.
    pub fn estimate(&self, iq: &[IqSample], scale: Scale) -> Result<Spectrum> {
        let mut power = self.periodogram(iq)?;
        let n = self.nperseg;
        let df = self.bin_width();
        let freqs = if self.with_shift {
            power.rotate_right(n / 2);
            (0..n)
                .map(|k| self.center_freq + (k as f64 - (n / 2) as f64) * df)
                .collect()
        } else {
            (0..n).map(|k| k as f64 * df).collect()
        };
        self.apply_scale(&mut power, scale);
        Ok(Spectrum { freqs, power })
    }

    fn apply_scale(&self, power: &mut [f64], scale: Scale) {
        let df = self.bin_width();
        let r = self.impedance;
        for p in power.iter_mut() {
            let v = p.max(POWER_FLOOR);
            *p = match scale {
                Scale::Db => 10.0 * v.log10(),
                Scale::Dbm => 10.0 * (v / r).log10() + 30.0,
                Scale::Dbfs => 10.0 * (v / FULL_SCALE_POWER).log10(),
                Scale::V2PerHz => *p / df,
            };
        }
    }
}

//! Demodulation pipeline description.
//!
//! Nothing here touches samples. A [`Demodulator`] works out decimation and
//! filter parameters and emits an ordered list of [`Stage`]s that an external
//! `csdr`-style toolchain executes.

use std::{borrow::Cow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Audio sink used when none is given
pub const DEFAULT_AUDIO_SINK: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "FM")]
    Fm,
    #[serde(rename = "AM")]
    Am,
}

impl FromStr for SignalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FM" => Ok(SignalType::Fm),
            "AM" => Ok(SignalType::Am),
            other => Err(Error::UnknownSignalType(other.to_owned())),
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalType::Fm => "FM",
            SignalType::Am => "AM",
        })
    }
}

/// Characters allowed in an audio sink name, e.g. `hw:1,0` or `plughw:CARD=PCH`
fn is_sink_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | ',' | '.' | '-' | '=')
}

/// Audio sinks end up on a shell command line, so only plain device names pass
pub fn check_sink(sink: &str) -> Result<()> {
    if sink.is_empty() || !sink.chars().all(is_sink_char) {
        return Err(Error::InvalidArgument(format!("invalid audio sink {sink:?}")));
    }
    Ok(())
}

/// Quote `arg` for `sh` unless it is made only of characters the shell leaves alone
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = |c: char| c.is_ascii_alphanumeric() || "_-.,:/=+@%".contains(c);
    if !arg.is_empty() && arg.chars().all(plain) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// Render a number without exponent or trailing zeros (`10.0` -> `10`)
pub fn plain_number(x: f64) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    if x.fract() == 0.0 && x.abs() < 1e15 {
        return format!("{}", x as i64);
    }
    let s = format!("{x:.9}");
    s.trim_end_matches('0').trim_end_matches('.').to_owned()
}

/// One processing step of the external DSP chain
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Interleaved s8 IQ to float IQ
    ConvertS8ToF32,
    /// Frequency shift by `rate` cycles/sample
    Shift { rate: f64 },
    /// Low-pass FIR with the given normalised cutoff, then keep every `factor`th sample
    Decimate { factor: u32, cutoff: f64 },
    /// Quadrature FM discriminator
    FmQuadrature,
    /// Magnitude (envelope) detector
    AmEnvelope,
    /// DC removal
    DcBlock,
    /// Rational resampling of the audio stream
    Resample { interpolation: u32, decimation: u32 },
    /// Float audio to s16
    ConvertF32ToS16,
    /// Final playback. The default sink plays through `play`, a named ALSA
    /// device through `sox ... -t alsa <sink>`.
    AudioSink { rate: u32, sink: String },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ConvertS8ToF32 => "convert_s8_f",
            Stage::Shift { .. } => "shift_addition_cc",
            Stage::Decimate { .. } => "fir_decimate_cc",
            Stage::FmQuadrature => "fmdemod_quadri_cf",
            Stage::AmEnvelope => "amdemod_cf",
            Stage::DcBlock => "dcblock_ff",
            Stage::Resample { .. } => "rational_resampler_ff",
            Stage::ConvertF32ToS16 => "convert_f_s16",
            Stage::AudioSink { .. } => "play",
        }
    }

    /// Program and arguments for this stage
    pub fn argv(&self) -> Vec<String> {
        match self {
            Stage::Decimate { factor, cutoff } => vec![
                "csdr".into(),
                self.name().into(),
                factor.to_string(),
                plain_number(*cutoff),
                "HAMMING".into(),
            ],
            Stage::Shift { rate } => {
                vec!["csdr".into(), self.name().into(), plain_number(*rate)]
            }
            Stage::Resample {
                interpolation,
                decimation,
            } => vec![
                "csdr".into(),
                self.name().into(),
                interpolation.to_string(),
                decimation.to_string(),
            ],
            Stage::AudioSink { rate, sink } => {
                let program = if sink == DEFAULT_AUDIO_SINK { "play" } else { "sox" };
                let mut argv: Vec<String> = [program, "-q", "-t", "raw", "-r"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                argv.push(rate.to_string());
                argv.extend(
                    ["-e", "signed", "-b", "16", "-c", "1", "-"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                if sink != DEFAULT_AUDIO_SINK {
                    argv.extend(["-t".to_string(), "alsa".to_string(), sink.clone()]);
                }
                argv
            }
            _ => vec!["csdr".into(), self.name().into()],
        }
    }
}

/// Ordered stage list built for one run
#[derive(Debug, Clone, PartialEq)]
pub struct DemodPipeline {
    pub stages: Vec<Stage>,
}

impl DemodPipeline {
    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name() == name)
    }

    /// Serialise to a shell pipeline reading s8 IQ on stdin
    pub fn to_shell(&self) -> String {
        self.stages
            .iter()
            .map(|s| {
                s.argv()
                    .iter()
                    .map(|a| shell_quote(a))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl fmt::Display for DemodPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

#[derive(Debug, Clone)]
pub struct Demodulator {
    pub sample_rate: f64,
    pub bandwidth: f64,
    pub signal: String,
    pub target_rate: Option<f64>,
    /// Playback rate, the decimated rate when unset
    pub audio_rate: Option<u32>,
    /// Frequency of interest relative to the stream center, in Hz
    pub offset_hz: f64,
    pub sink: String,
}

impl Demodulator {
    /// `signal` is validated when the pipeline is built, not here
    pub fn new(sample_rate: f64, bandwidth: f64, signal: impl Into<String>) -> Self {
        Self {
            sample_rate,
            bandwidth,
            signal: signal.into(),
            target_rate: None,
            audio_rate: None,
            offset_hz: 0.0,
            sink: DEFAULT_AUDIO_SINK.to_owned(),
        }
    }

    pub fn decimate_to(mut self, rate: f64) -> Self {
        self.target_rate = Some(rate);
        self
    }

    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = sink.into();
        self
    }

    pub fn with_audio_rate(mut self, rate: u32) -> Self {
        self.audio_rate = Some(rate);
        self
    }

    /// Demodulate `freq` out of a stream centred on `center`
    pub fn tuned(mut self, freq: f64, center: f64) -> Self {
        self.offset_hz = freq - center;
        self
    }

    fn decimation_from(&self, divisor: f64, what: &str) -> Result<u32> {
        if !(divisor.is_finite() && divisor > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "{what} must be positive, got {divisor}"
            )));
        }
        let factor = (self.sample_rate / divisor).floor();
        if !(1.0..=u32::MAX as f64).contains(&factor) {
            return Err(Error::InvalidArgument(format!(
                "{what} {divisor} gives no valid decimation of {} Hz",
                self.sample_rate
            )));
        }
        Ok(factor as u32)
    }

    /// Decimation factor: against the explicit target rate when given,
    /// otherwise against the signal bandwidth
    pub fn decimation(&self) -> Result<u32> {
        match self.target_rate {
            Some(rate) => self.decimation_from(rate, "target rate"),
            None => self.decimation_from(self.bandwidth, "bandwidth"),
        }
    }

    pub fn output_rate(&self) -> Result<u32> {
        Ok((self.sample_rate / self.decimation()? as f64).round() as u32)
    }

    /// Rate fed to the audio sink
    pub fn playback_rate(&self) -> Result<u32> {
        match self.audio_rate {
            Some(0) => Err(Error::InvalidArgument(
                "audio rate must be positive".into(),
            )),
            Some(rate) => Ok(rate),
            None => self.output_rate(),
        }
    }

    /// Shift moving the frequency of interest to baseband, if it is off center
    fn shift(&self) -> Result<Option<Stage>> {
        if !self.offset_hz.is_finite() || self.offset_hz.abs() >= self.sample_rate / 2.0 {
            return Err(Error::InvalidArgument(format!(
                "offset {} Hz is outside the {} Hz stream",
                self.offset_hz, self.sample_rate
            )));
        }
        if self.offset_hz == 0.0 {
            return Ok(None);
        }
        Ok(Some(Stage::Shift {
            rate: -self.offset_hz / self.sample_rate,
        }))
    }

    pub fn build_pipeline(&self) -> Result<DemodPipeline> {
        let signal: SignalType = self.signal.parse()?;
        check_sink(&self.sink)?;
        let factor = self.decimation()?;
        let decimate = Stage::Decimate {
            factor,
            cutoff: fir_cutoff(factor),
        };
        let output_rate = self.output_rate()?;
        let playback_rate = self.playback_rate()?;
        let body = match signal {
            SignalType::Fm => vec![Stage::FmQuadrature, decimate],
            SignalType::Am => vec![Stage::AmEnvelope, Stage::DcBlock, decimate],
        };
        let mut stages = vec![Stage::ConvertS8ToF32];
        stages.extend(self.shift()?);
        stages.extend(body);
        if playback_rate != output_rate {
            let g = gcd(playback_rate, output_rate);
            stages.push(Stage::Resample {
                interpolation: playback_rate / g,
                decimation: output_rate / g,
            });
        }
        stages.push(Stage::ConvertF32ToS16);
        stages.push(Stage::AudioSink {
            rate: playback_rate,
            sink: self.sink.clone(),
        });
        Ok(DemodPipeline { stages })
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

/// Nyquist-safe normalised cutoff (cycles/sample) for a decimation factor
pub fn fir_cutoff(factor: u32) -> f64 {
    0.5 / factor as f64
}

//! Acquisition configuration and the process topology built from it.
//!
//! One run looks like this:
//!
//! ```text
//! hackrf_transfer -r - ──stdout──▶ tee ──▶ psd.fifo   ──▶ psd_consumer
//!                                      └─▶ demod.fifo ──▶ demod_consumer
//! ```
//!
//! [`run_pipeline`] owns every process and pipe of the run through a
//! [`PipelineProcessSet`], so all of them are torn down on every exit path.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info, warn};

use crate::{
    capture::{
        open_fifo_write, tee_stream, FifoSet, ManagedChild, StopSource, TeeOutcome, TeeStats,
        CHUNK_SIZE, TERMINATE_GRACE,
    },
    demod::{plain_number, Demodulator, DEFAULT_AUDIO_SINK},
    error::{Error, Result},
    welch::{nperseg, Scale, DEFAULT_RBW_HZ},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemodConfig {
    /// `FM` or `AM`, checked by [`AcquisitionConfig::validate`]
    #[serde(alias = "type")]
    pub signal: String,
    #[serde(alias = "bw")]
    pub bandwidth: f64,
    /// Frequency of interest, defaults to the acquisition center
    #[serde(default, alias = "center_frequency")]
    pub center_freq_hz: Option<f64>,
    #[serde(default)]
    pub sink: Option<String>,
    /// Playback rate, the decimated rate when unset
    #[serde(default, alias = "aud_rate")]
    pub audio_rate: Option<u32>,
    /// Log signal statistics of the forwarded IQ
    #[serde(default, deserialize_with = "flag")]
    pub metrics: bool,
}

impl DemodConfig {
    pub fn new(signal: impl Into<String>, bandwidth: f64) -> Self {
        Self {
            signal: signal.into(),
            bandwidth,
            center_freq_hz: None,
            sink: None,
            audio_rate: None,
            metrics: false,
        }
    }
}

/// Parameters of one acquisition run, fixed for its whole life
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(alias = "center_frequency")]
    pub center_freq_hz: f64,
    pub span: f64,
    #[serde(default)]
    pub sample_rate_hz: Option<f64>,
    #[serde(default, alias = "rbw")]
    pub resolution_hz: Option<f64>,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default)]
    pub lna_gain: Option<u32>,
    #[serde(default)]
    pub vga_gain: Option<u32>,
    #[serde(default, deserialize_with = "flag")]
    pub antenna_amp: bool,
    #[serde(default)]
    pub demod: Option<DemodConfig>,
}

/// Accepts `true`/`false`, `0`/`1` or null
fn flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Num(f64),
    }
    Ok(match Option::<Flag>::deserialize(d)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Num(n)) => n != 0.0,
        None => false,
    })
}

impl AcquisitionConfig {
    pub fn new(center_freq_hz: f64, span: f64) -> Self {
        Self {
            center_freq_hz,
            span,
            sample_rate_hz: None,
            resolution_hz: None,
            scale: Scale::default(),
            lna_gain: None,
            vga_gain: None,
            antenna_amp: false,
            demod: None,
        }
    }

    /// Explicit sample rate, otherwise the span
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate_hz.unwrap_or(self.span)
    }

    /// Requested RBW, falling back to the default when missing or not positive
    pub fn rbw(&self) -> f64 {
        match self.resolution_hz {
            Some(rbw) if rbw > 0.0 => rbw,
            _ => DEFAULT_RBW_HZ,
        }
    }

    pub fn demodulator(&self) -> Option<Demodulator> {
        let d = self.demod.as_ref()?;
        let mut demod = Demodulator::new(self.sample_rate(), d.bandwidth, d.signal.clone())
            .with_sink(d.sink.as_deref().unwrap_or(DEFAULT_AUDIO_SINK))
            .tuned(self.demod_freq(d), self.center_freq_hz);
        if let Some(rate) = d.audio_rate {
            demod = demod.with_audio_rate(rate);
        }
        Some(demod)
    }

    fn demod_freq(&self, d: &DemodConfig) -> f64 {
        d.center_freq_hz.unwrap_or(self.center_freq_hz)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.center_freq_hz) {
            return Err(Error::InvalidArgument(format!(
                "center frequency must be positive, got {}",
                self.center_freq_hz
            )));
        }
        if !positive(self.span) {
            return Err(Error::InvalidArgument(format!(
                "frequency span must be positive, got {}",
                self.span
            )));
        }
        if !positive(self.sample_rate()) {
            return Err(Error::InvalidArgument(format!(
                "sample rate must be positive, got {}",
                self.sample_rate()
            )));
        }
        nperseg(self.sample_rate(), self.rbw())?;
        if let Some(demod) = self.demodulator() {
            demod.build_pipeline()?;
        }
        Ok(())
    }
}

/// Where to find the external programs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub acquisition: PathBuf,
    pub psd_consumer: PathBuf,
    pub demod_consumer: PathBuf,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            acquisition: "hackrf_transfer".into(),
            psd_consumer: "psd_consumer".into(),
            demod_consumer: "demod_consumer".into(),
        }
    }
}

impl Binaries {
    /// Consumers next to the running executable when present there, else from `PATH`
    pub fn beside_current_exe() -> Self {
        let mut bins = Self::default();
        let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        else {
            return bins;
        };
        for bin in [&mut bins.psd_consumer, &mut bins.demod_consumer] {
            let candidate = dir.join(&*bin);
            if candidate.is_file() {
                *bin = candidate;
            }
        }
        bins
    }
}

/// A program and its arguments, kept apart from any shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    pub fn has_flag(&self, name: &str, value: &str) -> bool {
        self.args.windows(2).any(|w| w[0] == name && w[1] == value)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commands {
    pub acquisition: CommandSpec,
    pub demod: Option<CommandSpec>,
    pub psd: CommandSpec,
}

pub fn build_commands(config: &AcquisitionConfig, bins: &Binaries) -> Result<Commands> {
    config.validate()?;
    let freq = plain_number(config.center_freq_hz);
    let rate = plain_number(config.sample_rate());

    let mut acquisition = CommandSpec::new(&bins.acquisition)
        .flag("-r", "-")
        .flag("-f", freq.clone())
        .flag("-s", rate.clone());
    if config.antenna_amp {
        acquisition = acquisition.flag("-a", "1");
    }
    if let Some(lna) = config.lna_gain {
        acquisition = acquisition.flag("-l", lna.to_string());
    }
    if let Some(vga) = config.vga_gain {
        acquisition = acquisition.flag("-g", vga.to_string());
    }

    let psd = CommandSpec::new(&bins.psd_consumer)
        .flag("-f", freq.clone())
        .flag("-s", rate.clone())
        .flag("-w", plain_number(config.rbw()))
        .flag("--scale", config.scale.to_string());

    let demod = config.demod.as_ref().map(|d| {
        let mut cmd = CommandSpec::new(&bins.demod_consumer)
            .flag("-f", plain_number(config.demod_freq(d)))
            .flag("--center", freq.clone())
            .flag("-t", d.signal.clone())
            .flag("-s", rate.clone())
            .flag("-b", plain_number(d.bandwidth));
        if let Some(sink) = &d.sink {
            cmd = cmd.flag("-o", sink.clone());
        }
        if let Some(audio_rate) = d.audio_rate {
            cmd = cmd.flag("--audio-rate", audio_rate.to_string());
        }
        if d.metrics {
            cmd = cmd.arg("-m");
        }
        cmd
    });

    Ok(Commands {
        acquisition,
        demod,
        psd,
    })
}

/// Every process and pipe of one run. Dropping it tears the run down:
/// acquisition first, then consumers, then the pipes.
#[derive(Debug)]
pub struct PipelineProcessSet {
    fifos: FifoSet,
    consumers: Vec<(ManagedChild, PathBuf)>,
    acquisition: Option<ManagedChild>,
}

impl PipelineProcessSet {
    fn new(fifos: FifoSet) -> Self {
        Self {
            fifos,
            consumers: Vec::new(),
            acquisition: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(acq) = self.acquisition.as_mut() {
            acq.terminate(TERMINATE_GRACE);
        }
        for (consumer, _) in self.consumers.iter_mut() {
            consumer.terminate(TERMINATE_GRACE);
        }
        self.fifos.unlink();
    }
}

impl Drop for PipelineProcessSet {
    fn drop(&mut self) {
        self.teardown();
        info!("Pipeline torn down");
    }
}

/// Run acquisition and consumers until end of stream, a stop request, or a
/// dead process. Named pipes are created in `fifo_dir`.
pub fn run_pipeline(
    commands: &Commands,
    fifo_dir: &Path,
    stop: &dyn StopSource,
) -> Result<TeeStats> {
    let pid = std::process::id();
    let mut consumers = vec![(
        "psd_consumer",
        &commands.psd,
        fifo_dir.join(format!("sdr_psd_{pid}.fifo")),
    )];
    if let Some(demod) = &commands.demod {
        consumers.push((
            "demod_consumer",
            demod,
            fifo_dir.join(format!("sdr_demod_{pid}.fifo")),
        ));
    }

    let fifos = FifoSet::create(consumers.iter().map(|(_, _, path)| path.clone()))?;
    let mut set = PipelineProcessSet::new(fifos);

    for (name, spec, path) in consumers {
        info!(%name, cmd = %spec, "Starting consumer");
        // The command holds our copy of the read end until it is dropped
        let mut cmd = spec.to_command();
        match ManagedChild::spawn_reading(name, &mut cmd, &path) {
            Ok(child) => set.consumers.push((child, path)),
            Err(e) => error!("Consumer {name} did not start: {e}"),
        }
    }

    // Started even with no consumer so that teardown always owns the device
    info!(cmd = %commands.acquisition, "Starting acquisition");
    let mut cmd = commands.acquisition.to_command();
    cmd.stdin(Stdio::null()).stdout(Stdio::piped());
    let acquisition = set
        .acquisition
        .insert(ManagedChild::spawn("acquisition", &mut cmd)?);
    let mut src = acquisition
        .take_stdout()
        .ok_or_else(|| Error::Device("acquisition stdout not captured".into()))?;

    let mut sinks = Vec::new();
    for (consumer, path) in set.consumers.iter() {
        match open_fifo_write(path) {
            Ok(file) => sinks.push((consumer.name().to_owned(), file)),
            Err(e) => warn!("Skipping {}: {e}", consumer.name()),
        }
    }
    if sinks.is_empty() {
        return Err(Error::ProcessDied("every consumer".into()));
    }

    let consumers = &mut set.consumers;
    let result = tee_stream(&mut src, &mut sinks, CHUNK_SIZE, stop, || {
        for (consumer, _) in consumers.iter_mut() {
            if let Some(status) = consumer.exited() {
                warn!(name = consumer.name(), %status, "Consumer exited");
                return Err(Error::ProcessDied(consumer.name().to_owned()));
            }
        }
        Ok(())
    });
    // Closing the write ends lets consumers see end of stream
    drop(sinks);

    match &result {
        Ok(stats) => {
            info!(bytes = stats.bytes, chunks = stats.chunks, outcome = ?stats.outcome, "Tee finished");
            if stats.outcome == TeeOutcome::EndOfStream {
                for (consumer, _) in set.consumers.iter_mut() {
                    consumer.wait_exit(TERMINATE_GRACE);
                }
            }
        }
        Err(e) => error!("Pipeline failed: {e}"),
    }
    result
}

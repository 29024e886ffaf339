use std::{
    path::Path,
    process::ExitCode,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use sdr_pipeline::{
    args::{init_logging, RunnerArgs},
    capture::{AnyStop, StopFlag, StopSource},
    job::{JobClient, JobWatch},
    persist::{ModeWatch, StateFile},
    pipeline::{build_commands, run_pipeline, AcquisitionConfig, Binaries, Commands, DemodConfig},
    Error, Result,
};
use tracing::{error, info, warn};

fn config_from_args(args: &RunnerArgs) -> Result<AcquisitionConfig> {
    let freq = args
        .freq
        .ok_or_else(|| Error::InvalidArgument("a center frequency is required".into()))?;
    let mut config = AcquisitionConfig::new(freq, args.rate);
    config.sample_rate_hz = Some(args.rate);
    config.resolution_hz = Some(args.rbw);
    config.scale = args.scale;
    config.lna_gain = args.lna_gain;
    config.vga_gain = args.vga_gain;
    config.antenna_amp = args.amp;
    config.demod = args.demod.as_ref().map(|signal| DemodConfig {
        center_freq_hz: args.demod_freq,
        sink: args.sink.clone(),
        audio_rate: args.audio_rate,
        metrics: args.metrics,
        ..DemodConfig::new(signal.clone(), args.demod_bw)
    });
    Ok(config)
}

/// Pass reporting and plot options through to the PSD consumer
fn with_consumer_options(mut commands: Commands, args: &RunnerArgs) -> Commands {
    let mut psd = commands.psd;
    if !args.device_id.is_empty() {
        psd = psd.flag("--device-id", args.device_id.clone());
    }
    if let Some(url) = args.report_url.as_ref().or(args.job_url.as_ref()) {
        psd = psd.flag("--report-url", url.clone());
    }
    if let Some(plot) = &args.plot {
        psd = psd.flag("--output", plot.display().to_string());
    }
    commands.psd = psd;
    commands
}

/// Sleep for `d`, waking early on interrupt
fn idle(interrupt: &StopFlag, d: Duration) {
    let deadline = Instant::now() + d;
    while !interrupt.is_set() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
}

fn run_once(
    config: &AcquisitionConfig,
    args: &RunnerArgs,
    fifo_dir: &Path,
    stop: &dyn StopSource,
) -> Result<()> {
    let commands = with_consumer_options(build_commands(config, &Binaries::beside_current_exe())?, args);
    let stats = run_pipeline(&commands, fifo_dir, stop)?;
    info!(
        bytes = stats.bytes,
        outcome = ?stats.outcome,
        "Run finished"
    );
    Ok(())
}

fn run_jobs(
    url: &str,
    args: &RunnerArgs,
    fifo_dir: &Path,
    interrupt: &StopFlag,
    mode: Option<&ModeWatch>,
) -> Result<()> {
    if args.device_id.is_empty() {
        return Err(Error::InvalidArgument(
            "--device-id is required with --job-url".into(),
        ));
    }
    let client = JobClient::new(url)?;
    let poll = Duration::from_secs_f64(args.poll.max(0.1));
    info!(url, device = %args.device_id, "Waiting for jobs");
    while !interrupt.is_set() {
        if mode.map_or(false, |m| m.should_stop()) {
            idle(interrupt, poll);
            continue;
        }
        let config = match client.fetch_job(&args.device_id) {
            Ok(Some(config)) => config,
            Ok(None) => {
                idle(interrupt, poll);
                continue;
            }
            Err(e) => {
                warn!("Failed to fetch job: {e}");
                idle(interrupt, poll);
                continue;
            }
        };
        info!(
            center = config.center_freq_hz,
            span = config.span,
            "Starting job"
        );
        let watch = JobWatch::spawn(client.clone(), args.device_id.clone(), config.clone(), poll)?;
        let mut sources: Vec<&dyn StopSource> = vec![interrupt as &dyn StopSource, &watch];
        if let Some(m) = mode {
            sources.push(m);
        }
        if let Err(e) = run_once(&config, args, fifo_dir, &AnyStop(sources)) {
            if interrupt.is_set() {
                break;
            }
            error!("Job failed: {e}");
            idle(interrupt, poll);
        }
    }
    Err(Error::Interrupted)
}

fn run(args: &RunnerArgs) -> Result<()> {
    let interrupt = StopFlag::new();
    interrupt.install_ctrlc()?;
    let fifo_dir = args.fifo_dir.clone().unwrap_or_else(std::env::temp_dir);
    let mode = args
        .state_file
        .as_ref()
        .map(|path| ModeWatch::new(StateFile::new(path)));

    if let Some(url) = &args.job_url {
        return run_jobs(url, args, &fifo_dir, &interrupt, mode.as_ref());
    }

    let config = config_from_args(args)?;
    let mut sources: Vec<&dyn StopSource> = vec![&interrupt as &dyn StopSource];
    if let Some(m) = &mode {
        sources.push(m);
    }
    let result = run_once(&config, args, &fifo_dir, &AnyStop(sources));
    // Ctrl-C reaches the children too, so their exit is expected
    if interrupt.is_set() {
        return Err(Error::Interrupted);
    }
    result
}

fn main() -> ExitCode {
    let args = RunnerArgs::parse();
    init_logging(&args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => {
            info!("Interrupted, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

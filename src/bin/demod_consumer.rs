use std::{
    io::{self, Read},
    process::{Command, ExitCode, Stdio},
    time::Duration,
};

use clap::Parser;
use sdr_pipeline::{
    args::{init_logging, DemodArgs},
    capture::{tee_stream, ManagedChild, StopFlag, CHUNK_SIZE, TERMINATE_GRACE},
    demod::Demodulator,
    monitoring::MeteredReader,
    Error, Result,
};
use tracing::{error, info, warn};

/// How often `--metrics` logs IQ power
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

fn run(args: &DemodArgs) -> Result<()> {
    let mut demod = Demodulator::new(args.rate, args.bandwidth, args.signal.clone())
        .with_sink(args.sink.clone())
        .tuned(args.freq, args.center.unwrap_or(args.freq));
    if let Some(rate) = args.decimate_to {
        demod = demod.decimate_to(rate);
    }
    if let Some(rate) = args.audio_rate {
        demod = demod.with_audio_rate(rate);
    }
    let pipeline = demod.build_pipeline()?;
    let script = pipeline.to_shell();
    if args.dry_run {
        println!("{script}");
        return Ok(());
    }

    let stop = StopFlag::new();
    stop.install_ctrlc()?;
    info!(
        freq = args.freq,
        signal = %args.signal,
        decimation = demod.decimation()?,
        output_rate = demod.output_rate()?,
        audio_rate = demod.playback_rate()?,
        "Starting DSP chain: {script}"
    );
    let mut chain = ManagedChild::spawn(
        "dsp",
        Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped()),
    )?;
    let stdin = chain
        .take_stdin()
        .ok_or_else(|| Error::Device("DSP chain stdin not captured".into()))?;
    let mut sinks = [("dsp".to_owned(), stdin)];

    let mut src: Box<dyn Read> = if args.metrics {
        Box::new(MeteredReader::new(io::stdin().lock(), METRICS_INTERVAL))
    } else {
        Box::new(io::stdin().lock())
    };
    let result = tee_stream(
        &mut src,
        &mut sinks,
        CHUNK_SIZE,
        &stop,
        || match chain.exited() {
            Some(status) => {
                warn!(%status, "DSP chain exited");
                Err(Error::ProcessDied("dsp".into()))
            }
            None => Ok(()),
        },
    );
    // Close the chain's input so it can drain and exit
    drop(sinks);
    chain.wait_exit(TERMINATE_GRACE);

    match result {
        Ok(stats) => {
            info!(bytes = stats.bytes, outcome = ?stats.outcome, "Demodulation finished");
            Ok(())
        }
        // Ctrl-C reaches the chain too
        Err(_) if stop.is_set() => Ok(()),
        Err(e) => Err(e),
    }
}

fn main() -> ExitCode {
    let args = DemodArgs::parse();
    init_logging(&args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

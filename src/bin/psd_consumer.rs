use std::{
    io::{self, Read},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use sdr_pipeline::{
    args::{init_logging, PsdArgs},
    capture::{StopFlag, CHUNK_SIZE},
    complex::IqDecoder,
    exfil::LatestFrame,
    job::{spawn_reporter, JobClient, ReportSink, REPORT_QUEUE},
    ring::RingBuffer,
    welch::WelchEstimator,
    worker::{ChannelSink, PlotSink, PsdWorker},
    Error, Result,
};
use tracing::{error, info, warn};

/// Segments per estimate when `--samples` is not given
const SEGMENTS: usize = 8;

fn run(args: &PsdArgs) -> Result<()> {
    let stop = StopFlag::new();
    stop.install_ctrlc()?;

    let estimator = WelchEstimator::new(args.freq, args.rate, args.rbw)?;
    let samples = args.samples.unwrap_or(estimator.nperseg() * SEGMENTS);
    if samples < estimator.nperseg() {
        return Err(Error::InvalidArgument(format!(
            "{samples} samples is shorter than one {} sample segment",
            estimator.nperseg()
        )));
    }
    info!(
        nperseg = estimator.nperseg(),
        samples,
        scale = %args.scale,
        "PSD consumer ready"
    );

    let ring = Arc::new(RingBuffer::new(samples * 2));
    let mut worker = PsdWorker::new(ring.clone(), Box::new(estimator), args.scale, samples)
        .with_device(args.device_id.clone())
        .with_interval(Duration::from_millis(args.interval_ms))
        .with_sink(PlotSink {
            path: args.output.clone(),
            latest: Arc::new(LatestFrame::new()),
        });
    // Reports are posted off the worker thread so a slow service only costs frames
    let reporter = match &args.report_url {
        Some(url) => {
            let (tx, rx) = crossbeam_channel::bounded(REPORT_QUEUE);
            worker = worker.with_sink(ChannelSink(tx));
            let sink = ReportSink {
                client: JobClient::new(url.clone())?,
            };
            Some(spawn_reporter(sink, rx)?)
        }
        None => None,
    };
    let handle = worker.spawn(stop.clone())?;

    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut decoder = IqDecoder::new();
    let mut read_result = Ok(());
    while !stop.is_set() && !handle.is_finished() {
        match stdin.read(&mut buf) {
            Ok(0) => {
                info!("End of IQ stream");
                break;
            }
            Ok(n) => ring.write(&decoder.decode(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                read_result = Err(Error::Device(format!("reading IQ stream: {e}")));
                break;
            }
        }
    }

    stop.stop();
    let worker_result = handle
        .join()
        .unwrap_or_else(|_| Err(Error::Device("PSD worker panicked".into())));
    // The worker held the only sender, so the reporter drains and exits
    if let Some(reporter) = reporter {
        if reporter.join().is_err() {
            warn!("Report thread panicked");
        }
    }
    read_result.and(worker_result)
}

fn main() -> ExitCode {
    let args = PsdArgs::parse();
    init_logging(&args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

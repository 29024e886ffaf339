//! Periodic PSD worker: wait for samples, estimate, emit, repeat

use std::{
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, error, trace, warn};

use crate::{
    capture::StopFlag,
    complex::IqSample,
    error::Result,
    exfil::{LatestFrame, PsdFrame},
    ring::RingBuffer,
    welch::{Scale, Spectrum, WelchEstimator},
};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL: Duration = Duration::from_millis(20);

/// Turns a block of samples into a spectrum
pub trait Estimator {
    fn estimate(&self, iq: &[IqSample], scale: Scale) -> Result<Spectrum>;
}

impl Estimator for WelchEstimator {
    fn estimate(&self, iq: &[IqSample], scale: Scale) -> Result<Spectrum> {
        WelchEstimator::estimate(self, iq, scale)
    }
}

/// Where finished frames go
pub trait FrameSink {
    fn emit(&mut self, frame: &PsdFrame) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&PsdFrame) -> Result<()>,
{
    fn emit(&mut self, frame: &PsdFrame) -> Result<()> {
        self(frame)
    }
}

/// Keeps the latest frame and re-renders the plot file from it
#[derive(Debug)]
pub struct PlotSink {
    pub path: PathBuf,
    pub latest: Arc<LatestFrame>,
}

impl FrameSink for PlotSink {
    fn emit(&mut self, frame: &PsdFrame) -> Result<()> {
        self.latest.store(frame.clone());
        self.latest.render(&self.path)
    }
}

/// Hands frames to another thread, dropping them if it falls behind
#[derive(Debug)]
pub struct ChannelSink(pub Sender<PsdFrame>);

impl FrameSink for ChannelSink {
    fn emit(&mut self, frame: &PsdFrame) -> Result<()> {
        match self.0.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Frame channel full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => debug!("Frame receiver gone"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WaitingData,
    Estimating,
    Emitting,
    Stopped,
}

pub struct PsdWorker {
    ring: Arc<RingBuffer>,
    estimator: Box<dyn Estimator + Send>,
    sinks: Vec<Box<dyn FrameSink + Send>>,
    scale: Scale,
    samples: usize,
    device: String,
    wait_timeout: Duration,
    interval: Duration,
    state: WorkerState,
}

impl PsdWorker {
    pub fn new(
        ring: Arc<RingBuffer>,
        estimator: Box<dyn Estimator + Send>,
        scale: Scale,
        samples: usize,
    ) -> Self {
        Self {
            ring,
            estimator,
            sinks: Vec::new(),
            scale,
            samples,
            device: String::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            state: WorkerState::Stopped,
        }
    }

    pub fn with_sink(mut self, sink: impl FrameSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "PSD worker state");
            self.state = state;
        }
    }

    fn cycle(&mut self, iq: &[IqSample]) -> Result<()> {
        self.set_state(WorkerState::Estimating);
        let spectrum = self.estimator.estimate(iq, self.scale)?;
        let frame = PsdFrame::from_spectrum(spectrum, self.scale, self.device.clone());
        self.set_state(WorkerState::Emitting);
        debug!(
            bins = frame.power.len(),
            start = frame.start_freq_hz,
            end = frame.end_freq_hz,
            "Emitting PSD frame"
        );
        for sink in self.sinks.iter_mut() {
            sink.emit(&frame)?;
        }
        Ok(())
    }

    fn pause(&self, stop: &StopFlag) {
        let mut left = self.interval;
        while !left.is_zero() && !stop.is_set() {
            let step = left.min(STOP_POLL);
            thread::sleep(step);
            left -= step;
        }
    }

    /// Loop until `stop` is set or a device/resource error occurs, which is returned
    pub fn run(&mut self, stop: &StopFlag) -> Result<()> {
        let result = self.run_inner(stop);
        self.set_state(WorkerState::Stopped);
        result
    }

    fn run_inner(&mut self, stop: &StopFlag) -> Result<()> {
        while !stop.is_set() {
            self.set_state(WorkerState::WaitingData);
            if !self.ring.wait_for(self.samples, self.wait_timeout) {
                continue;
            }
            let Some(iq) = self.ring.read_latest(self.samples) else {
                continue;
            };
            match self.cycle(&iq) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!("PSD worker stopping: {e}");
                    return Err(e);
                }
                Err(e) => warn!("PSD cycle failed: {e}"),
            }
            self.pause(stop);
        }
        Ok(())
    }

    pub fn spawn(mut self, stop: StopFlag) -> Result<JoinHandle<Result<()>>> {
        Ok(thread::Builder::new()
            .name("psd-worker".into())
            .spawn(move || self.run(&stop))?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use num_complex::Complex64;

    use super::*;
    use crate::error::Error;

    struct Fake {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl Estimator for Fake {
        fn estimate(&self, iq: &[IqSample], _: Scale) -> Result<Spectrum> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::InvalidPsd("bad block"));
            }
            Ok(Spectrum {
                freqs: (0..10).map(|i| i as f64).collect(),
                power: vec![iq.len() as f64; 10],
            })
        }
    }

    fn filled_ring(n: usize) -> Arc<RingBuffer> {
        let ring = Arc::new(RingBuffer::new(n * 2));
        ring.write(&vec![Complex64::new(1.0, 0.0); n]);
        ring
    }

    #[test]
    fn test_single_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stop = StopFlag::new();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (s, f) = (stop.clone(), frames.clone());
        let mut worker = PsdWorker::new(
            filled_ring(1024),
            Box::new(Fake {
                calls: calls.clone(),
                fail_first: 0,
            }),
            Scale::Db,
            1024,
        )
        .with_device("sensor-1")
        .with_sink(move |frame: &PsdFrame| -> Result<()> {
            f.lock().unwrap().push(frame.clone());
            s.stop();
            Ok(())
        });
        worker.run(&stop).unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].power[0], 1024.0);
        assert_eq!(frames[0].device, "sensor-1");
        assert_eq!(frames[0].end_freq_hz, 9.0);
    }

    #[test]
    fn test_data_errors_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let stop = StopFlag::new();
        let s = stop.clone();
        let mut worker = PsdWorker::new(
            filled_ring(64),
            Box::new(Fake {
                calls: calls.clone(),
                fail_first: 2,
            }),
            Scale::Db,
            64,
        )
        .with_interval(Duration::ZERO)
        .with_sink(move |_: &PsdFrame| -> Result<()> {
            s.stop();
            Ok(())
        });
        worker.run(&stop).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_device_error_stops_worker() {
        let stop = StopFlag::new();
        let mut worker = PsdWorker::new(
            filled_ring(64),
            Box::new(Fake {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first: 0,
            }),
            Scale::Db,
            64,
        )
        .with_sink(|_: &PsdFrame| -> Result<()> { Err(Error::Device("disk gone".into())) });
        let err = worker.run(&stop).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!stop.is_set());
    }

    #[test]
    fn test_waits_for_data_until_stopped() {
        let stop = StopFlag::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ring = Arc::new(RingBuffer::new(256));
        let worker = PsdWorker::new(
            ring.clone(),
            Box::new(Fake {
                calls: calls.clone(),
                fail_first: 0,
            }),
            Scale::Db,
            128,
        )
        .with_wait_timeout(Duration::from_millis(10));
        let handle = worker.spawn(stop.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        ring.write(&vec![Complex64::new(0.0, 1.0); 64]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_welch_with_plot_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psd.png");
        let latest = Arc::new(LatestFrame::new());
        let stop = StopFlag::new();
        let est = WelchEstimator::new(100e6, 1e6, 1e3).unwrap();
        let s = stop.clone();
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut worker = PsdWorker::new(filled_ring(4096), Box::new(est), Scale::Dbm, 4096)
            .with_sink(PlotSink {
                path: path.clone(),
                latest: latest.clone(),
            })
            .with_sink(ChannelSink(tx))
            .with_sink(move |_: &PsdFrame| -> Result<()> {
                s.stop();
                Ok(())
            });
        worker.run(&stop).unwrap();
        assert!(path.exists());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.power.len(), 1024);
        assert!(frame.start_freq_hz < 100e6 && frame.end_freq_hz > 100e6 - 1.0);
        assert_eq!(latest.get().unwrap(), frame);
    }
}

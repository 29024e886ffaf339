//! In this module, we implement the per-device bookkeeping for the collection
//! side: the configuration pending for each sensor, its last metrics, and its
//! last PSD report, plus the summary RF metrics derived from a power array.
//! On the sensor side, [`IqMeter`] tracks the power of a raw IQ stream.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Read},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    complex::IqDecoder,
    error::{Error, Result},
    exfil::PsdReport,
};

// Floor for log10 of an all-zero stretch
const POWER_FLOOR: f64 = 1e-20;

/// Noise floor, peak and their difference, all in the units of the power array
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RfMetrics {
    pub noise_floor_dbm: f64,
    pub peak_power_dbm: f64,
    pub snr_db: f64,
}

/// Median as the noise floor, maximum as the peak. All zero for empty input.
pub fn rf_metrics(pxx: &[f64]) -> RfMetrics {
    let mut sorted: Vec<f64> = pxx.iter().copied().filter(|p| p.is_finite()).collect();
    if sorted.is_empty() {
        return RfMetrics::default();
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    let noise_floor = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };
    let peak = sorted[sorted.len() - 1];
    RfMetrics {
        noise_floor_dbm: noise_floor,
        peak_power_dbm: peak,
        snr_db: peak - noise_floor,
    }
}

/// Power of a stretch of IQ relative to full scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IqStats {
    pub samples: u64,
    pub mean_power_dbfs: f64,
    pub peak_power_dbfs: f64,
    /// Peak to mean power ratio
    pub crest_factor_db: f64,
}

fn dbfs(power: f64) -> f64 {
    10.0 * power.max(POWER_FLOOR).log10()
}

/// Accumulates IQ power over raw s8 bytes and hands out stats once per interval
#[derive(Debug)]
pub struct IqMeter {
    decoder: IqDecoder,
    samples: u64,
    power_sum: f64,
    peak: f64,
    interval: Duration,
    since: Instant,
}

impl IqMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            decoder: IqDecoder::new(),
            samples: 0,
            power_sum: 0.0,
            peak: 0.0,
            interval,
            since: Instant::now(),
        }
    }

    pub fn observe(&mut self, bytes: &[u8]) {
        for sample in self.decoder.decode(bytes) {
            let p = sample.norm_sqr();
            self.power_sum += p;
            self.peak = self.peak.max(p);
            self.samples += 1;
        }
    }

    /// Stats since the last reset, `None` before any whole sample
    pub fn stats(&self) -> Option<IqStats> {
        if self.samples == 0 {
            return None;
        }
        let mean = dbfs(self.power_sum / self.samples as f64);
        let peak = dbfs(self.peak);
        Some(IqStats {
            samples: self.samples,
            mean_power_dbfs: mean,
            peak_power_dbfs: peak,
            crest_factor_db: peak - mean,
        })
    }

    /// Stats once the interval has passed, restarting the accumulation
    pub fn take_due(&mut self) -> Option<IqStats> {
        if self.since.elapsed() < self.interval {
            return None;
        }
        let stats = self.stats()?;
        self.samples = 0;
        self.power_sum = 0.0;
        self.peak = 0.0;
        self.since = Instant::now();
        Some(stats)
    }
}

/// Passes reads through unchanged, logging IQ power as it goes
#[derive(Debug)]
pub struct MeteredReader<R> {
    inner: R,
    meter: IqMeter,
}

impl<R: Read> MeteredReader<R> {
    pub fn new(inner: R, interval: Duration) -> Self {
        Self {
            inner,
            meter: IqMeter::new(interval),
        }
    }
}

impl<R: Read> Read for MeteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.meter.observe(&buf[..n]);
        if let Some(s) = self.meter.take_due() {
            info!(
                samples = s.samples,
                mean_dbfs = s.mean_power_dbfs,
                peak_dbfs = s.peak_power_dbfs,
                crest_db = s.crest_factor_db,
                "IQ power"
            );
        }
        Ok(n)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Acquisition parameters pending for the sensor, as sent by the front end
    pub config: serde_json::Map<String, Value>,
    /// Free-form health metrics posted by the sensor
    pub metrics: serde_json::Map<String, Value>,
    pub data: Option<PsdReport>,
}

/// Device id → state, restricted to a known set of ids
#[derive(Debug, Default)]
pub struct DeviceStore {
    allowed: HashSet<String>,
    devices: HashMap<String, DeviceState>,
}

impl DeviceStore {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
            devices: HashMap::new(),
        }
    }

    /// State for `device`, created empty on first access
    pub fn get_mut(&mut self, device: &str) -> Result<&mut DeviceState> {
        let key = device.to_lowercase();
        if !self.allowed.contains(&key) {
            return Err(Error::UnknownDevice(device.to_owned()));
        }
        Ok(self.devices.entry(key).or_default())
    }

    pub fn get(&self, device: &str) -> Option<&DeviceState> {
        self.devices.get(&device.to_lowercase())
    }

    pub fn set_config(&mut self, device: &str, config: serde_json::Map<String, Value>) -> Result<()> {
        self.get_mut(device)?.config = config;
        Ok(())
    }

    /// The pending configuration as the sensor sees it. An empty map means idle.
    pub fn config(&mut self, device: &str) -> Result<Value> {
        Ok(Value::Object(self.get_mut(device)?.config.clone()))
    }

    pub fn record_metrics(&mut self, device: &str, metrics: serde_json::Map<String, Value>) -> Result<()> {
        self.get_mut(device)?.metrics = metrics;
        Ok(())
    }

    /// Store a report, checking it belongs to `device`
    pub fn record_report(&mut self, device: &str, report: PsdReport) -> Result<()> {
        if !report.mac.eq_ignore_ascii_case(device) {
            return Err(Error::InvalidArgument(format!(
                "report from {} posted for {device}",
                report.mac
            )));
        }
        self.get_mut(device)?.data = Some(report);
        Ok(())
    }

    /// Latest report and its RF metrics, `None` before the first report
    pub fn latest(&self, device: &str) -> Option<(&PsdReport, RfMetrics)> {
        let report = self.get(device)?.data.as_ref()?;
        Some((report, rf_metrics(&report.pxx)))
    }
}

//! Remote job contract: fetch the pending acquisition for a device, post PSD reports back

use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use reqwest::{blocking::Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    capture::{StopFlag, StopSource},
    error::Result,
    exfil::{PsdFrame, PsdReport},
    monitoring::rf_metrics,
    pipeline::AcquisitionConfig,
    worker::FrameSink,
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames waiting for the report thread
pub const REPORT_QUEUE: usize = 4;
const WATCH_POLL: Duration = Duration::from_millis(20);

/// Interpret a job document. `null`, `{}` and a non-positive span all mean
/// "nothing to do" and come back as `None`.
pub fn parse_job(job: &Value) -> Result<Option<AcquisitionConfig>> {
    match job {
        Value::Null => return Ok(None),
        Value::Object(map) if map.is_empty() => return Ok(None),
        _ => {}
    }
    if let Some(span) = job.get("span").and_then(Value::as_f64) {
        if span <= 0.0 {
            info!(span, "Job requests stop");
            return Ok(None);
        }
    }
    let config: AcquisitionConfig = serde_json::from_value(job.clone())?;
    config.validate()?;
    Ok(Some(config))
}

#[derive(Debug, Clone)]
pub struct JobClient {
    client: Client,
    base: String,
}

impl JobClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn configuration_url(&self, device: &str) -> String {
        format!("{}/{device}/configuration", self.base)
    }

    pub fn data_url(&self) -> String {
        format!("{}/data", self.base)
    }

    /// Pending job for `device`; `None` when the service has nothing for it
    pub fn fetch_job(&self, device: &str) -> Result<Option<AcquisitionConfig>> {
        let resp = self.client.get(self.configuration_url(device)).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.error_for_status()?.text()?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        parse_job(&serde_json::from_str(&body)?)
    }

    pub fn post_report(&self, report: &PsdReport) -> Result<()> {
        report.validate()?;
        self.client
            .post(self.data_url())
            .json(report)
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

/// Stops a run once the service no longer asks for the job it is running.
///
/// The service is polled once per `interval` on a background thread, so
/// [`StopSource::should_stop`] never waits on the network. A failed poll keeps
/// the run going. Dropping the watch ends the thread after its current request.
#[derive(Debug)]
pub struct JobWatch {
    changed: StopFlag,
    done: StopFlag,
}

impl JobWatch {
    pub fn spawn(
        client: JobClient,
        device: impl Into<String>,
        running: AcquisitionConfig,
        interval: Duration,
    ) -> Result<Self> {
        let changed = StopFlag::new();
        let done = StopFlag::new();
        let device = device.into();
        let (flag, quit) = (changed.clone(), done.clone());
        thread::Builder::new()
            .name("job-watch".into())
            .spawn(move || {
                while pause(&quit, interval) {
                    if job_changed(&client, &device, &running) {
                        flag.stop();
                        break;
                    }
                }
                debug!("Job watch finished");
            })?;
        Ok(Self { changed, done })
    }
}

/// Sleep for `d` in short steps; false once `quit` is set
fn pause(quit: &StopFlag, d: Duration) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if quit.is_set() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(WATCH_POLL.min(deadline - now));
    }
}

fn job_changed(client: &JobClient, device: &str, running: &AcquisitionConfig) -> bool {
    match client.fetch_job(device) {
        Ok(Some(job)) if job == *running => false,
        Ok(Some(_)) => {
            info!("Job changed");
            true
        }
        Ok(None) => {
            info!("Job cleared");
            true
        }
        Err(e) => {
            warn!("Job poll failed: {e}");
            false
        }
    }
}

impl StopSource for JobWatch {
    fn should_stop(&self) -> bool {
        self.changed.is_set()
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        self.done.stop();
    }
}

/// Posts every frame to the collection service
#[derive(Debug)]
pub struct ReportSink {
    pub client: JobClient,
}

impl FrameSink for ReportSink {
    fn emit(&mut self, frame: &PsdFrame) -> Result<()> {
        let report = frame.report();
        let m = rf_metrics(&report.pxx);
        debug!(
            noise_floor = m.noise_floor_dbm,
            peak = m.peak_power_dbm,
            snr = m.snr_db,
            "Posting PSD report"
        );
        self.client.post_report(&report)
    }
}

/// Post frames arriving on `frames` until every sender is gone.
/// A failed post drops that frame.
pub fn spawn_reporter(mut sink: ReportSink, frames: Receiver<PsdFrame>) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new()
        .name("psd-report".into())
        .spawn(move || {
            for frame in frames.iter() {
                if let Err(e) = sink.emit(&frame) {
                    warn!("Dropping PSD report: {e}");
                }
            }
            debug!("Report queue closed");
        })?)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
        thread,
    };

    use serde_json::json;

    use super::*;
    use crate::error::Error;

    const MAC: &str = "2c:cf:67:51:17:be";

    /// Serve one canned response, returning the raw request
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request = String::new();
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = v.trim().parse().unwrap();
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut payload = vec![0; length];
            reader.read_exact(&mut payload).unwrap();
            request.push_str(&String::from_utf8(payload).unwrap());
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            request
        });
        (base, handle)
    }

    #[test]
    fn test_parse_idle_jobs() {
        assert!(parse_job(&Value::Null).unwrap().is_none());
        assert!(parse_job(&json!({})).unwrap().is_none());
        assert!(parse_job(&json!({"center_frequency": 98e6, "span": 0}))
            .unwrap()
            .is_none());
        assert!(parse_job(&json!({"center_frequency": 98e6, "span": -10}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_job() {
        let config = parse_job(&json!({
            "center_frequency": 98000000,
            "span": 20000000,
            "resolution_hz": 1000,
            "lna_gain": 20,
        }))
        .unwrap()
        .unwrap();
        assert_eq!(config.center_freq_hz, 98e6);
        assert_eq!(config.rbw(), 1000.0);
    }

    #[test]
    fn test_parse_malformed_job() {
        let err = parse_job(&json!({"span": 1000})).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(err.status_code(), 400);
        assert!(parse_job(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_urls() {
        let client = JobClient::new("http://collector:8000/").unwrap();
        assert_eq!(
            client.configuration_url(MAC),
            "http://collector:8000/2c:cf:67:51:17:be/configuration"
        );
        assert_eq!(client.data_url(), "http://collector:8000/data");
    }

    #[test]
    fn test_fetch_job_not_found_is_idle() {
        let (base, server) = serve_once("404 Not Found", "{\"detail\":\"none\"}");
        let client = JobClient::new(base).unwrap();
        assert!(client.fetch_job(MAC).unwrap().is_none());
        let request = server.join().unwrap();
        assert!(request.starts_with(&format!("GET /{MAC}/configuration")));
    }

    #[test]
    fn test_fetch_job() {
        let (base, server) = serve_once(
            "200 OK",
            "{\"center_frequency\": 100000000, \"span\": 2000000}",
        );
        let client = JobClient::new(base).unwrap();
        let job = client.fetch_job(MAC).unwrap().unwrap();
        assert_eq!(job.center_freq_hz, 100e6);
        assert_eq!(job.sample_rate(), 2e6);
        server.join().unwrap();
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_job_watch_stops_on_changed_job() {
        let (base, server) = serve_once(
            "200 OK",
            "{\"center_frequency\": 100000000, \"span\": 2000000}",
        );
        let client = JobClient::new(base).unwrap();
        let running = AcquisitionConfig::new(98e6, 2e6);
        let watch = JobWatch::spawn(client, MAC, running, Duration::from_millis(10)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || watch.should_stop()));
        let request = server.join().unwrap();
        assert!(request.starts_with(&format!("GET /{MAC}/configuration")));
    }

    #[test]
    fn test_job_watch_keeps_same_job() {
        let (base, server) = serve_once(
            "200 OK",
            "{\"center_frequency\": 100000000, \"span\": 2000000}",
        );
        let client = JobClient::new(base).unwrap();
        let running = AcquisitionConfig::new(100e6, 2e6);
        let watch = JobWatch::spawn(client, MAC, running, Duration::from_millis(10)).unwrap();
        server.join().unwrap();
        // Later polls fail to connect, which must not stop the run either
        thread::sleep(Duration::from_millis(100));
        assert!(!watch.should_stop());
    }

    #[test]
    fn test_job_watch_does_not_block_on_a_silent_service() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (accepted_tx, accepted) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            accepted_tx.send(()).unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });
        let client = JobClient::new(base).unwrap();
        let running = AcquisitionConfig::new(100e6, 2e6);
        let watch = JobWatch::spawn(client, MAC, running, Duration::from_millis(1)).unwrap();
        accepted.recv_timeout(Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        for _ in 0..1000 {
            assert!(!watch.should_stop());
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_post_report() {
        let (base, server) = serve_once("200 OK", "{\"status\":\"ok\"}");
        let mut sink = ReportSink {
            client: JobClient::new(base).unwrap(),
        };
        let spectrum = crate::welch::Spectrum {
            freqs: vec![99e6, 100e6, 101e6],
            power: vec![-90.0, -60.0, -88.0],
        };
        let frame = PsdFrame::from_spectrum(spectrum, crate::welch::Scale::Dbm, MAC);
        sink.emit(&frame).unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /data"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let posted: PsdReport = serde_json::from_str(body).unwrap();
        assert_eq!(posted.pxx, vec![-90.0, -60.0, -88.0]);
        assert_eq!(posted.mac, MAC);
    }

    #[test]
    fn test_reporter_posts_queued_frames() {
        let (base, server) = serve_once("200 OK", "{\"status\":\"ok\"}");
        let sink = ReportSink {
            client: JobClient::new(base).unwrap(),
        };
        let (tx, rx) = crossbeam_channel::bounded(REPORT_QUEUE);
        let reporter = spawn_reporter(sink, rx).unwrap();
        let spectrum = crate::welch::Spectrum {
            freqs: vec![99e6, 100e6],
            power: vec![-90.0, -60.0],
        };
        tx.send(PsdFrame::from_spectrum(spectrum, crate::welch::Scale::Dbm, MAC))
            .unwrap();
        drop(tx);
        reporter.join().unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /data"));
    }

    #[test]
    fn test_post_rejects_invalid_report() {
        let client = JobClient::new("http://127.0.0.1:9").unwrap();
        let report = PsdReport {
            pxx: vec![],
            start_freq_hz: 1.0,
            end_freq_hz: 2.0,
            timestamp: 0,
            mac: MAC.into(),
        };
        assert!(matches!(
            client.post_report(&report),
            Err(Error::InvalidPsd(_))
        ));
    }
}

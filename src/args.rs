//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::welch::{Scale, DEFAULT_RBW_HZ};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Run acquisition and fan its IQ stream out to PSD and demodulation consumers", long_about = None)]
#[clap(arg_required_else_help = true)]
pub struct RunnerArgs {
    /// Center frequency in Hz (accepts k/M/G suffixes)
    #[clap(short, long, value_parser = parse_hz, required_unless_present = "job-url")]
    pub freq: Option<f64>,
    /// Sample rate in Hz
    #[clap(short = 's', long, value_parser = parse_hz, default_value = "2M")]
    pub rate: f64,
    /// Resolution bandwidth of the PSD in Hz
    #[clap(short = 'w', long, value_parser = parse_hz, default_value = "10k")]
    pub rbw: f64,
    /// PSD output scale (dB, dBm, dBFS, V2/Hz)
    #[clap(long, value_parser = parse_scale, default_value = "dBm")]
    pub scale: Scale,
    /// LNA (IF) gain in dB
    #[clap(short, long)]
    pub lna_gain: Option<u32>,
    /// VGA (baseband) gain in dB
    #[clap(short = 'g', long)]
    pub vga_gain: Option<u32>,
    /// Enable the antenna port amplifier
    #[clap(short = 'a', long)]
    pub amp: bool,
    /// Also demodulate (FM or AM)
    #[clap(short = 'd', long)]
    pub demod: Option<String>,
    /// Demodulation bandwidth in Hz
    #[clap(short = 'b', long, value_parser = parse_hz, default_value = "200k")]
    pub demod_bw: f64,
    /// Audio sink for demodulated output
    #[clap(short = 'o', long)]
    pub sink: Option<String>,
    /// Demodulate this frequency instead of the center
    #[clap(long, value_parser = parse_hz)]
    pub demod_freq: Option<f64>,
    /// Playback rate of the demodulated audio
    #[clap(long)]
    pub audio_rate: Option<u32>,
    /// Log signal statistics of the demodulated IQ
    #[clap(short = 'm', long)]
    pub metrics: bool,
    /// Keep running only while this JSON state file has current_mode = "realtime"
    #[clap(long)]
    pub state_file: Option<PathBuf>,
    /// Directory for the named pipes
    #[clap(long)]
    pub fifo_dir: Option<PathBuf>,
    /// Fetch acquisition jobs from this collection service instead of the flags above
    #[clap(long)]
    pub job_url: Option<String>,
    /// Device id (MAC) used for jobs and reports
    #[clap(long, default_value = "")]
    pub device_id: String,
    /// Seconds between job polls
    #[clap(long, default_value_t = 5.0)]
    pub poll: f64,
    /// Post PSD reports here (defaults to the job service, if any)
    #[clap(long)]
    pub report_url: Option<String>,
    /// Where the PSD consumer writes its plot
    #[clap(long)]
    pub plot: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Estimate the PSD of s8 IQ read from stdin", long_about = None)]
#[clap(arg_required_else_help = true)]
pub struct PsdArgs {
    /// Center frequency in Hz
    #[clap(short, long, value_parser = parse_hz)]
    pub freq: f64,
    /// Sample rate in Hz
    #[clap(short = 's', long, value_parser = parse_hz)]
    pub rate: f64,
    /// Resolution bandwidth in Hz; zero or negative falls back to the default
    #[clap(short = 'w', long, value_parser = parse_hz, default_value_t = DEFAULT_RBW_HZ)]
    pub rbw: f64,
    #[clap(long, value_parser = parse_scale, default_value = "dBm")]
    pub scale: Scale,
    /// Samples per estimate, eight segments when omitted
    #[clap(short = 'n', long)]
    pub samples: Option<usize>,
    /// Plot output path
    #[clap(long, default_value = "psd.png")]
    pub output: PathBuf,
    /// Collection service to post reports to
    #[clap(long)]
    pub report_url: Option<String>,
    #[clap(long, default_value = "")]
    pub device_id: String,
    /// Milliseconds between estimates
    #[clap(long, default_value_t = 100)]
    pub interval_ms: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Demodulate s8 IQ read from stdin through an external DSP chain", long_about = None)]
#[clap(arg_required_else_help = true)]
pub struct DemodArgs {
    /// Frequency of interest in Hz
    #[clap(short, long, value_parser = parse_hz)]
    pub freq: f64,
    /// Center frequency of the incoming stream, `--freq` when omitted
    #[clap(long, value_parser = parse_hz)]
    pub center: Option<f64>,
    /// Signal type (FM or AM)
    #[clap(short = 't', long = "type")]
    pub signal: String,
    /// Sample rate in Hz
    #[clap(short = 's', long, value_parser = parse_hz)]
    pub rate: f64,
    /// Signal bandwidth in Hz
    #[clap(short = 'b', long, value_parser = parse_hz)]
    pub bandwidth: f64,
    /// Decimate to this output rate instead of the bandwidth
    #[clap(short = 'r', long, value_parser = parse_hz)]
    pub decimate_to: Option<f64>,
    /// Audio sink
    #[clap(short = 'o', long, default_value = crate::demod::DEFAULT_AUDIO_SINK)]
    pub sink: String,
    /// Playback rate, the decimated rate when omitted
    #[clap(long)]
    pub audio_rate: Option<u32>,
    /// Log power statistics of the IQ passed to the DSP chain
    #[clap(short = 'm', long)]
    pub metrics: bool,
    /// Print the DSP chain and exit
    #[clap(long)]
    pub dry_run: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

/// Install the fmt subscriber at the level picked on the command line
pub fn init_logging(verbose: &clap_verbosity_flag::Verbosity) {
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .init();
}

/// Frequency with an optional k/M/G suffix: `200k`, `1.5G`, `1e6`
pub fn parse_hz(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (num, mult) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1e3),
        Some('M') => (&s[..s.len() - 1], 1e6),
        Some('G' | 'g') => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    let value: f64 = num
        .parse()
        .map_err(|_| format!("Invalid frequency {s:?}"))?;
    let value = value * mult;
    if !value.is_finite() {
        return Err(format!("Invalid frequency {s:?}"));
    }
    Ok(value)
}

fn parse_scale(s: &str) -> Result<Scale, String> {
    s.parse().map_err(|e: crate::error::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hz() {
        assert_eq!(parse_hz("200k").unwrap(), 200e3);
        assert_eq!(parse_hz("2M").unwrap(), 2e6);
        assert_eq!(parse_hz("1.5G").unwrap(), 1.5e9);
        assert_eq!(parse_hz("1e6").unwrap(), 1e6);
        assert_eq!(parse_hz("100e6").unwrap(), 100e6);
        assert_eq!(parse_hz("1000").unwrap(), 1000.0);
        assert!(parse_hz("fast").is_err());
        assert!(parse_hz("").is_err());
        assert!(parse_hz("k").is_err());
    }

    #[test]
    fn test_no_args_is_an_error() {
        assert!(PsdArgs::try_parse_from(["psd_consumer"]).is_err());
        assert!(DemodArgs::try_parse_from(["demod_consumer"]).is_err());
        assert!(RunnerArgs::try_parse_from(["realtime_runner"]).is_err());
    }

    #[test]
    fn test_psd_args() {
        let args =
            PsdArgs::try_parse_from(["psd_consumer", "-f", "100e6", "-s", "2e6", "-w", "1e3"])
                .unwrap();
        assert_eq!(args.freq, 100e6);
        assert_eq!(args.rate, 2e6);
        assert_eq!(args.rbw, 1e3);
        assert_eq!(args.scale, Scale::Dbm);
        assert_eq!(args.output, PathBuf::from("psd.png"));
        let args = PsdArgs::try_parse_from([
            "psd_consumer", "-f", "1M", "-s", "1M", "--scale", "dBFS",
        ])
        .unwrap();
        assert_eq!(args.rbw, DEFAULT_RBW_HZ);
        assert_eq!(args.scale, Scale::Dbfs);
        assert!(PsdArgs::try_parse_from([
            "psd_consumer", "-f", "1M", "-s", "1M", "--scale", "watts",
        ])
        .is_err());
    }

    #[test]
    fn test_demod_args() {
        let args = DemodArgs::try_parse_from([
            "demod_consumer", "-f", "100e6", "-t", "FM", "-s", "2e6", "-b", "200k",
        ])
        .unwrap();
        assert_eq!(args.freq, 100e6);
        assert_eq!(args.signal, "FM");
        assert_eq!(args.rate, 2e6);
        assert_eq!(args.bandwidth, 200e3);
        assert_eq!(args.decimate_to, None);
        assert_eq!(args.sink, "default");
        assert_eq!(args.center, None);
        assert_eq!(args.audio_rate, None);
        assert!(!args.metrics);
        let args = DemodArgs::try_parse_from([
            "demod_consumer", "-f", "100.3M", "--center", "100M", "-t", "AM", "-s", "2M", "-b",
            "10k", "--audio-rate", "48000", "-m",
        ])
        .unwrap();
        assert_eq!(args.center, Some(100e6));
        assert_eq!(args.audio_rate, Some(48000));
        assert!(args.metrics);
    }

    #[test]
    fn test_runner_args() {
        let args = RunnerArgs::try_parse_from([
            "realtime_runner", "-f", "98M", "-d", "FM", "-l", "16", "-a",
        ])
        .unwrap();
        assert_eq!(args.freq, Some(98e6));
        assert_eq!(args.rate, 2e6);
        assert_eq!(args.demod.as_deref(), Some("FM"));
        assert_eq!(args.lna_gain, Some(16));
        assert!(args.amp);
        let args = RunnerArgs::try_parse_from([
            "realtime_runner", "--job-url", "http://collector", "--device-id", "2c:cf:67:51:17:be",
        ])
        .unwrap();
        assert_eq!(args.freq, None);
        assert_eq!(args.job_url.as_deref(), Some("http://collector"));
    }
}

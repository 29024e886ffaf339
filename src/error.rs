//! Crate-wide error type

use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide whether a failure ends a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameters, caught before anything starts
    Config,
    /// Missing or malformed data, the caller may retry later
    Data,
    /// Hardware, process or pipe failure, fatal to the current run
    Device,
    /// User-requested stop
    Interrupted,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown scale '{0}', expected one of dB, dBm, dBFS, V2/Hz")]
    UnknownScale(String),
    #[error("unknown signal type '{0}', expected FM or AM")]
    UnknownSignalType(String),
    #[error("insufficient data: need {needed} samples, have {available}")]
    InsufficientData { needed: usize, available: usize },
    #[error("invalid PSD data: {0}")]
    InvalidPsd(&'static str),
    #[error("no PSD frame available")]
    NoFrame,
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} exited unexpectedly")]
    ProcessDied(String),
    #[error("named pipe {path}: {source}")]
    Pipe {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to render plot: {0}")]
    Render(#[from] image::ImageError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::UnknownScale(_)
            | Error::UnknownSignalType(_)
            | Error::UnknownDevice(_) => ErrorKind::Config,
            Error::InsufficientData { .. }
            | Error::InvalidPsd(_)
            | Error::NoFrame
            | Error::Json(_)
            | Error::Http(_)
            | Error::Render(_) => ErrorKind::Data,
            Error::Spawn { .. }
            | Error::ProcessDied(_)
            | Error::Pipe { .. }
            | Error::Device(_)
            | Error::Io(_) => ErrorKind::Device,
            Error::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Whether this error must tear down the pipeline instead of being logged and skipped
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Device
    }

    /// HTTP-style status for errors surfaced to a client
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NoFrame | Error::UnknownDevice(_) => 404,
            Error::InvalidPsd(_)
            | Error::InvalidArgument(_)
            | Error::UnknownScale(_)
            | Error::UnknownSignalType(_)
            | Error::InsufficientData { .. }
            | Error::Json(_) => 400,
            _ => 500,
        }
    }
}

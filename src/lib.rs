pub mod args;
pub mod capture;
pub mod complex;
pub mod demod;
pub mod error;
pub mod exfil;
pub mod job;
pub mod monitoring;
pub mod persist;
pub mod pipeline;
pub mod ring;
pub mod welch;
pub mod worker;

pub use complex::{IqSample, FULL_SCALE};
pub use error::{Error, ErrorKind, Result};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Host-side failures. Guest-visible errors never surface here: those are
/// status bits and result bytes handed back through the port interface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{device}{unit} is not attached")]
    NotAttached { device: &'static str, unit: usize },

    #[error("{device}{unit} does not exist")]
    NoSuchUnit { device: &'static str, unit: usize },

    #[error("unknown disk format '{0}'")]
    UnknownFormat(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("cannot listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid port mapping: {0}")]
    PortMapping(String),

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

pub type Result<T> = std::result::Result<T, Error>;

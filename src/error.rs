//! Crate-wide error kinds (spec §7).

use std::io;
use std::path::PathBuf;

#[remain::sorted]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gadget descriptor filesystem is malformed or absent. Fatal at startup.
    #[error("configuration error at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Kernel device open/ioctl failure. Most are fatal; EAGAIN is handled
    /// before it ever reaches this variant.
    #[error("device error during {op}: {source}")]
    Device { op: &'static str, source: io::Error },

    /// A requested pixel format was rejected by the video source.
    #[error("invalid format requested: {fourcc}")]
    InvalidFormat { fourcc: u32 },

    /// A malformed event payload, or a DATA event with no pending control.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Buffer allocation or mapping failed.
    #[error("resource error during {op}: {source}")]
    Resource { op: &'static str, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn device(op: &'static str, source: io::Error) -> Self {
        Error::Device { op, source }
    }

    pub fn resource(op: &'static str, source: io::Error) -> Self {
        Error::Resource { op, source }
    }

    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Config { path: path.into(), reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }
}

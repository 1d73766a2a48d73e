use std::io;

use thiserror::Error;

/// Errors raised by the switch control plane and the virtual socket adapters
///
/// The data plane never surfaces these: malformed or unexpected packets are
/// logged and dropped.
#[derive(Error, Debug)]
pub enum Error {
    /// Duplicate alias, CIDR, IP or VNI
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unknown alias, IP, VNI or flow
    #[error("not found: {0}")]
    NotFound(String),

    /// Input is inconsistent with the network it is applied to
    #[error("validation failed: {0}")]
    Validation(String),

    /// A frame or packet could not be decoded
    #[error("malformed packet: {0}")]
    Packet(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn io(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        Self::Io(io::Error::new(kind, msg.into()))
    }
}

impl From<smoltcp::wire::Error> for Error {
    fn from(e: smoltcp::wire::Error) -> Self {
        Self::Packet(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

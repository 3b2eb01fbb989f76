//! Error kinds, one `thiserror` enum per layer, composed into one top-level
//! [`Error`] for the binary. Grounded on the layered `err` module of
//! `etherparse` (many small per-concern error types) but collapsed to the
//! handful of kinds this crate actually distinguishes: configuration,
//! resolution, and permission failures are fatal at startup; everything
//! else propagates as a typed event instead.

use std::net::IpAddr;

use thiserror::Error;

/// Errors raised while building or mutating a [`crate::field::Field`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("field '{0}' does not exist in this layer's schema")]
    UnknownField(String),
    #[error("field '{name}' has type {expected:?}, got {actual:?}")]
    TypeMismatch {
        name: String,
        expected: crate::field::FieldType,
        actual: crate::field::FieldType,
    },
    #[error("buffer too small to hold field '{name}' at bit offset {bit_offset}")]
    BufferTooSmall { name: String, bit_offset: usize },
    #[error("cannot compare fields of different types ({0:?} vs {1:?})")]
    Incomparable(crate::field::FieldType, crate::field::FieldType),
}

/// Errors raised by the protocol registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("no next-protocol rule matched value {0:#x} in layer '{1}'")]
    NoNextProtocol(u16, String),
}

/// Errors raised while serializing or parsing a [`crate::probe::Probe`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("probe buffer of {have} bytes too small, need at least {need}")]
    BufferTooSmall { have: usize, need: usize },
    #[error("no protocol layers installed")]
    Empty,
}

/// Errors raised by the [`crate::network::Network`] layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("permission denied opening raw socket (need CAP_NET_RAW): {0}")]
    Permission(#[source] std::io::Error),
    #[error("failed to send probe: {0}")]
    Send(#[source] std::io::Error),
    #[error("message too large for one datagram")]
    MessageTooLarge,
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Errors surfaced by algorithm instances.
#[derive(Debug, Error)]
pub enum AlgorithmError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("option '{0}' is not valid for this algorithm")]
    BadOption(String),
    #[error("algorithm instance {0} is not addressable once the loop has finished")]
    MissingInstance(crate::algorithm::InstanceId),
    #[error("instance was not constructed as a '{0}'")]
    UnexpectedKind(&'static str),
    #[error("reply carried a probe with no id, but every in-flight probe is assigned one by Network::send")]
    MissingProbeId,
}

/// Startup-only errors: configuration, resolution, permission. These are
/// the only ones that become a process exit code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("could not resolve host '{host}': {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("permission error: {0}")]
    Permission(#[from] NetworkError),
    #[error(transparent)]
    Algorithm(#[from] AlgorithmError),
    #[error("no address family could be determined for {0}")]
    AmbiguousAddressFamily(IpAddr),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

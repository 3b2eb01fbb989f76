//! Flow-preserving (Paris) traceroute with an optional multipath (MDA)
//! discovery mode.
//!
//! Module map mirrors the component table: [`field`] and [`proto`] are the
//! typed-field/protocol-registry layer probes are built from; [`probe`] is
//! the probe itself; [`network`] owns the raw sockets and reply
//! correlation; [`pt_loop`] is the cooperative scheduler; [`algorithm`]
//! hosts the running instances, with [`algorithm::traceroute`] and
//! [`algorithm::mda`] the two concrete algorithms. [`resolve`], [`output`],
//! and [`cli`] are the ambient CLI/IO surface around that core.

pub mod algorithm;
pub mod cli;
pub mod error;
pub mod field;
pub mod network;
pub mod output;
pub mod proto;
pub mod pt_loop;
pub mod probe;
pub mod resolve;
#[cfg(test)]
pub mod test_support;

pub use error::{Error, Result};

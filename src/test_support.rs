//! Deterministic in-memory [`crate::network::NetworkHandle`] double for
//! scenario tests. Test-only: lets a scenario drive an
//! [`crate::algorithm::Algorithm`] through `start`/`handle_event` without a
//! real raw socket, then script synthetic [`crate::algorithm::Event`]s back
//! at it by inspecting exactly what it sent.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::NetworkError;
use crate::network::NetworkHandle;
use crate::probe::{Probe, ProbeId};

/// Records every probe handed to `send`, assigning ids in order; never
/// actually touches the network. `set_timeout` is a no-op — scenarios
/// decide for themselves when a probe "times out" by sending a
/// [`crate::algorithm::Event::Timeout`] directly.
pub struct FakeNetwork {
    pub sent: Vec<(ProbeId, Probe, SocketAddr)>,
    next_id: u64,
}

impl FakeNetwork {
    pub fn new() -> Self {
        FakeNetwork { sent: Vec::new(), next_id: 1 }
    }

    /// The probe sent with the given id, if any.
    pub fn probe(&self, id: ProbeId) -> Option<&Probe> {
        self.sent.iter().find(|(sent_id, _, _)| *sent_id == id).map(|(_, probe, _)| probe)
    }
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkHandle for FakeNetwork {
    fn send(&mut self, mut probe: Probe, dest: SocketAddr) -> Result<ProbeId, NetworkError> {
        let id = ProbeId(self.next_id);
        self.next_id += 1;
        probe.set_id(id);
        self.sent.push((id, probe, dest));
        Ok(id)
    }

    fn set_timeout(&mut self, _id: ProbeId, _timeout: Duration) {}
}

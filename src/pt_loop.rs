//! pt_loop: the single-threaded cooperative scheduler. Owns the
//! [`crate::network::Network`] handle and the set of running algorithm
//! instances; nothing here ever blocks except inside the poll step.
//!
//! `etherparse` has no event loop of its own — it's a pure codec library —
//! so the turn structure (drain timeouts, fire timers, drive/reap
//! algorithms, poll, dispatch) is original to this crate, built on
//! `nix::poll` the way other raw-socket daemons use it.

use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, trace};

use crate::algorithm::{Algorithm, AlgorithmHandle, AlgorithmRegistry, Event, InstanceId};
use crate::error::AlgorithmError;
use crate::network::{Network, Reply};
use crate::probe::ProbeId;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    AllAlgorithmsDone,
    Terminated,
}

/// The cooperative event loop driving every running algorithm instance off
/// one [`Network`] handle. A single turn is: (1) let algorithms react to
/// timed-out probes, (2) let algorithms react to due timers, (3) let newly
/// started/advanced algorithms send probes, (4) suspend in `poll(2)` until
/// the socket is readable or the next timer is due, (5) drain readable
/// datagrams and dispatch matches to their owning algorithm.
pub struct PtLoop {
    network: Network,
    registry: AlgorithmRegistry,
    terminated: bool,
}

impl PtLoop {
    pub fn new(network: Network) -> Self {
        PtLoop {
            network,
            registry: AlgorithmRegistry::new(),
            terminated: false,
        }
    }

    /// Registers and starts an algorithm instance, returning the id to
    /// retrieve it later through [`PtLoop::algorithm`].
    pub fn algorithm_add(&mut self, handle: AlgorithmHandle) -> Result<InstanceId, AlgorithmError> {
        self.registry.add(handle, &mut self.network)
    }

    /// Looks up a registered instance by id, running or finished, so a
    /// caller can downcast it (via [`Algorithm::as_any`]) and read its
    /// results after [`PtLoop::run`] returns.
    pub fn algorithm(&self, id: InstanceId) -> Option<&dyn Algorithm> {
        self.registry.get(id)
    }

    /// Idempotent: a second call after the loop has already stopped is a
    /// no-op.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Runs turns until every algorithm instance has finished or
    /// [`PtLoop::terminate`] is called.
    pub fn run(&mut self) -> Result<StopReason, AlgorithmError> {
        loop {
            if self.terminated {
                return Ok(StopReason::Terminated);
            }
            if self.registry.is_empty() {
                return Ok(StopReason::AllAlgorithmsDone);
            }
            self.turn()?;
        }
    }

    fn turn(&mut self) -> Result<(), AlgorithmError> {
        let now = Instant::now();

        // Step 1: timed-out probes become Timeout events for their owner.
        for id in self.network.drain_timeouts(now) {
            self.dispatch_timeout(id)?;
        }

        // Step 2: due algorithm timers.
        let due = self.registry.due_timers(now);
        for (instance, timer) in due {
            self.registry.fire_timer(instance, timer, &mut self.network)?;
        }

        // Step 3: let every instance advance (send new probes, terminate).
        self.registry.drive_all(&mut self.network)?;
        self.registry.reap_finished();

        if self.registry.is_empty() {
            return Ok(());
        }

        // Step 4: suspend until the ICMP socket is readable or a timer
        // fires, whichever is sooner. Never blocks indefinitely: there is
        // always a next timeout in flight while any instance is alive.
        let timer_deadline = self.registry.next_deadline(now);
        let network_deadline = self.network.next_timeout().map(|at| at.saturating_duration_since(now));
        let wait = match (timer_deadline, network_deadline) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => Duration::from_millis(50),
        };
        let mut fds = [PollFd::new(self.network.recv_fd(), PollFlags::POLLIN)];
        let timeout_ms = i32::try_from(wait.as_millis()).unwrap_or(i32::MAX).max(1);
        match poll(&mut fds, timeout_ms) {
            Ok(n) if n > 0 => trace!("poll woke on readability"),
            Ok(_) => trace!("poll woke on timeout"),
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(e) => return Err(AlgorithmError::Network(crate::error::NetworkError::Send(e.into()))),
        }

        // Step 5: drain and dispatch every datagram currently queued.
        loop {
            match self.network.on_readable() {
                Ok(Some(Reply::Unmatched)) => continue,
                Ok(Some(reply)) => self.dispatch_reply(reply)?,
                Ok(None) => break,
                Err(e) => return Err(AlgorithmError::Network(e)),
            }
        }
        Ok(())
    }

    fn dispatch_timeout(&mut self, id: ProbeId) -> Result<(), AlgorithmError> {
        if let Some(instance) = self.registry.owner_of(id) {
            debug!(probe_id = id.0, "probe timed out");
            self.registry.send_event(instance, Event::Timeout { probe_id: id }, &mut self.network)?;
        }
        Ok(())
    }

    fn dispatch_reply(&mut self, reply: Reply) -> Result<(), AlgorithmError> {
        match reply {
            Reply::IcmpError { probe, icmp_type, code, from } => {
                let id = probe.id().ok_or(AlgorithmError::MissingProbeId)?;
                if let Some(instance) = self.registry.owner_of(id) {
                    self.registry.send_event(
                        instance,
                        Event::IcmpReply { probe, icmp_type, code, from },
                        &mut self.network,
                    )?;
                }
            }
            Reply::DestinationReached { probe, from } => {
                let id = probe.id().ok_or(AlgorithmError::MissingProbeId)?;
                if let Some(instance) = self.registry.owner_of(id) {
                    self.registry.send_event(
                        instance,
                        Event::DestinationReached { probe, from },
                        &mut self.network,
                    )?;
                }
            }
            Reply::Unmatched => {}
        }
        Ok(())
    }
}

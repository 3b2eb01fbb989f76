//! Algorithm runtime: the registry of running algorithm instances, their
//! event dispatch, and the probe-ownership map `pt_loop` consults to route
//! timeouts and replies back to the instance that sent the probe.
//!
//! This has no direct donor in `etherparse` (a pure codec has no notion of
//! a running instance); the trait shape follows the handler-object pattern
//! `etherparse::PacketHeaders`' builder-style APIs use for pluggable steps,
//! generalized here to a stateful instance with an explicit lifecycle.

pub mod mda;
pub mod traceroute;

use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::error::AlgorithmError;
use crate::network::NetworkHandle;
use crate::probe::ProbeId;

pub type InstanceId = usize;

/// Events an algorithm instance reacts to.
#[derive(Debug)]
pub enum Event {
    Timeout { probe_id: ProbeId },
    IcmpReply { probe: crate::probe::Probe, icmp_type: u8, code: u8, from: IpAddr },
    DestinationReached { probe: crate::probe::Probe, from: IpAddr },
}

/// One running algorithm instance. Implementations never block: every
/// method either returns immediately or schedules a timer for `pt_loop` to
/// fire later.
pub trait Algorithm: Send {
    fn name(&self) -> &'static str;

    /// Sends whatever initial probes the algorithm starts with, returning
    /// their ids so the registry can route future events back here.
    fn start(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError>;

    /// Reacts to a timeout or reply, returning any newly sent probe ids.
    fn handle_event(&mut self, event: Event, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError>;

    fn is_finished(&self) -> bool;

    /// When this instance next wants to be woken with no corresponding
    /// network event (e.g. MDA's inter-round pacing). `None` if it only
    /// reacts to probe timeouts/replies.
    fn next_timer(&self) -> Option<Instant> {
        None
    }

    fn fire_timer(&mut self, _net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        Ok(Vec::new())
    }

    /// Lets callers holding a `dyn Algorithm` (e.g. the binary, after
    /// `pt_loop::PtLoop::run` returns) downcast back to the concrete type to
    /// read its results.
    fn as_any(&self) -> &dyn Any;
}

pub type AlgorithmHandle = Box<dyn Algorithm>;

struct Slot {
    algorithm: AlgorithmHandle,
    reaped: bool,
}

/// Holds every running instance plus the probe-id -> instance map used to
/// route events. Instances are never dropped once added, only marked
/// reaped, so a caller can still retrieve results after completion via
/// [`AlgorithmRegistry::get`].
pub struct AlgorithmRegistry {
    instances: Vec<Slot>,
    probe_owner: HashMap<u64, InstanceId>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        AlgorithmRegistry {
            instances: Vec::new(),
            probe_owner: HashMap::new(),
        }
    }

    /// Registers and starts an instance, returning the id callers use to
    /// retrieve it later via [`AlgorithmRegistry::get`].
    pub fn add(&mut self, mut algorithm: AlgorithmHandle, net: &mut dyn NetworkHandle) -> Result<InstanceId, AlgorithmError> {
        let sent = algorithm.start(net)?;
        let id = self.instances.len();
        for probe_id in sent {
            self.probe_owner.insert(probe_id.0, id);
        }
        self.instances.push(Slot { algorithm, reaped: false });
        Ok(id)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.iter().all(|slot| slot.reaped)
    }

    /// Looks up an instance by id, whether still running or already
    /// finished. Finished instances stay addressable here so a caller can
    /// read results back out after [`crate::pt_loop::PtLoop::run`] returns;
    /// only their probe-ownership entries are dropped at reap time.
    pub fn get(&self, id: InstanceId) -> Option<&dyn Algorithm> {
        self.instances.get(id).map(|slot| slot.algorithm.as_ref())
    }

    pub fn owner_of(&self, probe_id: ProbeId) -> Option<InstanceId> {
        self.probe_owner.get(&probe_id.0).copied()
    }

    pub fn send_event(
        &mut self,
        instance: InstanceId,
        event: Event,
        net: &mut dyn NetworkHandle,
    ) -> Result<(), AlgorithmError> {
        if let Some(slot) = self.instances.get_mut(instance).filter(|s| !s.reaped) {
            let sent = slot.algorithm.handle_event(event, net)?;
            for probe_id in sent {
                self.probe_owner.insert(probe_id.0, instance);
            }
        }
        Ok(())
    }

    /// A hook for instances whose next action isn't gated on an event or
    /// timer. Neither the traceroute nor MDA
    /// algorithm needs this today; kept so a future algorithm can advance
    /// without waiting on the network.
    pub fn drive_all(&mut self, _net: &mut dyn NetworkHandle) -> Result<(), AlgorithmError> {
        Ok(())
    }

    pub fn due_timers(&self, now: Instant) -> Vec<(InstanceId, ())> {
        self.instances
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                if slot.reaped {
                    return None;
                }
                let due = slot.algorithm.next_timer()?;
                (due <= now).then_some((id, ()))
            })
            .collect()
    }

    pub fn fire_timer(&mut self, instance: InstanceId, _timer: (), net: &mut dyn NetworkHandle) -> Result<(), AlgorithmError> {
        if let Some(slot) = self.instances.get_mut(instance).filter(|s| !s.reaped) {
            let sent = slot.algorithm.fire_timer(net)?;
            for probe_id in sent {
                self.probe_owner.insert(probe_id.0, instance);
            }
        }
        Ok(())
    }

    /// Soonest of any instance's requested timer, relative to `now`.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.instances
            .iter()
            .filter(|slot| !slot.reaped)
            .filter_map(|slot| slot.algorithm.next_timer())
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    /// Marks instances that reported finished as reaped and drops their
    /// probe ownership entries, so the loop can notice all work is done.
    /// The algorithm itself stays in place for [`AlgorithmRegistry::get`].
    pub fn reap_finished(&mut self) {
        for (id, slot) in self.instances.iter_mut().enumerate() {
            if !slot.reaped && slot.algorithm.is_finished() {
                slot.reaped = true;
                self.probe_owner.retain(|_, owner| *owner != id);
            }
        }
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

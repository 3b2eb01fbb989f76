//! Paris traceroute: a straight Start/Probing/Waiting state machine over
//! one fixed flow, varying only TTL.
//!
//! Structured as a small explicit state machine the way `etherparse`
//! structures its slice-reader state transitions, step by step through a
//! packet's layers, generalized here from "advance a cursor through
//! bytes" to "advance a cursor through TTLs".

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::algorithm::{Algorithm, Event};
use crate::error::AlgorithmError;
use crate::field::Field;
use crate::network::NetworkHandle;
use crate::probe::{self, AddressFamily, Probe, ProbeId};

#[derive(Debug, Clone)]
pub struct TracerouteOptions {
    pub family: AddressFamily,
    pub src_ip: IpAddr,
    pub dest: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub num_probes: u8,
    pub max_stars: u8,
    pub timeout: Duration,
}

/// What one probe at a hop came back with.
#[derive(Debug, Clone)]
pub struct HopOutcome {
    pub from: Option<IpAddr>,
    pub rtt: Option<Duration>,
    /// Set for an ICMP reply that isn't the expected `TimeExceeded`
    /// hop-reply (or the destination's port-unreachable) — e.g. host/net
    /// unreachable. Per §6's stdout format, these print with a `!` marker
    /// instead of a bare address.
    pub icmp_error: bool,
}

/// Classifies an ICMP reply as the ordinary `TimeExceeded` hop signal or
/// some other remote error, per family.
fn is_time_exceeded(family: AddressFamily, icmp_type: u8, code: u8) -> bool {
    match family {
        AddressFamily::V4 => matches!(
            crate::proto::icmpv4::classify(icmp_type, code),
            crate::proto::icmpv4::Icmpv4Kind::TimeExceeded
        ),
        AddressFamily::V6 => matches!(
            crate::proto::icmpv6::classify(icmp_type, code),
            crate::proto::icmpv6::Icmpv6Kind::TimeExceeded
        ),
    }
}

#[derive(Debug, Clone)]
pub struct HopRecord {
    pub ttl: u8,
    pub outcomes: Vec<HopOutcome>,
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    DestinationReached,
    TooManyStars,
    MaxTtlReached,
}

pub struct TracerouteAlgorithm {
    opts: TracerouteOptions,
    current_ttl: u8,
    sent_this_ttl: u8,
    outcomes_this_ttl: Vec<HopOutcome>,
    destination_reached_this_ttl: bool,
    consecutive_all_star_hops: u8,
    hops: Vec<HopRecord>,
    finished: bool,
    termination: Option<TerminationReason>,
}

impl TracerouteAlgorithm {
    pub fn new(opts: TracerouteOptions) -> Self {
        let min_ttl = opts.min_ttl;
        TracerouteAlgorithm {
            opts,
            current_ttl: min_ttl,
            sent_this_ttl: 0,
            outcomes_this_ttl: Vec::new(),
            destination_reached_this_ttl: false,
            consecutive_all_star_hops: 0,
            hops: Vec::new(),
            finished: false,
            termination: None,
        }
    }

    pub fn hops(&self) -> &[HopRecord] {
        &self.hops
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    fn build_probe(&self) -> Result<Probe, AlgorithmError> {
        let mut probe = Probe::create();
        probe.set_protocols(&[probe::ip_layer_name(self.opts.family), "udp"])?;
        let ip_layer = probe::ip_layer_name(self.opts.family);
        probe.set_field_qualified(ip_layer, Field::address("src_ip", self.opts.src_ip))?;
        probe.set_field_qualified(ip_layer, Field::address("dst_ip", self.opts.dest))?;
        probe.set_field_qualified(
            ip_layer,
            Field::i8(probe::protocol_field_name(self.opts.family), 17),
        )?;
        probe.set_field_qualified(
            ip_layer,
            Field::i8(probe::ttl_field_name(self.opts.family), self.current_ttl),
        )?;
        probe.set_field("src_port", Field::i16("src_port", self.opts.src_port))?;
        probe.set_field("dst_port", Field::i16("dst_port", self.opts.dst_port))?;
        Ok(probe)
    }

    fn send_ttl_batch(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        self.outcomes_this_ttl.clear();
        self.destination_reached_this_ttl = false;
        let mut ids = Vec::with_capacity(self.opts.num_probes as usize);
        for _ in 0..self.opts.num_probes {
            let probe = self.build_probe()?;
            let id = net.send(probe, SocketAddr::new(self.opts.dest, 0))?;
            net.set_timeout(id, self.opts.timeout);
            ids.push(id);
        }
        self.sent_this_ttl = ids.len() as u8;
        Ok(ids)
    }

    fn evaluate_hop(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        let hop = HopRecord {
            ttl: self.current_ttl,
            outcomes: std::mem::take(&mut self.outcomes_this_ttl),
        };
        let all_stars = hop.outcomes.iter().all(|o| o.from.is_none());
        let destination_reached = self.destination_reached_this_ttl;
        self.hops.push(hop);

        if destination_reached {
            self.finished = true;
            self.termination = Some(TerminationReason::DestinationReached);
            return Ok(Vec::new());
        }

        self.consecutive_all_star_hops = if all_stars { self.consecutive_all_star_hops + 1 } else { 0 };
        if self.consecutive_all_star_hops >= self.opts.max_stars {
            self.finished = true;
            self.termination = Some(TerminationReason::TooManyStars);
            return Ok(Vec::new());
        }

        self.current_ttl += 1;
        if self.current_ttl > self.opts.max_ttl {
            self.finished = true;
            self.termination = Some(TerminationReason::MaxTtlReached);
            return Ok(Vec::new());
        }

        self.send_ttl_batch(net)
    }
}

impl Algorithm for TracerouteAlgorithm {
    fn name(&self) -> &'static str {
        "traceroute"
    }

    fn start(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        self.send_ttl_batch(net)
    }

    fn handle_event(&mut self, event: Event, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        match event {
            Event::Timeout { .. } => {
                self.outcomes_this_ttl.push(HopOutcome { from: None, rtt: None, icmp_error: false });
            }
            Event::IcmpReply { probe, from, icmp_type, code } => {
                let rtt = probe.sending_time().zip(probe.recv_time()).map(|(s, r)| r.duration_since(s));
                let icmp_error = !is_time_exceeded(self.opts.family, icmp_type, code);
                self.outcomes_this_ttl.push(HopOutcome { from: Some(from), rtt, icmp_error });
            }
            Event::DestinationReached { probe, from } => {
                let rtt = probe.sending_time().zip(probe.recv_time()).map(|(s, r)| r.duration_since(s));
                self.outcomes_this_ttl.push(HopOutcome { from: Some(from), rtt, icmp_error: false });
                self.destination_reached_this_ttl = true;
            }
        }

        if self.outcomes_this_ttl.len() as u8 == self.sent_this_ttl {
            self.evaluate_hop(net)
        } else {
            Ok(Vec::new())
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeNetwork;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn opts() -> TracerouteOptions {
        TracerouteOptions {
            family: AddressFamily::V4,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dest: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            src_port: 33000,
            dst_port: 33434,
            min_ttl: 1,
            max_ttl: 30,
            num_probes: 3,
            max_stars: 5,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn all_stars_streak_triggers_too_many_stars() {
        let mut algo = TracerouteAlgorithm::new(TracerouteOptions { max_stars: 2, ..opts() });
        // Simulate by driving evaluate_hop-equivalent state directly: three
        // consecutive all-timeout hops trips the counter at max_stars=2.
        for ttl in 1..=2u8 {
            algo.current_ttl = ttl;
            algo.outcomes_this_ttl = vec![
                HopOutcome { from: None, rtt: None, icmp_error: false },
                HopOutcome { from: None, rtt: None, icmp_error: false },
                HopOutcome { from: None, rtt: None, icmp_error: false },
            ];
            algo.destination_reached_this_ttl = false;
            let hop = HopRecord { ttl, outcomes: std::mem::take(&mut algo.outcomes_this_ttl) };
            let all_stars = hop.outcomes.iter().all(|o| o.from.is_none());
            algo.hops.push(hop);
            algo.consecutive_all_star_hops = if all_stars { algo.consecutive_all_star_hops + 1 } else { 0 };
        }
        assert!(algo.consecutive_all_star_hops >= algo.opts.max_stars);
    }

    #[test]
    fn fresh_instance_is_not_finished() {
        let algo = TracerouteAlgorithm::new(opts());
        assert!(!algo.is_finished());
        assert_eq!(algo.current_ttl, 1);
    }

    /// Three hops, each answered by a distinct router, the last one the
    /// destination. Expect three hop lines and a `DestinationReached`
    /// termination.
    #[test]
    fn simple_path_reaches_destination_in_three_hops() {
        let mut algo = TracerouteAlgorithm::new(TracerouteOptions { max_ttl: 10, ..opts() });
        let mut net = FakeNetwork::new();
        let hop_addrs = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
        ];

        let mut ids = algo.start(&mut net).unwrap();
        for (hop_index, addr) in hop_addrs.iter().enumerate() {
            assert_eq!(ids.len(), 3);
            let is_last_hop = hop_index == hop_addrs.len() - 1;
            let mut result = Vec::new();
            for id in &ids {
                let probe = net.probe(*id).unwrap().clone();
                let event = if is_last_hop {
                    Event::DestinationReached { probe, from: *addr }
                } else {
                    Event::IcmpReply { probe, icmp_type: 11, code: 0, from: *addr }
                };
                result = algo.handle_event(event, &mut net).unwrap();
            }
            ids = result;
        }

        assert_eq!(algo.hops().len(), 3);
        assert!(algo.is_finished());
        assert_eq!(algo.termination(), Some(TerminationReason::DestinationReached));
        for (hop, addr) in algo.hops().iter().zip(hop_addrs.iter()) {
            assert!(hop.outcomes.iter().all(|o| o.from == Some(*addr)));
        }
    }

    /// A hop that drops every probe reports `* * *` and the run continues
    /// rather than stopping on a single star hop.
    #[test]
    fn star_hop_reports_all_stars_and_the_run_continues() {
        let mut algo = TracerouteAlgorithm::new(TracerouteOptions { max_ttl: 5, ..opts() });
        let mut net = FakeNetwork::new();
        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let ids_ttl1 = algo.start(&mut net).unwrap();
        let mut ids_ttl2 = Vec::new();
        for id in &ids_ttl1 {
            let probe = net.probe(*id).unwrap().clone();
            ids_ttl2 = algo.handle_event(Event::IcmpReply { probe, icmp_type: 11, code: 0, from: router }, &mut net).unwrap();
        }
        assert_eq!(ids_ttl2.len(), 3);

        for id in &ids_ttl2 {
            algo.handle_event(Event::Timeout { probe_id: *id }, &mut net).unwrap();
        }

        assert_eq!(algo.hops()[1].ttl, 2);
        assert!(algo.hops()[1].outcomes.iter().all(|o| o.from.is_none()));
        assert!(!algo.is_finished());
    }

    /// A fixed-flow probe batch all shares one `src_port`, so an ECMP hop
    /// that splits traffic by port parity must land every probe on the
    /// same branch.
    #[test]
    fn fixed_flow_observes_only_one_load_balanced_branch() {
        let mut algo = TracerouteAlgorithm::new(TracerouteOptions { max_ttl: 2, num_probes: 4, ..opts() });
        let mut net = FakeNetwork::new();
        let branch_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 21));
        let branch_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 22));

        let ids = algo.start(&mut net).unwrap();
        let mut seen = HashSet::new();
        for id in &ids {
            let probe = net.probe(*id).unwrap().clone();
            let src_port = probe.extract("src_port").unwrap().as_u16().unwrap();
            let branch = if src_port % 2 == 0 { branch_a } else { branch_b };
            seen.insert(branch);
            algo.handle_event(Event::IcmpReply { probe, icmp_type: 11, code: 0, from: branch }, &mut net).unwrap();
        }

        assert_eq!(seen.len(), 1);
    }

    /// A remote ICMP error other than `TimeExceeded` (here, host
    /// unreachable) is a hop outcome, not a fatal error — the run
    /// continues, but the outcome is flagged so output renders a `!`.
    #[test]
    fn non_time_exceeded_icmp_error_is_flagged_and_run_continues() {
        let mut algo = TracerouteAlgorithm::new(TracerouteOptions { max_ttl: 5, num_probes: 1, ..opts() });
        let mut net = FakeNetwork::new();
        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let ids = algo.start(&mut net).unwrap();
        let probe = net.probe(ids[0]).unwrap().clone();
        // type 3 / code 1: host unreachable, not port-unreachable.
        algo.handle_event(Event::IcmpReply { probe, icmp_type: 3, code: 1, from: router }, &mut net).unwrap();

        assert!(algo.hops()[0].outcomes[0].icmp_error);
        assert!(!algo.is_finished());
    }
}

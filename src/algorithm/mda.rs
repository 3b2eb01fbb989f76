//! MDA, the Multipath Detection Algorithm: discovers every load-balanced
//! next hop at each distance by varying a probe's secondary flow field
//! (source port) while holding TTL fixed, stopping once a confidence
//! bound is met, and walks each discovered interface forward as its own
//! branch so the result is a lattice of interfaces *and* the flow-annotated
//! links between them, not just a per-hop interface list.
//!
//! The stopping-rule table has no counterpart in `etherparse` (it's pure
//! combinatorics from the Augustin et al. MDA paper, not a wire format);
//! grounded here only in the general "small lookup table precomputed once"
//! shape `etherparse`'s EtherType/IpNumber constant tables use.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::algorithm::{Algorithm, Event};
use crate::error::AlgorithmError;
use crate::field::Field;
use crate::network::NetworkHandle;
use crate::probe::{self, AddressFamily, Probe, ProbeId};

#[derive(Debug, Clone)]
pub struct MdaOptions {
    pub family: AddressFamily,
    pub src_ip: IpAddr,
    pub dest: IpAddr,
    pub dst_port: u16,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub bound: f64,
    pub max_branch: usize,
    pub timeout: Duration,
}

/// Precomputed `n(k)`: the number of additional probes sent to a hop with
/// `k` known interfaces, without discovering a new one, needed before the
/// probability of a missed `(k+1)`th branch drops to `bound`.
///
/// `n(k)` is the smallest `n` with `(1 - 1/(k+1))^n <= bound/(k+1)`.
pub struct StoppingTable {
    by_k: Vec<usize>,
}

impl StoppingTable {
    pub fn compute(bound: f64, max_branch: usize) -> Self {
        let mut by_k = Vec::with_capacity(max_branch + 1);
        // n(0): a single probe always "discovers" the first interface;
        // there is no stopping-rule test to run before that.
        by_k.push(1);
        for k in 1..=max_branch {
            let kf = k as f64;
            let p_no_new = 1.0 - 1.0 / (kf + 1.0);
            let rhs = bound / (kf + 1.0);
            let n = (rhs.ln() / p_no_new.ln()).ceil();
            by_k.push((n as usize).max(1));
        }
        StoppingTable { by_k }
    }

    pub fn n(&self, k: usize) -> usize {
        self.by_k[k.min(self.by_k.len() - 1)]
    }
}

/// An interface observed at a given distance — a node in the MDA lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatticeNode {
    pub ttl: u8,
    pub addr: IpAddr,
}

/// A directed edge `src -> dst` in the MDA lattice, annotated with the flow
/// id (UDP source port) of the probe that actually witnessed it. `src` is
/// `None` for a node discovered at `min_ttl`, which hangs directly off the
/// vantage point rather than off another interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewLink {
    pub src: Option<LatticeNode>,
    pub dst: LatticeNode,
    pub flow_id: u16,
}

/// One hop's worth of in-progress discovery, rooted at a specific
/// predecessor interface (or at the vantage point itself, for `min_ttl`).
/// MDA explores every discovered interface as its own `Branch` one distance
/// further out, which is what turns "interfaces per hop" into "a lattice of
/// interfaces and links".
struct Branch {
    ttl: u8,
    predecessor: Option<LatticeNode>,
    /// Distinct interfaces discovered at this hop so far, paired with the
    /// flow id (UDP source port) of the probe that first produced each one.
    /// A child branch reuses that exact flow id as its own base so its
    /// probes keep landing on the same upstream branch that produced this
    /// interface, rather than re-randomizing and risking a different ECMP
    /// hash at the hop above.
    discovered: Vec<(IpAddr, u16)>,
    /// Interfaces in `discovered` that answered with a destination-reached
    /// reply rather than an intermediate hop reply — terminal, not walked
    /// any further.
    destination: Vec<IpAddr>,
    probes_since_new: usize,
    flow_tag_base: u16,
    next_flow_tag: u16,
    truncated: bool,
}

impl Branch {
    fn root(ttl: u8) -> Self {
        Branch {
            ttl,
            predecessor: None,
            discovered: Vec::new(),
            destination: Vec::new(),
            probes_since_new: 0,
            // Randomized so two independent runs never reuse the same port
            // sequence; a child branch below overrides this with the exact
            // flow id that confirmed its predecessor instead.
            flow_tag_base: rand::random(),
            next_flow_tag: 1,
            truncated: false,
        }
    }

    fn child(ttl: u8, predecessor: LatticeNode, flow_tag_base: u16) -> Self {
        Branch {
            ttl,
            predecessor: Some(predecessor),
            discovered: Vec::new(),
            destination: Vec::new(),
            probes_since_new: 0,
            flow_tag_base,
            next_flow_tag: 1,
            truncated: false,
        }
    }

    fn interfaces(&self) -> Vec<IpAddr> {
        self.discovered.iter().map(|(addr, _)| *addr).collect()
    }
}

pub struct MdaAlgorithm {
    opts: MdaOptions,
    table: StoppingTable,
    active: Branch,
    /// Branches discovered but not yet probed; explored breadth-first so
    /// the lattice fills in roughly in distance order.
    pending: VecDeque<Branch>,
    completed_hops: Vec<(u8, Vec<IpAddr>, bool)>,
    in_flight: usize,
    /// Flow id of the probe currently in flight for `active`, so the reply
    /// can be attributed to the exact flow that produced it.
    current_flow_id: u16,
    log: Vec<NewLink>,
    finished: bool,
}

impl MdaAlgorithm {
    pub fn new(opts: MdaOptions) -> Self {
        let table = StoppingTable::compute(opts.bound, opts.max_branch);
        let active = Branch::root(opts.min_ttl);
        MdaAlgorithm {
            opts,
            table,
            active,
            pending: VecDeque::new(),
            completed_hops: Vec::new(),
            in_flight: 0,
            current_flow_id: 0,
            log: Vec::new(),
            finished: false,
        }
    }

    /// The flow-annotated lattice edges discovered so far, in discovery
    /// order: each `((h-1, i') -> (h, i), flow_id)` triple names the exact
    /// probe flow that produced that hop pair.
    pub fn new_links(&self) -> &[NewLink] {
        &self.log
    }

    pub fn completed_hops(&self) -> &[(u8, Vec<IpAddr>, bool)] {
        &self.completed_hops
    }

    fn needs_more_probes(&self) -> bool {
        let k = self.active.discovered.len();
        if k >= self.opts.max_branch {
            return false;
        }
        self.active.probes_since_new < self.table.n(k)
    }

    fn build_probe(&mut self) -> Result<Probe, AlgorithmError> {
        let mut probe = Probe::create();
        let ip_layer = probe::ip_layer_name(self.opts.family);
        probe.set_protocols(&[ip_layer, "udp"])?;
        probe.set_field_qualified(ip_layer, Field::address("src_ip", self.opts.src_ip))?;
        probe.set_field_qualified(ip_layer, Field::address("dst_ip", self.opts.dest))?;
        probe.set_field_qualified(ip_layer, Field::i8(probe::protocol_field_name(self.opts.family), 17))?;
        probe.set_field_qualified(ip_layer, Field::i8(probe::ttl_field_name(self.opts.family), self.active.ttl))?;
        // Vary the source port per probe: different ECMP hash input, same
        // destination port, so each probe explores (and may land on) a
        // different load-balanced branch at this hop.
        let flow_id = self.active.flow_tag_base.wrapping_add(self.active.next_flow_tag);
        probe.set_field("src_port", Field::i16("src_port", flow_id))?;
        probe.set_field("dst_port", Field::i16("dst_port", self.opts.dst_port))?;
        self.active.next_flow_tag = self.active.next_flow_tag.wrapping_add(1);
        self.current_flow_id = flow_id;
        Ok(probe)
    }

    fn send_one(&mut self, net: &mut dyn NetworkHandle) -> Result<ProbeId, AlgorithmError> {
        let probe = self.build_probe()?;
        let id = net.send(probe, SocketAddr::new(self.opts.dest, 0))?;
        net.set_timeout(id, self.opts.timeout);
        self.in_flight += 1;
        Ok(id)
    }

    fn top_up(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        let mut ids = Vec::new();
        // Single probe in flight at a time per branch keeps the in-flight
        // table small; the stopping rule only needs a running count, not
        // concurrency.
        if self.in_flight == 0 && self.needs_more_probes() {
            ids.push(self.send_one(net)?);
        }
        Ok(ids)
    }

    fn record_hop_completion(&mut self, ttl: u8, interfaces: Vec<IpAddr>, truncated: bool) {
        if let Some(entry) = self.completed_hops.iter_mut().find(|(t, _, _)| *t == ttl) {
            for addr in interfaces {
                if !entry.1.contains(&addr) {
                    entry.1.push(addr);
                }
            }
            entry.2 |= truncated;
        } else {
            self.completed_hops.push((ttl, interfaces, truncated));
        }
    }

    /// Finishes `active`, queues a child branch for every interface it
    /// found that wasn't itself the destination, and pulls the next branch
    /// off `pending` (or marks the run finished once none are left).
    fn finalize_active_and_advance(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        let finished = std::mem::replace(&mut self.active, Branch::root(0));
        self.record_hop_completion(finished.ttl, finished.interfaces(), finished.truncated);

        let next_ttl = finished.ttl + 1;
        for (addr, flow_id) in &finished.discovered {
            if finished.destination.contains(addr) || next_ttl > self.opts.max_ttl {
                continue;
            }
            let predecessor = LatticeNode { ttl: finished.ttl, addr: *addr };
            self.pending.push_back(Branch::child(next_ttl, predecessor, *flow_id));
        }

        match self.pending.pop_front() {
            Some(next) => {
                self.active = next;
                self.top_up(net)
            }
            None => {
                self.finished = true;
                Ok(Vec::new())
            }
        }
    }

    fn record_reply(&mut self, from: Option<IpAddr>, destination: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let flow_id = self.current_flow_id;
        match from {
            Some(addr) => {
                let already_known = self.active.discovered.iter().any(|(known, _)| *known == addr);
                if !already_known {
                    if self.active.discovered.len() < self.opts.max_branch {
                        self.active.discovered.push((addr, flow_id));
                        self.active.probes_since_new = 0;
                        let dst = LatticeNode { ttl: self.active.ttl, addr };
                        self.log.push(NewLink { src: self.active.predecessor, dst, flow_id });
                    } else {
                        self.active.truncated = true;
                        self.active.probes_since_new += 1;
                    }
                } else {
                    self.active.probes_since_new += 1;
                }
                if destination && !self.active.destination.contains(&addr) {
                    self.active.destination.push(addr);
                }
            }
            None => {
                self.active.probes_since_new += 1;
            }
        }
    }
}

impl Algorithm for MdaAlgorithm {
    fn name(&self) -> &'static str {
        "mda"
    }

    fn start(&mut self, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        self.top_up(net)
    }

    fn handle_event(&mut self, event: Event, net: &mut dyn NetworkHandle) -> Result<Vec<ProbeId>, AlgorithmError> {
        match event {
            Event::Timeout { .. } => self.record_reply(None, false),
            Event::IcmpReply { from, .. } => self.record_reply(Some(from), false),
            Event::DestinationReached { from, .. } => self.record_reply(Some(from), true),
        }

        if self.in_flight > 0 {
            return Ok(Vec::new());
        }
        if self.needs_more_probes() {
            self.top_up(net)
        } else {
            self.finalize_active_and_advance(net)
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
    use std::net::Ipv4Addr;

    fn base_opts() -> MdaOptions {
        MdaOptions {
            family: AddressFamily::V4,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dest: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dst_port: 33434,
            min_ttl: 1,
            max_ttl: 1,
            bound: 0.05,
            max_branch: 8,
            timeout: Duration::from_secs(1),
        }
    }

    /// Drives one `MdaAlgorithm` to completion against a [`FakeNetwork`],
    /// answering the `n`th probe sent (1-indexed) with `script(n)`. MDA
    /// keeps exactly one probe in flight at a time, so this never needs to
    /// fan out over more than one id at a time, even once branches span
    /// more than one hop.
    fn drive_to_completion(algo: &mut MdaAlgorithm, net: &mut FakeNetwork, script: impl Fn(usize) -> IpAddr) -> usize {
        let mut ids = algo.start(net).unwrap();
        let mut probe_number = 0usize;
        while !algo.is_finished() {
            assert_eq!(ids.len(), 1, "MDA keeps exactly one probe in flight at a time");
            probe_number += 1;
            let probe = net.probe(ids[0]).unwrap().clone();
            let addr = script(probe_number);
            ids = algo.handle_event(Event::IcmpReply { probe, icmp_type: 11, code: 0, from: addr }, net).unwrap();
        }
        probe_number
    }

    /// Like [`drive_to_completion`], but `pick` sees the TTL of the probe
    /// it's answering rather than a running count — needed once a scenario
    /// spans more than one hop, since each hop restarts its own count of
    /// "probes so far".
    fn drive_to_completion_by_ttl(algo: &mut MdaAlgorithm, net: &mut FakeNetwork, pick: impl Fn(u8) -> IpAddr) {
        let mut ids = algo.start(net).unwrap();
        while !algo.is_finished() {
            assert_eq!(ids.len(), 1, "MDA keeps exactly one probe in flight at a time");
            let probe = net.probe(ids[0]).unwrap().clone();
            let ttl = probe.extract("ttl").unwrap().as_u8().unwrap();
            let addr = pick(ttl);
            ids = algo.handle_event(Event::IcmpReply { probe, icmp_type: 11, code: 0, from: addr }, net).unwrap();
        }
    }

    #[test]
    fn stopping_table_matches_published_values_at_bound_0_05() {
        let table = StoppingTable::compute(0.05, 10);
        assert_eq!(table.n(1), 6);
        assert_eq!(table.n(2), 11);
    }

    #[test]
    fn stopping_table_is_nondecreasing_in_k() {
        let table = StoppingTable::compute(0.05, 10);
        for k in 1..10 {
            assert!(table.n(k) <= table.n(k + 1));
        }
    }

    #[test]
    fn new_interface_resets_probes_since_new_and_logs_with_its_flow_id() {
        let mut active = Branch::root(3);
        active.probes_since_new = 4;
        let mut algo = MdaAlgorithm {
            opts: MdaOptions {
                family: AddressFamily::V4,
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dest: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                dst_port: 33434,
                min_ttl: 1,
                max_ttl: 5,
                bound: 0.05,
                max_branch: 8,
                timeout: Duration::from_secs(1),
            },
            table: StoppingTable::compute(0.05, 8),
            active,
            pending: VecDeque::new(),
            completed_hops: Vec::new(),
            in_flight: 1,
            current_flow_id: 42,
            log: Vec::new(),
            finished: false,
        };
        algo.record_reply(Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9))), false);
        assert_eq!(algo.active.discovered.len(), 1);
        assert_eq!(algo.active.probes_since_new, 0);
        assert_eq!(algo.log.len(), 1);
        assert_eq!(algo.log[0].flow_id, 42);
        assert_eq!(algo.log[0].src, None);
    }

    /// A single true interface: the first probe discovers it, then exactly
    /// `n(1)` more go unanswered-by-a-new-branch before MDA stops.
    #[test]
    fn single_interface_hop_stops_after_n_one_confirmation_probes() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));
        let mut algo = MdaAlgorithm::new(base_opts());
        let mut net = FakeNetwork::new();
        let n1 = StoppingTable::compute(0.05, 8).n(1);

        let total_sent = drive_to_completion(&mut algo, &mut net, |_| addr);

        assert_eq!(total_sent, 1 + n1);
        assert_eq!(algo.completed_hops()[0].1, vec![addr]);
        assert!(!algo.completed_hops()[0].2, "8 probes never approaches max_branch=8's truncation");
    }

    /// Two true interfaces: a second interface revealed on the 4th probe
    /// resets the confirmation counter and extends the stopping point to
    /// `n(2)`.
    #[test]
    fn second_interface_mid_hop_extends_stop_to_n_two() {
        let addr_a = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));
        let addr_b = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2));
        let mut algo = MdaAlgorithm::new(base_opts());
        let mut net = FakeNetwork::new();
        let n2 = StoppingTable::compute(0.05, 8).n(2);

        let total_sent = drive_to_completion(&mut algo, &mut net, |n| if n == 4 { addr_b } else { addr_a });

        assert_eq!(total_sent, 4 + n2);
        assert_eq!(algo.completed_hops()[0].1, vec![addr_a, addr_b]);
        assert_eq!(algo.new_links().len(), 2);
        assert!(algo.new_links().iter().all(|l| l.src.is_none() && l.dst.ttl == 1));
    }

    /// Unlike fixed-flow traceroute, MDA's port-varying probes must
    /// discover both branches of an ECMP hop.
    #[test]
    fn mda_discovers_both_branches_of_a_load_balanced_hop() {
        let branch_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 21));
        let branch_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 22));
        let mut algo = MdaAlgorithm::new(MdaOptions { max_branch: 4, ..base_opts() });
        let mut net = FakeNetwork::new();

        drive_to_completion(&mut algo, &mut net, |n| if n % 2 == 0 { branch_a } else { branch_b });

        let mut interfaces = algo.completed_hops()[0].1.clone();
        interfaces.sort();
        let mut expected = vec![branch_a, branch_b];
        expected.sort();
        assert_eq!(interfaces, expected);
    }

    /// Property 4 (every lattice edge is annotated with the flow that
    /// actually produced it): across two hops, the edge into the second
    /// hop's interface must name the first hop's interface as its `src`,
    /// not `None` and not some other node.
    #[test]
    fn lattice_edge_links_each_hop_to_its_actual_predecessor() {
        let hop1 = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));
        let hop2 = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 1));
        let mut algo = MdaAlgorithm::new(MdaOptions { max_ttl: 2, ..base_opts() });
        let mut net = FakeNetwork::new();

        drive_to_completion_by_ttl(&mut algo, &mut net, |ttl| if ttl == 1 { hop1 } else { hop2 });

        let links = algo.new_links();
        assert_eq!(links.len(), 2);

        let first = links.iter().find(|l| l.dst.addr == hop1).expect("hop 1 link recorded");
        assert_eq!(first.src, None);
        assert_eq!(first.dst.ttl, 1);

        let second = links.iter().find(|l| l.dst.addr == hop2).expect("hop 2 link recorded");
        assert_eq!(second.src, Some(LatticeNode { ttl: 1, addr: hop1 }));
        assert_eq!(second.dst.ttl, 2);
    }

    /// A branch that reaches the destination is a terminal leaf: it must
    /// not spawn a child branch one hop further out.
    #[test]
    fn destination_reached_branch_is_not_walked_further() {
        let hop1 = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));
        let mut algo = MdaAlgorithm::new(MdaOptions { max_ttl: 5, ..base_opts() });
        let mut net = FakeNetwork::new();
        let n1 = StoppingTable::compute(0.05, 8).n(1);

        let mut ids = algo.start(&mut net).unwrap();
        for i in 0..(1 + n1) {
            assert_eq!(ids.len(), 1);
            let probe = net.probe(ids[0]).unwrap().clone();
            let event = if i == 0 {
                Event::DestinationReached { probe, from: hop1 }
            } else {
                Event::IcmpReply { probe, icmp_type: 11, code: 0, from: hop1 }
            };
            ids = algo.handle_event(event, &mut net).unwrap();
        }

        assert!(algo.is_finished());
        assert_eq!(algo.completed_hops().len(), 1);
        assert_eq!(algo.new_links().len(), 1);
    }
}

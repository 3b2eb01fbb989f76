//! Output formatting: renders traceroute/MDA results to stdout in the
//! classic one-line-per-hop column layout.
//!
//! Grounded on the column-formatting conventions of `etherparse`'s own
//! header dump functions, which print one labelled value per line;
//! generalized here to one hop per line, one probe outcome per column.

use std::fmt::Write as _;

use crate::algorithm::mda::{MdaAlgorithm, NewLink};
use crate::algorithm::traceroute::{HopOutcome, HopRecord, TracerouteAlgorithm};
use crate::resolve::Resolver;

/// Formats one classic traceroute outcome column: `*` for a star, `!` for
/// an ICMP error that isn't the expected hop reply, or the address
/// (optionally a resolved name) plus RTT in milliseconds.
fn format_outcome(outcome: &HopOutcome, resolver: &dyn Resolver) -> String {
    match outcome.from {
        None => "*".to_string(),
        Some(addr) => {
            let label = resolver.reverse(addr).map(|name| format!("{name} ({addr})")).unwrap_or_else(|| addr.to_string());
            let label = match outcome.rtt {
                Some(rtt) => format!("{label}  {:.3} ms", rtt.as_secs_f64() * 1000.0),
                None => label,
            };
            if outcome.icmp_error {
                format!("{label} !")
            } else {
                label
            }
        }
    }
}

/// Renders every hop recorded so far, one line per TTL, in the style of
/// classic `traceroute(8)` output.
pub fn render_traceroute(algo: &TracerouteAlgorithm, resolver: &dyn Resolver) -> String {
    let mut out = String::new();
    for hop in algo.hops() {
        render_hop_line(&mut out, hop, resolver);
    }
    out
}

fn render_hop_line(out: &mut String, hop: &HopRecord, resolver: &dyn Resolver) {
    let _ = write!(out, "{:>3}  ", hop.ttl);
    let columns: Vec<String> = hop.outcomes.iter().map(|o| format_outcome(o, resolver)).collect();
    let _ = writeln!(out, "{}", columns.join("  "));
}

/// Renders MDA's discovered lattice: one line per hop listing every
/// interface found at that distance, flagged `(truncated)` when the branch
/// count hit `max_branch` before the stopping rule was satisfied.
pub fn render_mda(algo: &MdaAlgorithm, resolver: &dyn Resolver) -> String {
    let mut out = String::new();
    for (ttl, interfaces, truncated) in algo.completed_hops() {
        let _ = write!(out, "{:>3}  ", ttl);
        let labels: Vec<String> = interfaces
            .iter()
            .map(|addr| resolver.reverse(*addr).map(|name| format!("{name} ({addr})")).unwrap_or_else(|| addr.to_string()))
            .collect();
        let _ = write!(out, "{}", labels.join(", "));
        if *truncated {
            let _ = write!(out, "  (truncated at max-branch)");
        }
        let _ = writeln!(out);
    }
    out
}

/// Logs newly discovered links as they arrive, independent of the final
/// per-hop summary in [`render_mda`].
pub fn log_new_link(link: &NewLink, resolver: &dyn Resolver) {
    let label = |addr| resolver.reverse(addr).map(|name| format!("{name} ({addr})")).unwrap_or_else(|| addr.to_string());
    let dst = label(link.dst.addr);
    match link.src {
        Some(src) => {
            let src_label = label(src.addr);
            tracing::info!(
                src_ttl = src.ttl, src = %src_label,
                dst_ttl = link.dst.ttl, dst = %dst,
                flow_id = link.flow_id,
                "new link discovered"
            );
        }
        None => {
            tracing::info!(dst_ttl = link.dst.ttl, dst = %dst, flow_id = link.flow_id, "new link discovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::NoResolver;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[test]
    fn star_outcome_renders_as_asterisk() {
        let outcome = HopOutcome { from: None, rtt: None, icmp_error: false };
        assert_eq!(format_outcome(&outcome, &NoResolver), "*");
    }

    #[test]
    fn replied_outcome_includes_rtt() {
        let outcome = HopOutcome {
            from: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            rtt: Some(Duration::from_millis(12)),
            icmp_error: false,
        };
        let rendered = format_outcome(&outcome, &NoResolver);
        assert!(rendered.contains("192.0.2.1"));
        assert!(rendered.contains("ms"));
    }

    #[test]
    fn icmp_error_outcome_renders_with_bang_marker() {
        let outcome = HopOutcome {
            from: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            rtt: Some(Duration::from_millis(5)),
            icmp_error: true,
        };
        let rendered = format_outcome(&outcome, &NoResolver);
        assert!(rendered.trim_end().ends_with('!'));
    }
}

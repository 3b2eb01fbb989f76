//! Destination and reverse-DNS resolution: a thin wrapper so the core
//! algorithms never depend on a concrete resolver. Every traceroute needs
//! a name-to-address step and a `-n`-gated hostname-per-hop step.
//!
//! Grounded on `dns-lookup`'s own documented `getaddrinfo`/`getnameinfo`
//! wrappers, the same family of libc-backed resolution helpers reached for
//! rather than hand-rolling a resolver.

use std::net::IpAddr;

use dns_lookup::{lookup_addr, lookup_host};

use crate::error::Error;
use crate::probe::AddressFamily;

/// Resolves a hostname or literal address to a routable [`IpAddr`],
/// choosing the first result in the requested family. Resolution failures
/// are fatal at startup.
pub fn resolve_destination(host: &str, want: Option<AddressFamily>) -> Result<IpAddr, Error> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let addrs = lookup_host(host).map_err(|source| Error::Resolution { host: host.to_string(), source })?;
    let chosen = match want {
        Some(AddressFamily::V4) => addrs.into_iter().find(|a| a.is_ipv4()),
        Some(AddressFamily::V6) => addrs.into_iter().find(|a| a.is_ipv6()),
        None => addrs.into_iter().next(),
    };
    chosen.ok_or_else(|| Error::Resolution {
        host: host.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address of the requested family"),
    })
}

/// Best-effort reverse lookup for a hop's display name, disabled by `-n`.
/// Never fatal: a lookup failure just means the row prints the
/// address with no name, the same way every traceroute implementation
/// degrades when a PTR record doesn't exist.
pub trait Resolver: Send {
    fn reverse(&self, addr: IpAddr) -> Option<String>;
}

pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn reverse(&self, addr: IpAddr) -> Option<String> {
        lookup_addr(&addr).ok()
    }
}

/// Used with `-n`: never resolves, so no name lookups are attempted.
pub struct NoResolver;

impl Resolver for NoResolver {
    fn reverse(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn literal_address_resolves_without_dns() {
        let resolved = resolve_destination("192.0.2.1", None).unwrap();
        assert_eq!(resolved, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn literal_address_family_mismatch_still_returns_the_literal() {
        // A literal is never re-resolved by family; family filtering only
        // applies to actual DNS lookups.
        let resolved = resolve_destination("192.0.2.1", Some(AddressFamily::V6)).unwrap();
        assert!(resolved.is_ipv4());
    }

    #[test]
    fn no_resolver_never_resolves() {
        assert_eq!(NoResolver.reverse(IpAddr::V4(Ipv4Addr::LOCALHOST)), None);
    }
}

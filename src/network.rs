//! Network: owns the raw socket(s), the in-flight probe table, and reply
//! correlation. Single-threaded; every socket is non-blocking and polled
//! by [`crate::pt_loop::PtLoop`].
//!
//! `etherparse` parses/builds packets but never opens a socket, so the
//! socket lifecycle here follows `socket2::Socket`'s own documented
//! raw-ICMP/raw-UDP construction pattern together with `nix::sys::socket`
//! conventions; the in-flight table and checksum-serial correlation are
//! original to this crate.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;
use crate::field::Field;
use crate::probe::{AddressFamily, Probe, ProbeId};
use crate::proto::udp;

/// A probe sent but not yet answered or timed out.
struct InFlight {
    probe: Probe,
    fingerprint: Fingerprint,
    timeout_at: Instant,
}

/// What we match an incoming ICMP quote (or direct reply) against: the
/// 5-tuple Paris traceroute holds fixed plus the serial carried in the
/// payload tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Fingerprint {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    serial: u16,
}

/// Outcome of matching an incoming datagram against the in-flight table.
#[derive(Debug)]
pub enum Reply {
    /// An ICMP time-exceeded/unreachable quoting one of our probes.
    IcmpError {
        probe: Probe,
        icmp_type: u8,
        code: u8,
        from: IpAddr,
    },
    /// The destination answered the UDP probe directly (port unreachable).
    DestinationReached { probe: Probe, from: IpAddr },
    /// Well-formed datagram that didn't match anything we sent: dropped,
    /// not an error.
    Unmatched,
}

/// The subset of [`Network`] that algorithm instances actually call.
/// Exists so tests can drive an [`crate::algorithm::Algorithm`] against a
/// deterministic in-memory double instead of real raw sockets — see
/// `test_support::FakeNetwork`.
pub trait NetworkHandle {
    fn send(&mut self, probe: Probe, dest: SocketAddr) -> Result<ProbeId, NetworkError>;
    fn set_timeout(&mut self, id: ProbeId, timeout: Duration);
}

pub struct Network {
    family: AddressFamily,
    send_socket: Socket,
    recv_socket: Socket,
    in_flight: HashMap<u64, InFlight>,
    next_probe_id: u64,
    next_serial: u16,
    default_timeout: Duration,
}

impl Network {
    /// Opens the raw sockets this process needs: one to send UDP probes,
    /// one to receive ICMP. Requires `CAP_NET_RAW` or root; any
    /// `EPERM`/`EACCES` is fatal at startup.
    pub fn open(family: AddressFamily, default_timeout: Duration) -> Result<Self, NetworkError> {
        let (domain, icmp_proto) = match family {
            AddressFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            AddressFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let send_socket = Socket::new(domain, Type::RAW, Some(Protocol::UDP))
            .map_err(permission_or_send)?;
        let recv_socket = Socket::new(domain, Type::RAW, Some(icmp_proto)).map_err(permission_or_send)?;
        send_socket.set_nonblocking(true).map_err(NetworkError::Send)?;
        recv_socket.set_nonblocking(true).map_err(NetworkError::Send)?;

        Ok(Network {
            family,
            send_socket,
            recv_socket,
            in_flight: HashMap::new(),
            next_probe_id: 1,
            // Skip the two checksum values `solve_payload_tag` cannot
            // produce by construction: 0x0000 and 0xffff.
            next_serial: 1,
            default_timeout,
        })
    }

    pub fn recv_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.recv_socket.as_raw_fd()
    }

    /// Next serial, skipping the two checksum values [`udp::solve_payload_tag`]
    /// cannot target.
    fn allocate_serial(&mut self) -> u16 {
        loop {
            let candidate = self.next_serial;
            self.next_serial = self.next_serial.wrapping_add(1);
            if candidate != 0x0000 && candidate != 0xffff {
                return candidate;
            }
        }
    }

    /// Finalizes, serial-encodes, and sends a probe. Assigns it a
    /// [`ProbeId`], stamps its sending time, and files it in the in-flight
    /// table keyed by fingerprint for correlation against later replies.
    pub fn send(&mut self, mut probe: Probe, dest: SocketAddr) -> Result<ProbeId, NetworkError> {
        let serial = self.allocate_serial();
        encode_serial_tag(&mut probe, serial)?;

        let bytes = probe.serialize()?;
        // `bytes` is the fully stacked datagram (IP header included); raw
        // UDP sockets want payload starting at the transport header, so
        // skip the IP header we just built ourselves.
        let ip_header_len = match self.family {
            AddressFamily::V4 => crate::proto::ipv4::HEADER_LEN,
            AddressFamily::V6 => crate::proto::ipv6::HEADER_LEN,
        };
        let transport_bytes = &bytes[ip_header_len..];

        match self.send_socket.send_to(transport_bytes, &dest.into()) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                // Transient: retry exactly once.
                warn!(error = %e, "send hit ENOBUFS, retrying once");
                self.send_socket
                    .send_to(transport_bytes, &dest.into())
                    .map_err(NetworkError::Send)?;
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EPERM) | Some(libc::EACCES)) => {
                return Err(NetworkError::Permission(e));
            }
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                return Err(NetworkError::MessageTooLarge);
            }
            Err(e) => return Err(NetworkError::Send(e)),
        }

        let id = ProbeId(self.next_probe_id);
        self.next_probe_id += 1;
        probe.set_id(id);
        probe.set_sending_time(Instant::now());

        let fingerprint = fingerprint_of(&probe, serial)?;
        debug!(probe_id = id.0, serial, dst = %dest.ip(), "sent probe");
        self.in_flight.insert(
            id.0,
            InFlight {
                probe,
                fingerprint,
                timeout_at: Instant::now() + self.default_timeout,
            },
        );
        Ok(id)
    }

    pub fn set_timeout(&mut self, id: ProbeId, timeout: Duration) {
        if let Some(entry) = self.in_flight.get_mut(&id.0) {
            entry.timeout_at = Instant::now() + timeout;
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Drains timed-out probes, returning their ids in send order. Called
    /// by `pt_loop` once per turn before the poll step.
    pub fn drain_timeouts(&mut self, now: Instant) -> Vec<ProbeId> {
        let mut expired: Vec<(u64, Instant)> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.timeout_at <= now)
            .map(|(id, entry)| (*id, entry.timeout_at))
            .collect();
        expired.sort_by_key(|(_, at)| *at);
        expired
            .into_iter()
            .map(|(id, _)| {
                self.in_flight.remove(&id);
                ProbeId(id)
            })
            .collect()
    }

    /// Reads one datagram from the ICMP socket and attempts to correlate it
    /// with an in-flight probe. `Ok(None)` means the socket had nothing to
    /// read (spurious `poll` wakeup); malformed datagrams are logged and
    /// dropped rather than surfaced as errors.
    pub fn on_readable(&mut self) -> Result<Option<Reply>, NetworkError> {
        let mut buf = [std::mem::MaybeUninit::uninit(); 2048];
        let (n, from) = match self.recv_socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(NetworkError::Send(e)),
        };
        let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
        let from_ip = from.as_socket().map(|s| s.ip());

        match self.correlate(&bytes, from_ip) {
            Some(reply) => Ok(Some(reply)),
            None => {
                trace!(bytes = n, from = ?from_ip, "dropped unmatched/malformed datagram");
                Ok(Some(Reply::Unmatched))
            }
        }
    }

    /// `SOCK_RAW`/`IPPROTO_ICMP` datagrams arrive with the IPv4 header still
    /// attached; `SOCK_RAW`/`IPPROTO_ICMPV6` ones don't carry the IPv6
    /// header (the kernel strips it) — so the two families start parsing
    /// from a different offset even though both eventually quote a full IP
    /// header for the original probe.
    ///
    /// `recv_from_peer` is the `recvfrom(2)` source address of the datagram
    /// itself — the responding router — not to be confused with the quoted
    /// inner header's `src_ip`, which is always the *original probe's*
    /// source address and is constant across every hop. Only the former is
    /// fit to report as the hop's address; the quoted inner `src_ip` is used
    /// solely to build the correlation fingerprint.
    fn correlate(&mut self, bytes: &[u8], recv_from_peer: Option<IpAddr>) -> Option<Reply> {
        let (icmp_name, icmp_start) = match self.family {
            AddressFamily::V4 => ("icmpv4", crate::proto::ipv4::HEADER_LEN),
            AddressFamily::V6 => ("icmpv6", 0),
        };
        let icmp_descriptor = crate::proto::lookup(icmp_name).ok()?;
        let icmp_fields = icmp_descriptor
            .parse(bytes.get(icmp_start..icmp_start + icmp_descriptor.header_len())?)
            .ok()?;
        let icmp_type = icmp_fields.iter().find(|f| f.name() == "icmp_type")?.as_u8()?;
        let code = icmp_fields.iter().find(|f| f.name() == "code")?.as_u8()?;

        // The responding router's address: for IPv4, the kernel leaves the
        // outer IP header in front of the ICMP message, so read its
        // `src_ip` (bytes 12..16) directly rather than through the quoted
        // inner header. For IPv6, the kernel strips the outer header before
        // delivery, so the only place the responder's address survives is
        // the `recvfrom(2)` peer address.
        let responder = match self.family {
            AddressFamily::V4 => {
                let octets: [u8; 4] = bytes.get(12..16)?.try_into().ok()?;
                IpAddr::V4(std::net::Ipv4Addr::from(octets))
            }
            AddressFamily::V6 => recv_from_peer?,
        };

        let quote_offset = icmp_start + icmp_descriptor.header_len();
        let quoted = Probe::parse(bytes.get(quote_offset..)?, self.family).ok()?;
        let src_ip = quoted.extract_from(quoted.layer_names().next()?, "src_ip").ok()?.as_address()?;
        let dst_ip = quoted.extract_from(quoted.layer_names().next()?, "dst_ip").ok()?.as_address()?;
        let src_port = quoted.extract("src_port").ok()?.as_u16()?;
        let dst_port = quoted.extract("dst_port").ok()?.as_u16()?;
        let serial = quoted.extract("checksum").ok()?.as_u16()?;

        let fingerprint = Fingerprint { src_ip, dst_ip, src_port, dst_port, serial };
        let matched_id = self
            .in_flight
            .iter()
            .find(|(_, entry)| entry.fingerprint == fingerprint)
            .map(|(id, _)| *id)?;
        let mut entry = self.in_flight.remove(&matched_id)?;
        entry.probe.set_recv_time(Instant::now());

        match icmp_name {
            "icmpv4" => match crate::proto::icmpv4::classify(icmp_type, code) {
                crate::proto::icmpv4::Icmpv4Kind::TimeExceeded => Some(Reply::IcmpError {
                    probe: entry.probe,
                    icmp_type,
                    code,
                    from: responder,
                }),
                crate::proto::icmpv4::Icmpv4Kind::DestinationUnreachable { port_unreachable: true } => {
                    Some(Reply::DestinationReached { probe: entry.probe, from: responder })
                }
                _ => Some(Reply::IcmpError { probe: entry.probe, icmp_type, code, from: responder }),
            },
            _ => match crate::proto::icmpv6::classify(icmp_type, code) {
                crate::proto::icmpv6::Icmpv6Kind::TimeExceeded => Some(Reply::IcmpError {
                    probe: entry.probe,
                    icmp_type,
                    code,
                    from: responder,
                }),
                crate::proto::icmpv6::Icmpv6Kind::DestinationUnreachable { port_unreachable: true } => {
                    Some(Reply::DestinationReached { probe: entry.probe, from: responder })
                }
                _ => Some(Reply::IcmpError { probe: entry.probe, icmp_type, code, from: responder }),
            },
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Soonest outstanding probe timeout, if any: the poll step's wait
    /// duration.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.timeout_at).min()
    }
}

impl NetworkHandle for Network {
    fn send(&mut self, probe: Probe, dest: SocketAddr) -> Result<ProbeId, NetworkError> {
        Network::send(self, probe, dest)
    }

    fn set_timeout(&mut self, id: ProbeId, timeout: Duration) {
        Network::set_timeout(self, id, timeout)
    }
}

fn permission_or_send(e: io::Error) -> NetworkError {
    match e.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => NetworkError::Permission(e),
        _ => NetworkError::Send(e),
    }
}

/// Rewrites the probe's UDP payload tag so its checksum equals `serial`.
/// Pins the payload to exactly the 2 tag bytes: [`udp::solve_payload_tag`]
/// solves for a checksum over pseudo header + UDP header + payload, and the
/// tag is only the first two payload bytes it accounts for.
fn encode_serial_tag(probe: &mut Probe, serial: u16) -> Result<(), NetworkError> {
    probe.payload_resize(2);

    let ip_layer = probe
        .layer_names()
        .find(|n| *n == "ipv4" || *n == "ipv6")
        .ok_or(NetworkError::MessageTooLarge)?;
    let src_ip = probe.extract_from(ip_layer, "src_ip")?.as_address().ok_or(NetworkError::MessageTooLarge)?;
    let dst_ip = probe.extract_from(ip_layer, "dst_ip")?.as_address().ok_or(NetworkError::MessageTooLarge)?;
    let src_port = probe.extract("src_port")?.as_u16().ok_or(NetworkError::MessageTooLarge)?;
    let dst_port = probe.extract("dst_port")?.as_u16().ok_or(NetworkError::MessageTooLarge)?;
    let udp_len = (udp::HEADER_LEN + probe.payload().len()) as u16;

    let mut header_bytes = Vec::with_capacity(udp::HEADER_LEN);
    header_bytes.extend_from_slice(&src_port.to_be_bytes());
    header_bytes.extend_from_slice(&dst_port.to_be_bytes());
    header_bytes.extend_from_slice(&udp_len.to_be_bytes());
    header_bytes.extend_from_slice(&[0, 0]); // checksum field, zeroed for the solve

    let base = udp::pseudo_header_sum(src_ip, dst_ip, udp_len).add_slice(&header_bytes);
    let tag = udp::solve_payload_tag(&base, serial);
    probe.payload_mut()[..2].copy_from_slice(&tag);
    Ok(())
}

fn fingerprint_of(probe: &Probe, serial: u16) -> Result<Fingerprint, NetworkError> {
    let ip_layer = probe
        .layer_names()
        .find(|n| *n == "ipv4" || *n == "ipv6")
        .ok_or(NetworkError::MessageTooLarge)?;
    let src_ip = probe.extract_from(ip_layer, "src_ip")?.as_address().ok_or(NetworkError::MessageTooLarge)?;
    let dst_ip = probe.extract_from(ip_layer, "dst_ip")?.as_address().ok_or(NetworkError::MessageTooLarge)?;
    let src_port = probe.extract("src_port")?.as_u16().ok_or(NetworkError::MessageTooLarge)?;
    let dst_port = probe.extract("dst_port")?.as_u16().ok_or(NetworkError::MessageTooLarge)?;
    Ok(Fingerprint { src_ip, dst_ip, src_port, dst_port, serial })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_probe() -> Probe {
        let mut p = Probe::create();
        p.set_protocols(&["ipv4", "udp"]).unwrap();
        p.set_field_qualified("ipv4", Field::address("src_ip", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))).unwrap();
        p.set_field_qualified("ipv4", Field::address("dst_ip", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))).unwrap();
        p.set_field_qualified("ipv4", Field::i8("protocol", 17)).unwrap();
        p.set_field("ttl", Field::i8("ttl", 5)).unwrap();
        p.set_field("src_port", Field::i16("src_port", 3838)).unwrap();
        p.set_field("dst_port", Field::i16("dst_port", 33434)).unwrap();
        p
    }

    #[test]
    fn fingerprint_survives_serialize_round_trip() {
        let mut p = sample_probe();
        encode_serial_tag(&mut p, 0x1234).unwrap();
        let bytes = p.serialize().unwrap();
        let want = fingerprint_of(&p, 0x1234).unwrap();

        let ip_len = crate::proto::ipv4::HEADER_LEN;
        let quoted = Probe::parse(&bytes[..ip_len + udp::HEADER_LEN + 2], AddressFamily::V4).unwrap();
        let got_serial = quoted.extract("checksum").unwrap().as_u16().unwrap();
        assert_eq!(got_serial, 0x1234);
        assert_eq!(want.serial, 0x1234);
    }

    /// The responding router's address (here `10.0.0.9`, distinct from the
    /// prober's own `10.0.0.1`) must be what `correlate` reports as `from`
    /// — not the quoted inner header's `src_ip`, which is always the
    /// prober's own address and is constant across every hop.
    #[test]
    fn correlate_reports_the_responding_router_not_the_probes_own_src_ip() {
        use crate::proto::icmpv4::Icmpv4Protocol;
        use crate::proto::ipv4::Ipv4Protocol;
        use crate::proto::{set_field, FinalizeCtx, ProtocolDescriptor};

        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let prober = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let mut probe = sample_probe();
        encode_serial_tag(&mut probe, 0x2222).unwrap();
        let probe_bytes = probe.serialize().unwrap();
        let quoted = &probe_bytes[..crate::proto::ipv4::HEADER_LEN + udp::HEADER_LEN];

        let mut outer_fields = Ipv4Protocol.default_fields();
        set_field(&mut outer_fields, Field::address("src_ip", router));
        set_field(&mut outer_fields, Field::address("dst_ip", prober));
        set_field(&mut outer_fields, Field::i8("protocol", 1));
        Ipv4Protocol
            .finalize(&mut outer_fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: quoted })
            .unwrap();
        let outer_bytes = Ipv4Protocol.serialize(&outer_fields).unwrap();

        let mut icmp_fields = Icmpv4Protocol.default_fields();
        Icmpv4Protocol
            .finalize(&mut icmp_fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: quoted })
            .unwrap();
        let icmp_bytes = Icmpv4Protocol.serialize(&icmp_fields).unwrap();

        let mut datagram = outer_bytes;
        datagram.extend_from_slice(&icmp_bytes);
        datagram.extend_from_slice(quoted);

        let mut net = Network {
            family: AddressFamily::V4,
            send_socket: Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap(),
            recv_socket: Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap(),
            in_flight: HashMap::new(),
            next_probe_id: 1,
            next_serial: 1,
            default_timeout: Duration::from_secs(1),
        };
        let fingerprint = fingerprint_of(&probe, 0x2222).unwrap();
        net.in_flight.insert(
            1,
            InFlight { probe, fingerprint, timeout_at: Instant::now() + Duration::from_secs(1) },
        );

        let reply = net.correlate(&datagram, None).expect("fingerprint should match");
        match reply {
            Reply::IcmpError { from, .. } => assert_eq!(from, router),
            other => panic!("expected IcmpError, got {other:?}"),
        }
    }

    #[test]
    fn allocator_never_yields_reserved_serials() {
        let mut net = Network {
            family: AddressFamily::V4,
            send_socket: Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap(),
            recv_socket: Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap(),
            in_flight: HashMap::new(),
            next_probe_id: 1,
            next_serial: 0xfffe,
            default_timeout: Duration::from_secs(1),
        };
        for _ in 0..8 {
            let s = net.allocate_serial();
            assert_ne!(s, 0x0000);
            assert_ne!(s, 0xffff);
        }
    }
}

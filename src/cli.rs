//! Command-line surface. Flag parsing internals aren't the interesting
//! part here, but the flag surface itself — names, defaults, mutual
//! exclusions — is load-bearing, so it's built via `clap`'s derive API the
//! way every other binary crate in this ecosystem does.

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use crate::error::Error;
use crate::probe::AddressFamily;

/// Flow-preserving (Paris) traceroute with an optional multipath (MDA)
/// discovery mode.
#[derive(Debug, Parser)]
#[command(name = "paris-traceroute", version, about)]
pub struct Cli {
    /// Destination hostname or address.
    pub destination: String,

    /// Run the multipath (MDA) algorithm instead of classic traceroute.
    #[arg(short = 'a', long = "algo", value_enum, default_value_t = AlgoChoice::Traceroute)]
    pub algorithm: AlgoChoice,

    /// Force IPv4.
    #[arg(short = '4')]
    pub force_v4: bool,

    /// Force IPv6.
    #[arg(short = '6')]
    pub force_v6: bool,

    /// Use ICMP probes instead of UDP (reserved; UDP-only in this release).
    #[arg(short = 'P', long = "protocol")]
    pub protocol: Option<String>,

    /// Use UDP probes (default).
    #[arg(short = 'U')]
    pub udp: bool,

    /// Disable reverse DNS lookups for hop addresses.
    #[arg(short = 'n')]
    pub no_resolve: bool,

    /// Source port for the fixed flow.
    #[arg(short = 's', long = "src-port", default_value_t = 3838)]
    pub src_port: u16,

    /// Destination port probes target.
    #[arg(short = 'd', long = "dst-port", default_value_t = 3000)]
    pub dst_port: u16,

    #[arg(long = "min-ttl", default_value_t = 1)]
    pub min_ttl: u8,

    #[arg(long = "max-ttl", default_value_t = 30)]
    pub max_ttl: u8,

    #[arg(long = "num-probes", default_value_t = 3)]
    pub num_probes: u8,

    #[arg(long = "max-stars", default_value_t = 5)]
    pub max_stars: u8,

    /// MDA failure-probability bound (ignored for classic traceroute).
    #[arg(long = "bound", default_value_t = 0.05)]
    pub bound: f64,

    /// MDA maximum branches explored per hop (ignored for classic traceroute).
    #[arg(long = "max-branch", default_value_t = 16)]
    pub max_branch: usize,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout", default_value_t = 1000)]
    pub timeout_ms: u64,
}

/// Named `paris-traceroute`/`mda` on the wire for compatibility with
/// existing scripts, even though the Rust variant names read better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AlgoChoice {
    #[value(name = "paris-traceroute")]
    Traceroute,
    Mda,
}

/// Validated, resolved configuration handed to `main`. Unlike [`Cli`],
/// every field here is in its final, checked form.
#[derive(Debug, Clone)]
pub struct Config {
    pub destination: String,
    pub algorithm: AlgoChoice,
    pub requested_family: Option<AddressFamily>,
    pub no_resolve: bool,
    pub src_port: u16,
    pub dst_port: u16,
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub num_probes: u8,
    pub max_stars: u8,
    pub bound: f64,
    pub max_branch: usize,
    pub timeout: Duration,
}

impl Config {
    /// Validates the parsed CLI into a [`Config`], resolving mutually
    /// exclusive flags and out-of-range values into a single
    /// [`Error::Config`]. `-4`/`-6` both set is a configuration error;
    /// neither set defers the choice to resolution against the
    /// destination's address family.
    pub fn from_cli(cli: Cli) -> Result<Self, Error> {
        if cli.force_v4 && cli.force_v6 {
            return Err(Error::Config("-4 and -6 are mutually exclusive".to_string()));
        }
        if cli.min_ttl == 0 {
            return Err(Error::Config("--min-ttl must be at least 1".to_string()));
        }
        if cli.min_ttl > cli.max_ttl {
            return Err(Error::Config("--min-ttl must not exceed --max-ttl".to_string()));
        }
        if cli.num_probes == 0 {
            return Err(Error::Config("--num-probes must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&cli.bound) {
            return Err(Error::Config("--bound must be in (0, 1)".to_string()));
        }
        if cli.max_branch == 0 {
            return Err(Error::Config("--max-branch must be at least 1".to_string()));
        }

        let requested_family = match (cli.force_v4, cli.force_v6) {
            (true, false) => Some(AddressFamily::V4),
            (false, true) => Some(AddressFamily::V6),
            _ => None,
        };

        Ok(Config {
            destination: cli.destination,
            algorithm: cli.algorithm,
            requested_family,
            no_resolve: cli.no_resolve,
            src_port: cli.src_port,
            dst_port: cli.dst_port,
            min_ttl: cli.min_ttl,
            max_ttl: cli.max_ttl,
            num_probes: cli.num_probes,
            max_stars: cli.max_stars,
            bound: cli.bound,
            max_branch: cli.max_branch,
            timeout: Duration::from_millis(cli.timeout_ms),
        })
    }
}

/// Picks the address family to probe with: the explicit `-4`/`-6` request
/// if present, otherwise whatever family the resolved destination turned
/// out to be.
pub fn resolve_family(requested: Option<AddressFamily>, resolved: IpAddr) -> AddressFamily {
    requested.unwrap_or(match resolved {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    })
}

//! Binary entry point: CLI → resolve → `Network` → algorithm registration
//! → `PtLoop::run` → output.
//!
//! Only the fatal-at-startup error families (`Config`, `Resolution`,
//! `Permission`) become a non-zero process exit; everything else is
//! handled inside the loop and surfaced as a logged event.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use paris_traceroute::algorithm::mda::{MdaAlgorithm, MdaOptions};
use paris_traceroute::algorithm::traceroute::{TracerouteAlgorithm, TracerouteOptions};
use paris_traceroute::cli::{self, AlgoChoice, Cli, Config};
use paris_traceroute::error::{AlgorithmError, Error};
use paris_traceroute::network::Network;
use paris_traceroute::output;
use paris_traceroute::probe::AddressFamily;
use paris_traceroute::pt_loop::PtLoop;
use paris_traceroute::resolve::{self, DnsResolver, NoResolver, Resolver};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            match e {
                Error::Config(_) => ExitCode::from(2),
                Error::Resolution { .. } => ExitCode::from(3),
                Error::Permission(_) => ExitCode::from(4),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run() -> Result<(), Error> {
    let config = Config::from_cli(Cli::parse())?;

    let dest_ip = resolve::resolve_destination(&config.destination, config.requested_family)?;
    let family = cli::resolve_family(config.requested_family, dest_ip);
    let src_ip = match family {
        AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let resolver: Box<dyn Resolver> = if config.no_resolve { Box::new(NoResolver) } else { Box::new(DnsResolver) };

    let network = Network::open(family, config.timeout).map_err(Error::Permission)?;
    let mut pt_loop = PtLoop::new(network);

    let instance = match config.algorithm {
        AlgoChoice::Traceroute => pt_loop
            .algorithm_add(Box::new(TracerouteAlgorithm::new(TracerouteOptions {
                family,
                src_ip,
                dest: dest_ip,
                src_port: config.src_port,
                dst_port: config.dst_port,
                min_ttl: config.min_ttl,
                max_ttl: config.max_ttl,
                num_probes: config.num_probes,
                max_stars: config.max_stars,
                timeout: config.timeout,
            })))
            .map_err(Error::Algorithm)?,
        AlgoChoice::Mda => pt_loop
            .algorithm_add(Box::new(MdaAlgorithm::new(MdaOptions {
                family,
                src_ip,
                dest: dest_ip,
                dst_port: config.dst_port,
                min_ttl: config.min_ttl,
                max_ttl: config.max_ttl,
                bound: config.bound,
                max_branch: config.max_branch,
                timeout: config.timeout,
            })))
            .map_err(Error::Algorithm)?,
    };

    pt_loop.run().map_err(Error::Algorithm)?;

    let finished = pt_loop
        .algorithm(instance)
        .ok_or(AlgorithmError::MissingInstance(instance))
        .map_err(Error::Algorithm)?;
    match config.algorithm {
        AlgoChoice::Traceroute => {
            let algo = finished
                .as_any()
                .downcast_ref::<TracerouteAlgorithm>()
                .ok_or(AlgorithmError::UnexpectedKind("traceroute"))
                .map_err(Error::Algorithm)?;
            print!("{}", output::render_traceroute(algo, resolver.as_ref()));
        }
        AlgoChoice::Mda => {
            let algo = finished
                .as_any()
                .downcast_ref::<MdaAlgorithm>()
                .ok_or(AlgorithmError::UnexpectedKind("mda"))
                .map_err(Error::Algorithm)?;
            for link in algo.new_links() {
                output::log_new_link(link, resolver.as_ref());
            }
            print!("{}", output::render_mda(algo, resolver.as_ref()));
        }
    }

    Ok(())
}

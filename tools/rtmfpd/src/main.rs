// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTMFP rendezvous server daemon.
//!
//! ```bash
//! # Listen on the default port (1935)
//! rtmfpd
//!
//! # Man-in-the-middle developer mode between two peers
//! rtmfpd --middle -d
//!
//! # Proxy connects to an upstream server
//! rtmfpd --middle --cirrus p2p.example.net:10000
//! ```

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::Parser;

use rtmfp::{Server, ServerConfig};

/// RTMFP rendezvous and man-in-the-middle server.
#[derive(Parser, Debug)]
#[command(name = "rtmfpd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listening IP address.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listening port number.
    #[arg(short, long, default_value = "1935")]
    port: u16,

    /// Enable the man-in-the-middle developer mode between two peers.
    #[arg(long, default_value = "false")]
    middle: bool,

    /// Upstream server "host:port" to proxy connects to (implies --middle
    /// behaviour for every connect).
    #[arg(long)]
    cirrus: Option<String>,

    /// Management sweep period in seconds.
    #[arg(long, default_value = "2")]
    freq_manage: u64,

    /// Keep-alive interval advertised for the server leg, seconds (>= 5).
    #[arg(long, default_value = "15")]
    keep_alive_server: u32,

    /// Keep-alive interval advertised for the peer leg, seconds (>= 5).
    #[arg(long, default_value = "10")]
    keep_alive_peer: u32,

    /// Enable debug trace.
    #[arg(short = 'd', long, default_value = "false")]
    verbose: bool,
}

fn resolve(upstream: &str) -> Result<SocketAddr, String> {
    upstream
        .to_socket_addrs()
        .map_err(|err| format!("cannot resolve {upstream:?}: {err}"))?
        .next()
        .ok_or_else(|| format!("no address for {upstream:?}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }
    builder.init();

    let cirrus = match &args.cirrus {
        Some(upstream) => Some(resolve(upstream)?),
        None => None,
    };
    if cirrus.is_some() {
        log::info!("using upstream {}", args.cirrus.as_deref().unwrap_or(""));
    }

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        middle: args.middle || cirrus.is_some(),
        cirrus,
        freq_manage: Duration::from_secs(args.freq_manage.max(1)),
        keep_alive_server: args.keep_alive_server,
        keep_alive_peer: args.keep_alive_peer,
    };

    let mut server = Server::bind(config)?;
    server.run()?;
    Ok(())
}

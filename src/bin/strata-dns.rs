// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that starts the HTTP-configurable authoritative DNS server.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::{Drain, o};

use strata_dns::server::{Config, Server};

#[derive(Parser, Debug)]
#[command(name = "strata-dns")]
struct Args {
    /// HOST:PORT to listen for DNS requests (both UDP and TCP)
    #[arg(long, value_name = "HOST:PORT", default_value = ":8053",
          value_parser = parse_listen_addr)]
    dns: SocketAddr,

    /// HOST:PORT to listen for HTTP requests
    #[arg(long, value_name = "HOST:PORT", default_value = ":8080",
          value_parser = parse_listen_addr)]
    http: SocketAddr,

    /// Zone domain name to serve, without preceding dot
    #[arg(long, value_name = "ZONE", default_value = "lan")]
    zone: String,

    /// Hostname representing this DNS server itself
    #[arg(long, value_name = "HOSTNAME", default_value = "localhost")]
    host: String,

    /// Save or restore sources from/to this file
    #[arg(long, value_name = "FILE")]
    save: Option<Utf8PathBuf>,

    /// Show log messages on client requests
    #[arg(long)]
    info: bool,

    /// Duration to be cached for DNS responses
    #[arg(long, value_name = "DURATION", default_value = "1h",
          value_parser = parse_duration)]
    ttl: Duration,
}

/// Accepts the bare `:PORT` listen spelling by assuming all interfaces.
fn parse_listen_addr(s: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = s.strip_prefix(':') {
        format!("0.0.0.0:{}", port).parse()
    } else {
        s.parse()
    }
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let log = slog::Logger::root(drain, o!("name" => "strata-dns"));

    let server = Server::start(
        log.new(o!("component" => "server")),
        Config {
            zone: args.zone,
            self_host: args.host,
            ttl: args.ttl,
            save: args.save,
            verbose: args.info,
        },
    )
    .await
    .context("starting server")?;

    strata_dns::start_servers(server, args.dns, args.http).await
}

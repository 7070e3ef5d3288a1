// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authoritative DNS server for a single zone whose record set is
//! assembled from a dynamic collection of named sources.
//!
//! There are three pieces to the running server:
//!
//! 1. The [`server::Server`] core: the in-memory [`repository::Repository`]
//!    of records, the catalog of [`source::Source`]s that produced them,
//!    and the single task that serializes all mutations, rebuilding the
//!    repository off-path and swapping it in atomically.
//! 2. A DNS frontend ([`dns`]) serving the published repository over UDP
//!    and TCP.
//! 3. An HTTP control surface ([`http`]) that adds, removes, and refreshes
//!    sources at runtime without interrupting query service.

use std::net::SocketAddr;
use std::sync::Arc;

pub mod dns;
pub mod gen;
pub mod host;
pub mod hosts;
pub mod http;
pub mod record;
pub mod repository;
pub mod resolver;
pub mod server;
pub mod soa;
pub mod source;

pub use server::{Config, Server};

/// Runs both frontends against `server`; returns only if one of them
/// fails, which the caller treats as fatal.
pub async fn start_servers(
    server: Arc<Server>,
    dns_addr: SocketAddr,
    http_addr: SocketAddr,
) -> anyhow::Result<()> {
    tokio::try_join!(
        dns::serve(Arc::clone(&server), dns_addr),
        http::serve(server, http_addr),
    )?;
    Ok(())
}

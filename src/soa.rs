// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The zone's SOA record, shared system-wide.
//!
//! The serial is the UNIX time of the last committed mutation; the other
//! timers are fixed.  Query handlers read the cached record concurrently
//! under the manager's own lock while the server task rebuilds it after
//! each mutation.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{DNSClass, Name, RData, Record as WireRecord};
use tokio::sync::RwLock;

use crate::host::Host;

const SOA_TTL: u32 = 1000;
const REFRESH: i32 = 3600;
const RETRY: i32 = 3600;
const EXPIRE: i32 = 3600;
const MINTTL: u32 = 100;

pub struct SoaManager {
    zone_name: Name,
    self_name: Name,
    rr: RwLock<WireRecord>,
}

impl SoaManager {
    /// Builds the manager and its initial record.  Fails if the zone or
    /// server name is not a valid DNS name; callers treat that as fatal.
    pub fn new(zone: &Host, self_host: &Host) -> anyhow::Result<SoaManager> {
        let zone_name = Name::from_utf8(zone.wire())
            .with_context(|| format!("invalid zone name {:?}", zone.wire()))?;
        let self_name = Name::from_utf8(self_host.wire()).with_context(|| {
            format!("invalid server name {:?}", self_host.wire())
        })?;
        let rr = RwLock::new(build(&zone_name, &self_name));
        Ok(SoaManager { zone_name, self_name, rr })
    }

    /// Rebuilds the record with a fresh serial, reflecting a change to the
    /// repository.
    pub async fn update(&self) {
        let rr = build(&self.zone_name, &self.self_name);
        *self.rr.write().await = rr;
    }

    /// The current SOA record, for the authority section of responses.
    pub async fn record(&self) -> WireRecord {
        self.rr.read().await.clone()
    }

    pub fn zone_name(&self) -> &Name {
        &self.zone_name
    }

    pub fn self_name(&self) -> &Name {
        &self.self_name
    }
}

fn build(zone_name: &Name, self_name: &Name) -> WireRecord {
    let serial = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let soa = SOA::new(
        self_name.clone(),
        self_name.clone(),
        serial,
        REFRESH,
        RETRY,
        EXPIRE,
        MINTTL,
    );
    let mut rr =
        WireRecord::from_rdata(zone_name.clone(), SOA_TTL, RData::SOA(soa));
    rr.set_dns_class(DNSClass::IN);
    rr
}

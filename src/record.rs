// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records and per-name record stacks.
//!
//! A [`Record`] carries the source and destination host from the generator,
//! precomputed A/AAAA/CNAME resource records, and the name of the source
//! that generated the entry.  At least one of the three RR slots is always
//! populated.  The RR payloads are immutable once built; cloning a record
//! clones the precomputed RRs as-is.
//!
//! A [`RecordStack`] is the ordered list of records at one name, most
//! recently inserted first.  The head is the record served on query; the
//! rest are shadowed, kept so that removing one source does not orphan
//! entries another source also supplied.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record as WireRecord};
use thiserror::Error;

use crate::host::Host;

#[derive(Debug, Error)]
#[error("invalid DNS name {name:?}")]
pub struct InvalidName {
    pub name: String,
    #[source]
    source: hickory_proto::error::ProtoError,
}

/// One materialized DNS entry: the (source, destination) pair from a raw
/// entry plus the precomputed resource records that answer for it.
#[derive(Clone, Debug)]
pub struct Record {
    shost: Host,
    dhost: Host,
    a: Option<WireRecord>,
    aaaa: Option<WireRecord>,
    cname: Option<WireRecord>,
    origin: Arc<str>,
}

impl Record {
    /// Builds a record for `shost`.  If the raw target parsed as a literal
    /// address, exactly one of `ip4`/`ip6` is set and `is_cname` is false;
    /// for a resolved hostname both address slots may be set and a CNAME
    /// pointing at `dhost` is added.  The TTL is truncated to whole seconds.
    pub fn new(
        shost: Host,
        dhost: Host,
        is_cname: bool,
        ip4: Option<Ipv4Addr>,
        ip6: Option<Ipv6Addr>,
        ttl: Duration,
        origin: Arc<str>,
    ) -> Result<Record, InvalidName> {
        let owner = parse_name(&shost)?;
        let ttl = ttl.as_secs() as u32;

        let a = ip4.map(|ip| make_rr(owner.clone(), ttl, RData::A(A::from(ip))));
        let aaaa =
            ip6.map(|ip| make_rr(owner.clone(), ttl, RData::AAAA(AAAA::from(ip))));
        let cname = if is_cname {
            let target = parse_name(&dhost)?;
            Some(make_rr(owner, ttl, RData::CNAME(CNAME(target))))
        } else {
            None
        };

        Ok(Record { shost, dhost, a, aaaa, cname, origin })
    }

    pub fn shost(&self) -> &Host {
        &self.shost
    }

    pub fn dhost(&self) -> &Host {
        &self.dhost
    }

    pub fn a(&self) -> Option<&WireRecord> {
        self.a.as_ref()
    }

    pub fn aaaa(&self) -> Option<&WireRecord> {
        self.aaaa.as_ref()
    }

    pub fn cname(&self) -> Option<&WireRecord> {
        self.cname.as_ref()
    }

    /// Name of the source that produced this record.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The destination in browser form, as shown in the dump.
    pub fn target(&self) -> &str {
        self.dhost.browser()
    }
}

fn parse_name(host: &Host) -> Result<Name, InvalidName> {
    let wire = host.wire();
    Name::from_utf8(&wire).map_err(|source| InvalidName { name: wire, source })
}

fn make_rr(owner: Name, ttl: u32, rdata: RData) -> WireRecord {
    let mut rr = WireRecord::from_rdata(owner, ttl, rdata);
    rr.set_dns_class(DNSClass::IN);
    rr
}

/// LIFO of shadowed records at one name.
#[derive(Clone, Debug, Default)]
pub struct RecordStack {
    recs: VecDeque<Record>,
}

impl RecordStack {
    pub fn new() -> RecordStack {
        RecordStack::default()
    }

    /// Prepends `rec`, making it the active record for the name.
    pub fn push_front(&mut self, rec: Record) {
        self.recs.push_front(rec);
    }

    /// The active record, if any.
    pub fn head(&self) -> Option<&Record> {
        self.recs.front()
    }

    /// Removes every record whose origin is the source named `source`.
    /// Returns the number of records left.
    pub fn delete_source(&mut self, source: &str) -> usize {
        self.recs.retain(|rec| rec.origin() != source);
        self.recs.len()
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.recs.iter()
    }
}

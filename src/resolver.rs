// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker pool expanding raw entries into materialized records.
//!
//! One feeder task pulls entries from a source's generator, filters out
//! names that fall outside the served zone, and hands the rest to a fixed
//! set of workers.  Each worker turns the raw target into addresses: a
//! literal IP is used as-is, a hostname is resolved and additionally gets a
//! CNAME.  Failed lookups drop the entry.  Lookup outcomes are memoized for
//! the duration of one expansion, failures included, so a target repeated
//! many times is resolved once.
//!
//! Completion: the feeder closes the entry channel on the generator's
//! terminator, workers exit when drained, and the record channel closes
//! once the last worker is done.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use slog::{Logger, error};
use tokio::sync::{Mutex, mpsc};

use crate::gen::RawEntry;
use crate::host::Host;
use crate::record::Record;
use crate::repository::Repository;
use crate::source::Source;

/// Number of concurrent resolver workers per expansion.
const WORKERS: usize = 6;

/// A memoized lookup outcome.  `None` records a failed lookup so that it is
/// not retried within the batch.
type LookupOutcome = Option<(Option<Ipv4Addr>, Option<Ipv6Addr>)>;

/// Feeds `source`'s generator through the resolver pool and inserts every
/// emitted record into `repo`.  Entries whose name is not inside `zone` are
/// logged and skipped, as are entries whose target cannot be resolved; the
/// expansion itself always runs to completion.
pub async fn expand_source(
    repo: &mut Repository,
    source: &mut Source,
    zone: &Host,
    ttl: Duration,
    resolver: &Arc<TokioAsyncResolver>,
    log: &Logger,
) {
    let Some(generator) = source.take_generator() else {
        error!(log, "source has no generator bound"; "source" => source.name());
        return;
    };
    let origin: Arc<str> = Arc::from(source.name());

    let (entries_tx, entries_rx) = mpsc::channel::<RawEntry>(1);
    let (records_tx, mut records_rx) = mpsc::channel::<Record>(1);
    let entries_rx = Arc::new(Mutex::new(entries_rx));
    let memo: Arc<Mutex<HashMap<String, LookupOutcome>>> =
        Arc::new(Mutex::new(HashMap::new()));

    for _ in 0..WORKERS {
        tokio::spawn(worker(
            Arc::clone(&entries_rx),
            records_tx.clone(),
            Arc::clone(resolver),
            Arc::clone(&memo),
            ttl,
            Arc::clone(&origin),
            log.clone(),
        ));
    }
    // The workers hold the only remaining senders; the record channel
    // closes when the last of them exits.
    drop(records_tx);

    tokio::spawn(feed(generator, entries_tx, zone.clone(), log.clone()));

    while let Some(rec) = records_rx.recv().await {
        let shost = rec.shost().clone();
        repo.add(&shost, rec);
    }
}

/// Pulls the generator until its terminator, applying the zone-containment
/// filter.  Dropping the sender closes the entry channel; dropping the
/// generator releases whatever resources it held.
async fn feed(
    mut generator: Box<dyn crate::gen::Generator>,
    entries: mpsc::Sender<RawEntry>,
    zone: Host,
    log: Logger,
) {
    loop {
        match generator.next().await {
            Ok(Some(entry)) => {
                let shost = Host::from(entry.source.as_str());
                if !shost.has_suffix(&zone) {
                    error!(
                        log,
                        "domain is not inside zone, skipped";
                        "domain" => shost.wire(),
                        "zone" => zone.wire(),
                    );
                    continue;
                }
                if entries.send(entry).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!(log, "generator failed"; "error" => %err);
                break;
            }
        }
    }
}

async fn worker(
    entries: Arc<Mutex<mpsc::Receiver<RawEntry>>>,
    records: mpsc::Sender<Record>,
    resolver: Arc<TokioAsyncResolver>,
    memo: Arc<Mutex<HashMap<String, LookupOutcome>>>,
    ttl: Duration,
    origin: Arc<str>,
    log: Logger,
) {
    loop {
        let entry = { entries.lock().await.recv().await };
        let Some(entry) = entry else {
            break;
        };

        let mut is_cname = false;
        let (ip4, ip6) = match entry.target.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => (Some(ip), None),
            Ok(IpAddr::V6(ip)) => (None, Some(ip)),
            Err(_) => {
                // A hostname: resolve it and make both address and CNAME
                // records.
                is_cname = true;
                match lookup(&entry.target, &resolver, &memo, &log).await {
                    Some(addrs) => addrs,
                    None => continue,
                }
            }
        };

        let rec = Record::new(
            Host::from(entry.source.as_str()),
            Host::from(entry.target.as_str()),
            is_cname,
            ip4,
            ip6,
            ttl,
            Arc::clone(&origin),
        );
        match rec {
            Ok(rec) => {
                if records.send(rec).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                error!(
                    log,
                    "cannot build record, skipped";
                    "source" => &entry.source,
                    "error" => %err,
                );
            }
        }
    }
}

/// Resolves `target`, keeping the first address of each family.  Outcomes,
/// including failures, are memoized for the batch.
async fn lookup(
    target: &str,
    resolver: &TokioAsyncResolver,
    memo: &Mutex<HashMap<String, LookupOutcome>>,
    log: &Logger,
) -> LookupOutcome {
    if let Some(cached) = memo.lock().await.get(target) {
        return *cached;
    }
    let outcome = match resolver.lookup_ip(target).await {
        Ok(addrs) => {
            let mut ip4 = None;
            let mut ip6 = None;
            for addr in addrs.iter() {
                match addr {
                    IpAddr::V4(v4) if ip4.is_none() => ip4 = Some(v4),
                    IpAddr::V6(v6) if ip6.is_none() => ip6 = Some(v6),
                    _ => {}
                }
            }
            Some((ip4, ip6))
        }
        Err(err) => {
            error!(
                log,
                "failed lookup, entry dropped";
                "target" => target,
                "error" => %err,
            );
            None
        }
    };
    memo.lock().await.insert(target.to_string(), outcome);
    outcome
}

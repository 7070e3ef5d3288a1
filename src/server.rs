// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The server core: one task serializing all mutations.
//!
//! Add/delete/update requests are queued on a bounded channel and drained
//! by a single task, so exactly one mutation is in flight at a time and
//! requests apply in arrival order.  Each mutation clones the published
//! repository, rebuilds the clone off-path, and swaps it in atomically;
//! query handlers pin the previous version for the duration of a response
//! and never observe intermediate state.  After a successful mutation the
//! catalog is persisted and the SOA serial bumped, in that order, before
//! the requester is answered.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use hickory_proto::rr::{Name, Record as WireRecord};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use serde::{Deserialize, Serialize};
use slog::{Logger, error, info};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::gen::GeneratorError;
use crate::host::Host;
use crate::repository::Repository;
use crate::resolver;
use crate::soa::SoaManager;
use crate::source::{Catalog, ConfigError, Source, SourceConfig};

/// Depth of the request queue; enqueueing past this fails immediately.
const QUEUE_DEPTH: usize = 10;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("source {0:?} already exists")]
    AlreadyExists(String),
    #[error("source {0:?} not found")]
    NotFound(String),
    #[error("queue full")]
    QueueFull,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start generator: {0}")]
    Generator(#[from] GeneratorError),
    #[error("request dropped before completion")]
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Add,
    Delete,
    Update,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Add => "add",
            Op::Delete => "del",
            Op::Update => "update",
        })
    }
}

struct Request {
    op: Op,
    source: Source,
    resp: oneshot::Sender<Result<(), ServerError>>,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.op, self.source.name())
    }
}

/// Startup parameters for [`Server::start`].
pub struct Config {
    /// Zone served, without trailing dot.
    pub zone: String,
    /// FQDN of this server itself; used in SOA, NS and MX answers.
    pub self_host: String,
    /// TTL applied to every generated A/AAAA/CNAME record.
    pub ttl: Duration,
    /// Where to persist and restore the source catalog; `None` disables
    /// persistence.
    pub save: Option<Utf8PathBuf>,
    /// Log individual client requests.
    pub verbose: bool,
}

/// The single instance coordinating all access to the repository between
/// the DNS and HTTP frontends.
pub struct Server {
    log: Logger,
    verbose: bool,
    zone: Host,
    self_host: Host,
    ttl: Duration,
    soa: SoaManager,
    repo: RwLock<Arc<Repository>>,
    catalog: RwLock<Catalog>,
    save_path: RwLock<Option<Utf8PathBuf>>,
    requests: mpsc::Sender<Request>,
    resolver: Arc<TokioAsyncResolver>,
}

impl Server {
    /// Creates the server, spawns its request loop, and restores any
    /// persisted sources.  Fails only on an invalid zone or server name or
    /// an unreadable persistence file.
    pub async fn start(log: Logger, config: Config) -> anyhow::Result<Arc<Server>> {
        let zone = Host::from(config.zone.as_str());
        let self_host = Host::from(config.self_host.as_str());
        let soa = SoaManager::new(&zone, &self_host)
            .context("constructing SOA record")?;
        let resolver = Arc::new(TokioAsyncResolver::tokio(
            ResolverConfig::default(),
            ResolverOpts::default(),
        ));
        let (requests, requests_rx) = mpsc::channel(QUEUE_DEPTH);

        let server = Arc::new(Server {
            log,
            verbose: config.verbose,
            zone,
            self_host,
            ttl: config.ttl,
            soa,
            repo: RwLock::new(Arc::new(Repository::new())),
            catalog: RwLock::new(Catalog::new()),
            save_path: RwLock::new(config.save.clone()),
            requests,
            resolver,
        });

        tokio::spawn(Arc::clone(&server).run(requests_rx));

        if config.save.is_some() {
            server.restore_sources().await?;
        }
        Ok(server)
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn zone(&self) -> &Host {
        &self.zone
    }

    pub fn self_host(&self) -> &Host {
        &self.self_host
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wire-form name of this server, for synthesized NS and MX answers.
    pub fn self_name(&self) -> &Name {
        self.soa.self_name()
    }

    /// The currently published repository.  The returned reference stays
    /// valid and stable for as long as the caller holds it, independent of
    /// concurrent mutations.
    pub async fn repo_snapshot(&self) -> Arc<Repository> {
        Arc::clone(&*self.repo.read().await)
    }

    /// The current SOA record, for authority sections.
    pub async fn soa_record(&self) -> WireRecord {
        self.soa.record().await
    }

    /// Validates and enqueues an add of a new source named `name` with
    /// configuration `conf`, then waits for the outcome.
    pub async fn add_source(
        &self,
        name: &str,
        conf: SourceConfig,
    ) -> Result<(), ServerError> {
        let mut source = Source::new(name, conf);
        source.init_generator(&self.log).await?;
        self.submit(Op::Add, source).await
    }

    /// Enqueues removal of the source named `name` and waits.
    pub async fn delete_source(&self, name: &str) -> Result<(), ServerError> {
        self.submit(Op::Delete, Source::new(name, SourceConfig::new())).await
    }

    /// Enqueues a refresh of the source named `name`, reusing its stored
    /// configuration, and waits.
    pub async fn update_source(&self, name: &str) -> Result<(), ServerError> {
        self.submit(Op::Update, Source::new(name, SourceConfig::new())).await
    }

    /// One line per registered source: `<name> <type>`.
    pub async fn list_sources(&self) -> String {
        let catalog = self.catalog.read().await;
        let mut out = String::new();
        for src in catalog.iter() {
            out.push_str(src.name());
            out.push(' ');
            out.push_str(src.source_type());
            out.push('\n');
        }
        out
    }

    /// Writes the hosts-style dump of the published repository to `w`.
    pub async fn write_dump<W: Write + Send>(&self, w: &mut W) -> io::Result<()> {
        self.repo_snapshot().await.write_to(w)
    }

    fn submit_request(
        &self,
        op: Op,
        source: Source,
    ) -> Result<oneshot::Receiver<Result<(), ServerError>>, ServerError> {
        let (resp, rx) = oneshot::channel();
        let req = Request { op, source, resp };
        if let Err(err) = self.requests.try_send(req) {
            let req = match &err {
                mpsc::error::TrySendError::Full(req)
                | mpsc::error::TrySendError::Closed(req) => req,
            };
            error!(self.log, "cannot queue request"; "request" => %req);
            return Err(ServerError::QueueFull);
        }
        Ok(rx)
    }

    async fn submit(&self, op: Op, source: Source) -> Result<(), ServerError> {
        let rx = self.submit_request(op, source)?;
        rx.await.map_err(|_| ServerError::Dropped)?
    }

    /// Serves queued requests until the server is dropped.  All repository
    /// mutations happen here.
    async fn run(self: Arc<Server>, mut requests: mpsc::Receiver<Request>) {
        while let Some(req) = requests.recv().await {
            let Request { op, source, resp } = req;
            let result = match op {
                Op::Add => self.apply_add(source).await,
                Op::Delete => self.apply_delete(source).await,
                Op::Update => self.apply_update(source).await,
            };
            // A requester that went away is not an error worth acting on.
            let _ = resp.send(result);
        }
    }

    async fn apply_add(&self, mut source: Source) -> Result<(), ServerError> {
        if self.catalog.read().await.has(source.name()) {
            error!(
                self.log,
                "not added existing source";
                "source" => source.name(),
            );
            return Err(ServerError::AlreadyExists(source.name().to_string()));
        }
        let mut repo = self.clone_repo().await;
        resolver::expand_source(
            &mut repo,
            &mut source,
            &self.zone,
            self.ttl,
            &self.resolver,
            &self.log,
        )
        .await;
        self.set_repo(repo).await;
        if self.verbose {
            info!(self.log, "added source"; "source" => source.name());
        }
        self.catalog.write().await.insert(source);
        self.commit().await;
        Ok(())
    }

    async fn apply_delete(&self, source: Source) -> Result<(), ServerError> {
        let name = source.name();
        if !self.catalog.read().await.has(name) {
            error!(
                self.log,
                "not removed non-existing source";
                "source" => name,
            );
            return Err(ServerError::NotFound(name.to_string()));
        }
        let mut repo = self.clone_repo().await;
        repo.delete_source(name);
        self.set_repo(repo).await;
        self.catalog.write().await.remove(name);
        self.commit().await;
        if self.verbose {
            info!(self.log, "deleted source"; "source" => name);
        }
        Ok(())
    }

    async fn apply_update(&self, source: Source) -> Result<(), ServerError> {
        let name = source.name().to_string();
        // The existing source's configuration is preserved; only the
        // generator is rebuilt.
        let conf = match self.catalog.read().await.get(&name) {
            Some(existing) => existing.conf().clone(),
            None => {
                error!(
                    self.log,
                    "not updated non-existing source";
                    "source" => &name,
                );
                return Err(ServerError::NotFound(name));
            }
        };
        let mut fresh = Source::new(name.clone(), conf);
        fresh.init_generator(&self.log).await?;

        let mut repo = self.clone_repo().await;
        repo.delete_source(&name);
        resolver::expand_source(
            &mut repo,
            &mut fresh,
            &self.zone,
            self.ttl,
            &self.resolver,
            &self.log,
        )
        .await;
        self.set_repo(repo).await;
        self.catalog.write().await.insert(fresh);
        self.commit().await;
        if self.verbose {
            info!(self.log, "updated source"; "source" => &name);
        }
        Ok(())
    }

    /// Everything that follows a committed mutation: persist the catalog,
    /// then bump the SOA serial.
    async fn commit(&self) {
        self.persist_sources().await;
        self.soa.update().await;
    }

    /// A full private copy of the published repository, safe to mutate.
    async fn clone_repo(&self) -> Repository {
        self.repo.read().await.as_ref().clone()
    }

    /// Atomically publishes `repo`.
    async fn set_repo(&self, repo: Repository) {
        *self.repo.write().await = Arc::new(repo);
    }

    async fn persist_sources(&self) {
        let path = self.save_path.read().await.clone();
        let Some(path) = path else {
            return;
        };
        let entries: Vec<PersistedSource> = {
            let catalog = self.catalog.read().await;
            catalog
                .iter()
                .map(|src| PersistedSource {
                    name: src.name().to_string(),
                    conf: src.conf().as_map().clone(),
                })
                .collect()
        };
        let bytes = match serde_json::to_vec(&entries) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(self.log, "cannot persist sources"; "error" => %err);
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            error!(
                self.log,
                "cannot persist sources";
                "path" => path.as_str(),
                "error" => %err,
            );
        }
    }

    /// Replays the persisted catalog as a sequence of adds.  Sources that
    /// fail to start are logged and skipped.  While restoring, the save
    /// path is unset so the file is not rewritten in an intermediate state.
    async fn restore_sources(&self) -> anyhow::Result<()> {
        let path = self.save_path.write().await.take();
        let Some(path) = path else {
            return Ok(());
        };
        let result = self.restore_from(&path).await;
        *self.save_path.write().await = Some(path);
        result
    }

    async fn restore_from(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("cannot restore sources from {:?}", path)
                });
            }
        };
        let entries: Vec<PersistedSource> = match serde_json::from_slice(&bytes)
        {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    self.log,
                    "cannot restore sources, error decoding JSON";
                    "error" => %err,
                );
                return Ok(());
            }
        };
        for entry in entries {
            let conf = SourceConfig::from_map(entry.conf);
            if let Err(err) = self.add_source(&entry.name, conf).await {
                error!(
                    self.log,
                    "cannot restore source";
                    "source" => &entry.name,
                    "error" => %err,
                );
            }
        }
        Ok(())
    }
}

/// One catalog entry as written to the persistence file.
#[derive(Debug, Deserialize, Serialize)]
struct PersistedSource {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Conf")]
    conf: BTreeMap<String, String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gen::{Generator, RawEntry};
    use async_trait::async_trait;
    use hickory_proto::rr::RData;
    use tokio::time::sleep;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn test_server(save: Option<Utf8PathBuf>) -> Arc<Server> {
        Server::start(
            test_logger(),
            Config {
                zone: "lan".to_string(),
                self_host: "localhost".to_string(),
                ttl: Duration::from_secs(3600),
                save,
                verbose: false,
            },
        )
        .await
        .expect("failed to start test server")
    }

    fn static_conf(key: &str, val: &str) -> SourceConfig {
        let mut conf = SourceConfig::new();
        conf.put("source.type", "static");
        conf.put("config.key", key);
        conf.put("config.val", val);
        conf
    }

    async fn active_target(server: &Server, name: &str) -> Option<String> {
        let repo = server.repo_snapshot().await;
        repo.get(&Host::from(name)).map(|rec| rec.target().to_string())
    }

    #[tokio::test]
    async fn test_shadowing_scenario() {
        let server = test_server(None).await;

        server
            .add_source("a", static_conf("x.lan", "1.1.1.1"))
            .await
            .unwrap();
        server
            .add_source("b", static_conf("x.lan", "2.2.2.2"))
            .await
            .unwrap();
        assert_eq!(active_target(&server, "x.lan").await.as_deref(), Some("2.2.2.2"));

        server.delete_source("b").await.unwrap();
        assert_eq!(active_target(&server, "x.lan").await.as_deref(), Some("1.1.1.1"));

        server.delete_source("a").await.unwrap();
        assert_eq!(active_target(&server, "x.lan").await, None);
    }

    #[tokio::test]
    async fn test_add_duplicate_source() {
        let server = test_server(None).await;
        server
            .add_source("s", static_conf("foo.lan", "1.2.3.4"))
            .await
            .unwrap();
        let err = server
            .add_source("s", static_conf("foo.lan", "5.6.7.8"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AlreadyExists(name) if name == "s"));
        // The losing add did not shadow the original.
        assert_eq!(active_target(&server, "foo.lan").await.as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn test_delete_and_update_missing_source() {
        let server = test_server(None).await;
        assert!(matches!(
            server.delete_source("nope").await.unwrap_err(),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            server.update_source("nope").await.unwrap_err(),
            ServerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_reexpands_from_stored_config() {
        let server = test_server(None).await;
        server
            .add_source("s", static_conf("foo.lan", "1.2.3.4"))
            .await
            .unwrap();
        server.update_source("s").await.unwrap();
        // The stored config produced a fresh generator and the record came
        // back after delete + re-expansion.
        assert_eq!(active_target(&server, "foo.lan").await.as_deref(), Some("1.2.3.4"));
        let repo = server.repo_snapshot().await;
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_add_outside_zone_succeeds_with_empty_repo() {
        let server = test_server(None).await;
        server
            .add_source("other", static_conf("host.other", "9.9.9.9"))
            .await
            .unwrap();
        assert!(server.repo_snapshot().await.is_empty());
        // The source itself is registered regardless.
        assert_eq!(server.list_sources().await, "other static\n");
    }

    #[tokio::test]
    async fn test_add_validation_failure_changes_nothing() {
        let server = test_server(None).await;
        let mut conf = SourceConfig::new();
        conf.put("source.type", "static");
        conf.put("config.key", "foo.lan");
        // config.val missing: construction fails before anything is queued.
        let err = server.add_source("s", conf).await.unwrap_err();
        assert!(matches!(err, ServerError::Generator(_)));
        assert!(server.list_sources().await.is_empty());
    }

    #[tokio::test]
    async fn test_soa_serial_bumped_on_mutation() {
        let server = test_server(None).await;
        let serial = |rr: WireRecord| match rr.data() {
            Some(RData::SOA(soa)) => soa.serial(),
            other => panic!("not a SOA: {:?}", other),
        };
        let before = serial(server.soa_record().await);
        server
            .add_source("s", static_conf("foo.lan", "1.2.3.4"))
            .await
            .unwrap();
        let after = serial(server.soa_record().await);
        assert!(after >= before);
    }

    #[tokio::test]
    async fn test_date_source_smoke() {
        let server = test_server(None).await;
        let mut conf = SourceConfig::new();
        conf.put("source.type", "date");
        conf.put("dns.zone", "lan");
        server.add_source("d", conf).await.unwrap();

        let mut out = Vec::new();
        server.write_dump(&mut out).await.unwrap();
        let hosts = crate::hosts::parse(&out[..]).unwrap();
        assert_eq!(hosts.len(), 1);
        let (name, addr) = hosts.iter().next().unwrap();
        assert!(name.ends_with(".lan"));
        assert_eq!(addr, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let save = dir.path().join("sources.json");

        let server = test_server(Some(save.clone())).await;
        server
            .add_source("one", static_conf("foo.lan", "1.2.3.4"))
            .await
            .unwrap();
        server
            .add_source("two", static_conf("bar.lan", "5.6.7.8"))
            .await
            .unwrap();

        let bytes = tokio::fs::read(&save).await.unwrap();
        let entries: Vec<PersistedSource> =
            serde_json::from_slice(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "one");
        assert_eq!(entries[0].conf.get("config.key").unwrap(), "foo.lan");

        // A second server restoring from the same file serves identically.
        let restored = test_server(Some(save)).await;
        assert_eq!(restored.list_sources().await, "one static\ntwo static\n");
        assert_eq!(active_target(&restored, "foo.lan").await.as_deref(), Some("1.2.3.4"));
        assert_eq!(active_target(&restored, "bar.lan").await.as_deref(), Some("5.6.7.8"));
    }

    #[tokio::test]
    async fn test_restore_skips_broken_sources() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let save = dir.path().join("sources.json");
        let entries = vec![
            PersistedSource {
                name: "bad".to_string(),
                conf: BTreeMap::from([(
                    "source.type".to_string(),
                    "bogus".to_string(),
                )]),
            },
            PersistedSource {
                name: "good".to_string(),
                conf: BTreeMap::from([
                    ("source.type".to_string(), "static".to_string()),
                    ("config.key".to_string(), "foo.lan".to_string()),
                    ("config.val".to_string(), "1.2.3.4".to_string()),
                ]),
            },
        ];
        tokio::fs::write(&save, serde_json::to_vec(&entries).unwrap())
            .await
            .unwrap();

        let server = test_server(Some(save)).await;
        assert_eq!(server.list_sources().await, "good static\n");
    }

    /// Generator that blocks until released, to hold the server loop busy.
    struct GateGen {
        gate: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl Generator for GateGen {
        async fn next(&mut self) -> anyhow::Result<Option<RawEntry>> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.await;
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_queue_full() {
        let server = test_server(None).await;

        // Park the server loop on a gated expansion.
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut gated = Source::new("gated", SourceConfig::new());
        gated.set_generator(Box::new(GateGen { gate: Some(gate_rx) }));
        let gated_rx = server.submit_request(Op::Add, gated).unwrap();
        sleep(Duration::from_millis(50)).await;

        // Fill the queue behind it.
        let mut queued = Vec::new();
        for i in 0..QUEUE_DEPTH {
            let source =
                Source::new(format!("missing-{}", i), SourceConfig::new());
            queued.push(server.submit_request(Op::Delete, source).unwrap());
        }

        // The next request bounces immediately.
        let err = server.delete_source("one-too-many").await.unwrap_err();
        assert!(matches!(err, ServerError::QueueFull));

        // Release the gate; everything queued drains in order.
        gate_tx.send(()).unwrap();
        gated_rx.await.unwrap().unwrap();
        for rx in queued {
            assert!(matches!(
                rx.await.unwrap(),
                Err(ServerError::NotFound(_))
            ));
        }
    }
}

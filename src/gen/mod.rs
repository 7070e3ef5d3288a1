// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generators: lazy, single-shot producers of raw entries.
//!
//! A generator is pulled one entry at a time; `Ok(None)` is the terminator.
//! Once exhausted a generator cannot be rewound; the update protocol
//! constructs a fresh one for every expansion.  Required configuration keys
//! are validated on construction, so a bad add fails before anything is
//! enqueued.

mod mysql;

use async_trait::async_trait;
use chrono::Utc;
use slog::Logger;
use thiserror::Error;

use crate::source::{ConfigError, SourceConfig};

pub use mysql::MysqlGen;

/// A pair of source and target addresses or domains to be resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntry {
    pub source: String,
    pub target: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the next entry mapping a hostname to its destination
    /// IP or hostname, or `None` when no more entries are available.
    async fn next(&mut self) -> anyhow::Result<Option<RawEntry>>;
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid generator name {0:?}")]
    InvalidType(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config.port {0:?}")]
    InvalidPort(String),
    #[error("cannot connect to mysql")]
    Connect(#[source] sqlx::Error),
}

/// Builds the generator named by `source.type`.
pub async fn make_generator(
    stype: &str,
    conf: &SourceConfig,
    log: &Logger,
) -> Result<Box<dyn Generator>, GeneratorError> {
    match stype {
        "mysql" => Ok(Box::new(MysqlGen::new(conf, log).await?)),
        "date" => Ok(Box::new(DateGen::new(conf))),
        "static" => Ok(Box::new(StaticGen::new(conf)?)),
        other => Err(GeneratorError::InvalidType(other.to_string())),
    }
}

/// Yields the single entry configured with `config.key`/`config.val`.
pub struct StaticGen {
    entry: Option<RawEntry>,
}

impl StaticGen {
    pub fn new(conf: &SourceConfig) -> Result<StaticGen, GeneratorError> {
        let key = conf.required("config.key")?;
        let val = conf.required("config.val")?;
        Ok(StaticGen {
            entry: Some(RawEntry { source: key.to_string(), target: val.to_string() }),
        })
    }
}

#[async_trait]
impl Generator for StaticGen {
    async fn next(&mut self) -> anyhow::Result<Option<RawEntry>> {
        Ok(self.entry.take())
    }
}

/// Yields one entry naming the current UTC time inside the zone.  Used for
/// smoke tests.
pub struct DateGen {
    entry: Option<RawEntry>,
}

impl DateGen {
    pub fn new(conf: &SourceConfig) -> DateGen {
        let zone = conf.get_or("dns.zone", "lan");
        let date = Utc::now().format("%Y%m%d%H%M%S");
        DateGen {
            entry: Some(RawEntry {
                source: format!("{}.{}", date, zone),
                target: "127.0.0.1".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Generator for DateGen {
    async fn next(&mut self) -> anyhow::Result<Option<RawEntry>> {
        Ok(self.entry.take())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn test_static_generator() {
        let mut conf = SourceConfig::new();
        conf.put("config.key", "foo.lan");
        conf.put("config.val", "1.2.3.4");

        let mut gen = make_generator("static", &conf, &test_logger())
            .await
            .unwrap();
        let entry = gen.next().await.unwrap().unwrap();
        assert_eq!(entry.source, "foo.lan");
        assert_eq!(entry.target, "1.2.3.4");
        // Single-shot: exhausted generators stay exhausted.
        assert!(gen.next().await.unwrap().is_none());
        assert!(gen.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_generator_missing_keys() {
        let mut conf = SourceConfig::new();
        conf.put("config.key", "foo.lan");
        let err = make_generator("static", &conf, &test_logger())
            .await
            .err()
            .expect("missing config.val fails construction");
        assert!(matches!(err, GeneratorError::Config(_)));
    }

    #[tokio::test]
    async fn test_date_generator() {
        let mut conf = SourceConfig::new();
        conf.put("dns.zone", "home.arpa");

        let mut gen = make_generator("date", &conf, &test_logger())
            .await
            .unwrap();
        let entry = gen.next().await.unwrap().unwrap();
        assert_eq!(entry.target, "127.0.0.1");
        let stamp = entry
            .source
            .strip_suffix(".home.arpa")
            .expect("name ends with the zone");
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert!(gen.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_generator_type() {
        let conf = SourceConfig::new();
        let err = make_generator("ldap", &conf, &test_logger())
            .await
            .err()
            .expect("unknown type fails");
        assert!(matches!(err, GeneratorError::InvalidType(_)));
    }
}

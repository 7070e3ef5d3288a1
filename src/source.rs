// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sources, their configuration, and the source catalog.
//!
//! A [`Source`] is a named producer of raw (name, target) pairs.  Its
//! [`SourceConfig`] is a flat key/value map whose recognized keys live in
//! the `source.*` (meta) and `config.*` (generator-specific) namespaces.
//! The generator handle is transient: bound while an expansion is pending,
//! released once the generator is exhausted.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use slog::Logger;
use thiserror::Error;

use crate::gen::{self, Generator, GeneratorError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required parameter {0} not found")]
    Missing(String),
    #[error("required parameter {0} is empty")]
    Empty(String),
    #[error("cannot parse JSON: {0}")]
    BadJson(#[source] serde_json::Error),
    #[error("cannot parse form: {0}")]
    BadForm(#[source] serde_urlencoded::de::Error),
}

/// Flat configuration key/value map.
#[derive(Clone, Debug, Default)]
pub struct SourceConfig {
    map: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn new() -> SourceConfig {
        SourceConfig::default()
    }

    pub fn from_map(map: BTreeMap<String, String>) -> SourceConfig {
        SourceConfig { map }
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.map
    }

    /// Adds a key/value pair, overriding any previous entry.
    pub fn put(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.map.insert(key.into(), val.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// The value for `key`, or `default` if not present.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// The value for `key`; missing or empty values are an error.
    pub fn required(&self, key: &str) -> Result<&str, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::Missing(key.to_string())),
            Some("") => Err(ConfigError::Empty(key.to_string())),
            Some(v) => Ok(v),
        }
    }

    /// Merges JSON object input, keeping only keys in the recognized
    /// namespaces.
    pub fn merge_json<R: Read>(&mut self, r: R) -> Result<(), ConfigError> {
        let m: BTreeMap<String, String> =
            serde_json::from_reader(r).map_err(ConfigError::BadJson)?;
        for (k, v) in m {
            if recognized_key(&k) {
                self.map.insert(k, v);
            }
        }
        Ok(())
    }

    /// Merges URL-encoded form input, keeping only keys in the recognized
    /// namespaces.  Duplicate keys take the last value.
    pub fn merge_form(&mut self, body: &[u8]) -> Result<(), ConfigError> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_bytes(body).map_err(ConfigError::BadForm)?;
        for (k, v) in pairs {
            if recognized_key(&k) {
                self.map.insert(k, v);
            }
        }
        Ok(())
    }
}

fn recognized_key(key: &str) -> bool {
    key.starts_with("config.") || key.starts_with("source.")
}

/// A named producer of raw entries.
pub struct Source {
    name: String,
    conf: SourceConfig,
    gen: Option<Box<dyn Generator>>,
}

impl Source {
    pub fn new(name: impl Into<String>, conf: SourceConfig) -> Source {
        Source { name: name.into(), conf, gen: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conf(&self) -> &SourceConfig {
        &self.conf
    }

    /// Type of this source, from its configuration.
    pub fn source_type(&self) -> &str {
        self.conf.get_or("source.type", "unknown")
    }

    /// Binds a fresh generator for a new production of entries, built from
    /// `source.type` and the stored configuration.
    pub async fn init_generator(&mut self, log: &Logger) -> Result<(), GeneratorError> {
        let stype = self
            .conf
            .required("source.type")
            .map_err(GeneratorError::Config)?
            .to_string();
        self.gen = Some(gen::make_generator(&stype, &self.conf, log).await?);
        Ok(())
    }

    /// Takes the bound generator for consumption; generators are
    /// single-shot, so the handle is not replaced.
    pub fn take_generator(&mut self) -> Option<Box<dyn Generator>> {
        self.gen.take()
    }

    #[cfg(test)]
    pub(crate) fn set_generator(&mut self, gen: Box<dyn Generator>) {
        self.gen = Some(gen);
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The collection of registered sources, keyed and ordered by name.
#[derive(Default)]
pub struct Catalog {
    sources: BTreeMap<String, Source>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Source> {
        self.sources.get(name)
    }

    pub fn insert(&mut self, source: Source) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn remove(&mut self, name: &str) -> Option<Source> {
        self.sources.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

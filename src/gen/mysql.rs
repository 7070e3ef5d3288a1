// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MySQL-backed generator.
//!
//! Opens one connection, streams the configured query, and yields each row
//! as a (source, target) pair taken from the first two columns.  The
//! connection is closed when the rows are drained or the consumer goes
//! away.  Rows with empty or unscannable columns are logged and skipped.

use async_trait::async_trait;
use futures::TryStreamExt;
use slog::{Logger, error, info, warn};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};
use tokio::sync::mpsc;

use super::{Generator, GeneratorError, RawEntry};
use crate::source::SourceConfig;

pub struct MysqlGen {
    rx: mpsc::Receiver<anyhow::Result<RawEntry>>,
}

impl MysqlGen {
    pub async fn new(
        conf: &SourceConfig,
        log: &Logger,
    ) -> Result<MysqlGen, GeneratorError> {
        let user = conf.required("config.user")?.to_string();
        let password = conf.required("config.password")?.to_string();
        let database = conf.required("config.database")?.to_string();
        let query = conf.required("config.query")?.to_string();
        let host = conf.get_or("config.host", "localhost").to_string();
        let port = conf.get_or("config.port", "3306");
        let port: u16 = port
            .parse()
            .map_err(|_| GeneratorError::InvalidPort(port.to_string()))?;

        let opts = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&user)
            .password(&password)
            .database(&database);
        let mut conn = opts.connect().await.map_err(GeneratorError::Connect)?;

        let (tx, rx) = mpsc::channel(100);
        let log = log.clone();
        tokio::spawn(async move {
            {
                let mut rows = sqlx::query(&query).fetch(&mut conn);
                loop {
                    match rows.try_next().await {
                        Ok(Some(row)) => {
                            let source = row.try_get::<String, _>(0);
                            let target = row.try_get::<String, _>(1);
                            match (source, target) {
                                (Ok(source), Ok(target)) => {
                                    if source.is_empty() || target.is_empty() {
                                        info!(
                                            log,
                                            "skipping empty entry from database"
                                        );
                                        continue;
                                    }
                                    let entry = RawEntry { source, target };
                                    if tx.send(Ok(entry)).await.is_err() {
                                        // Consumer is gone.
                                        break;
                                    }
                                }
                                (Err(err), _) | (_, Err(err)) => {
                                    error!(
                                        log,
                                        "error reading database row";
                                        "error" => %err,
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Err(err.into())).await;
                            break;
                        }
                    }
                }
            }
            if let Err(err) = conn.close().await {
                warn!(log, "error closing mysql connection"; "error" => %err);
            }
        });

        Ok(MysqlGen { rx })
    }
}

#[async_trait]
impl Generator for MysqlGen {
    async fn next(&mut self) -> anyhow::Result<Option<RawEntry>> {
        match self.rx.recv().await {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

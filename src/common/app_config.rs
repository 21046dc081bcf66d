// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Process-wide configuration. The coordinator is a library embedded in a
//! host engine, so a config file is optional: `$GRIDSQL_CONFIG` names one
//! explicitly, `./gridsql.toml` is picked up when present, and otherwise
//! the built-in defaults apply. A present-but-broken file is an error, not
//! a silent fallback.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

static CONFIG: OnceLock<GridSqlConfig> = OnceLock::new();

/// Loads from an explicit path, pinning the process-wide config if it is
/// not set yet.
pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static GridSqlConfig> {
    let cfg = GridSqlConfig::load_from_file(path.as_ref())?;
    Ok(CONFIG.get_or_init(|| cfg))
}

/// The process-wide config, resolved lazily on first use.
pub fn config() -> Result<&'static GridSqlConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }

    let cfg = match resolve_config_path() {
        Some(path) => GridSqlConfig::load_from_file(&path)?,
        None => GridSqlConfig::default(),
    };
    Ok(CONFIG.get_or_init(|| cfg))
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("GRIDSQL_CONFIG") {
        let raw = raw.trim();
        if !raw.is_empty() {
            return Some(PathBuf::from(raw));
        }
    }

    let local = Path::new("gridsql.toml");
    local.exists().then(|| local.to_path_buf())
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Deserialize)]
pub struct GridSqlConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "gridsql=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for GridSqlConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl GridSqlConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn effective_log_filter(&self) -> String {
        match self.log_filter.as_ref() {
            Some(f) if !f.trim().is_empty() => f.clone(),
            _ => self.log_level.clone(),
        }
    }
}

fn default_page_size() -> usize {
    1024
}

fn default_retry_timeout_ms() -> u64 {
    30_000
}

fn default_reply_poll_interval_ms() -> u64 {
    500
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Rows per map response page when the split query does not set one.
    #[serde(default = "default_page_size")]
    pub query_page_size: usize,

    /// How long the reduce retry loop keeps chasing an unstable topology.
    #[serde(default = "default_retry_timeout_ms")]
    pub sql_retry_timeout_ms: u64,

    /// Latch poll interval while waiting for first pages.
    #[serde(default = "default_reply_poll_interval_ms")]
    pub reply_poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            query_page_size: default_page_size(),
            sql_retry_timeout_ms: default_retry_timeout_ms(),
            reply_poll_interval_ms: default_reply_poll_interval_ms(),
        }
    }
}

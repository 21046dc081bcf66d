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

//! Logging setup for the reduce coordinator. The coordinator usually runs
//! embedded in a host engine process, so events carry their `tracing` target
//! for per-module filtering and the call site goes last, where it does not
//! get in the way of grepping by message.

use std::fmt;
use std::sync::OnceLock;

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// `2026-08-02 10:15:42.123456  WARN gridsql::runtime::reduce: message (reduce.rs:87)`
struct ReduceLogFormatter;

impl<S, N> FormatEvent<S, N> for ReduceLogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} {:>5} {}: ",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            metadata.level(),
            metadata.target()
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            // Only the file name; the full path is noise next to the target.
            let file = file.rsplit('/').next().unwrap_or(file);
            write!(writer, " ({file}:{line})")?;
        }

        writeln!(writer)
    }
}

/// Installs the subscriber once with the given `EnvFilter` expression;
/// every later call is a no-op, including from other threads.
pub fn init_with_filter(filter: &str) {
    if INIT.set(()).is_err() {
        return;
    }

    // ANSI colors only when stderr is really a terminal.
    let _ = tracing_fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .event_format(ReduceLogFormatter)
        .try_init();
}

/// Initialise from `gridsql.toml`: the full filter expression when one is
/// configured, the plain level otherwise.
pub fn init_from_config() {
    let filter = crate::gridsql_config::config()
        .map(|c| c.effective_log_filter())
        .unwrap_or_else(|_| "info".to_string());
    init_with_filter(&filter);
}

pub fn init() {
    init_with_filter("info");
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};

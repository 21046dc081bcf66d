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
use std::time::Duration;

use crate::gridsql_config::config as gridsql_app_config;

/// Environment override for the retry budget, in milliseconds.
pub const SQL_RETRY_TIMEOUT_ENV: &str = "GRIDSQL_SQL_RETRY_TIMEOUT";

pub(crate) fn default_page_size() -> usize {
    gridsql_app_config()
        .ok()
        .map(|c| c.runtime.query_page_size)
        .unwrap_or(1024)
}

pub(crate) fn reply_poll_interval() -> Duration {
    let ms = gridsql_app_config()
        .ok()
        .map(|c| c.runtime.reply_poll_interval_ms)
        .unwrap_or(500)
        .max(1);
    Duration::from_millis(ms)
}

fn configured_retry_timeout_ms() -> u64 {
    gridsql_app_config()
        .ok()
        .map(|c| c.runtime.sql_retry_timeout_ms)
        .unwrap_or(30_000)
}

/// Retry budget for one query: the query timeout when set, otherwise the
/// environment override, otherwise the configured default.
pub(crate) fn sql_retry_timeout(query_timeout_millis: i64) -> Duration {
    if query_timeout_millis > 0 {
        return Duration::from_millis(query_timeout_millis as u64);
    }

    if let Ok(raw) = std::env::var(SQL_RETRY_TIMEOUT_ENV) {
        if let Ok(ms) = raw.trim().parse::<u64>() {
            return Duration::from_millis(ms);
        }
    }

    Duration::from_millis(configured_retry_timeout_ms())
}

#[cfg(test)]
mod tests {
    use super::sql_retry_timeout;
    use std::time::Duration;

    #[test]
    fn query_timeout_wins_over_default() {
        assert_eq!(sql_retry_timeout(1500), Duration::from_millis(1500));
    }
}

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
use std::sync::Mutex;

use crate::common::types::TopologyVersion;
use crate::engine::value::{Row, SqlValue};
use crate::runtime::error::ReduceError;

/// Forward-only row stream produced by the engine or by a merge index.
pub trait RowCursor: Send {
    fn next_row(&mut self) -> Result<Option<Row>, ReduceError>;
}

/// A thread-pinned engine connection. The reducer borrows one for the whole
/// lifetime of a run; closing it is a failure escape only.
pub trait SqlConnection: Send + Sync {
    fn schema(&self) -> &str;
    fn close_quiet(&self);
}

/// Seam to the host SQL engine. The reduce statement executed through
/// [`SqlEngine::execute_query`] must consume the merge tables eagerly: by the
/// time the cursor is returned, every merge index it read from has either
/// been drained or abandoned.
pub trait SqlEngine: Send + Sync {
    fn connection_for_thread(&self, schema: &str) -> Result<std::sync::Arc<dyn SqlConnection>, ReduceError>;

    /// Apply per-statement session flags before the reduce statement runs.
    fn setup_connection(
        &self,
        conn: &dyn SqlConnection,
        distributed_joins: bool,
        enforce_join_order: bool,
    );

    fn execute_query(
        &self,
        conn: &dyn SqlConnection,
        sql: &str,
        params: &[SqlValue],
        timeout_millis: i64,
        cancel: Option<&QueryCancel>,
    ) -> Result<Box<dyn RowCursor>, ReduceError>;

    fn ready_topology_version(&self) -> TopologyVersion;

    fn server_topology_changed(&self, since: TopologyVersion) -> bool;

    /// Topology version locked by the calling thread's transaction, if any.
    fn locked_topology_version(&self) -> Option<TopologyVersion>;

    /// Block until the local topology catches up with `ver`.
    fn await_ready_topology_version(&self, ver: TopologyVersion) -> Result<(), ReduceError>;
}

struct CancelInner {
    cancelled: bool,
    handler: Option<Box<dyn Fn() + Send>>,
}

/// Cancellation token for one reduce call. The registered handler runs once,
/// on the first `cancel()`.
pub struct QueryCancel {
    inner: Mutex<CancelInner>,
}

impl Default for QueryCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCancel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CancelInner {
                cancelled: false,
                handler: None,
            }),
        }
    }

    /// Install the cancel action. Fails when the token already fired so the
    /// caller observes the cancellation instead of racing it.
    pub fn set_handler(&self, handler: Box<dyn Fn() + Send>) -> Result<(), ReduceError> {
        let mut inner = self.inner.lock().expect("query cancel lock");
        if inner.cancelled {
            return Err(ReduceError::Cancelled);
        }
        inner.handler = Some(handler);
        Ok(())
    }

    pub fn cancel(&self) {
        let handler = {
            let mut inner = self.inner.lock().expect("query cancel lock");
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.handler.take()
        };
        if let Some(h) = handler {
            h();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().expect("query cancel lock").cancelled
    }

    pub fn check_cancelled(&self) -> Result<(), ReduceError> {
        if self.is_cancelled() {
            Err(ReduceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

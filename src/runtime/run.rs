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
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::common::types::{NodeId, TopologyVersion};
use crate::engine::sql::SqlConnection;
use crate::engine::tx::SelectForUpdateFuture;
use crate::gridsql_logging::debug;
use crate::runtime::error::ReduceError;
use crate::runtime::latch::CountDownLatch;
use crate::runtime::merge_index::MergeIndex;

/// Lifecycle of one reduce attempt. The first terminal transition wins.
#[derive(Clone, Debug)]
pub(crate) enum RunState {
    Running,
    Retry {
        top_ver: TopologyVersion,
        node: NodeId,
        cause: String,
    },
    Failed(ReduceError),
    Disconnected(ReduceError),
}

/// Per-request state of one reduce query attempt.
pub(crate) struct ReduceQueryRun {
    conn: Arc<dyn SqlConnection>,
    page_size: usize,
    indexes: Vec<Arc<dyn MergeIndex>>,
    latch: CountDownLatch,
    state: Mutex<RunState>,
    sfu_fut: Option<Arc<SelectForUpdateFuture>>,
    data_page_scan: Option<bool>,
    cancel_sent: AtomicBool,
}

impl ReduceQueryRun {
    pub(crate) fn new(
        conn: Arc<dyn SqlConnection>,
        page_size: usize,
        indexes: Vec<Arc<dyn MergeIndex>>,
        latch_count: u64,
        sfu_fut: Option<Arc<SelectForUpdateFuture>>,
        data_page_scan: Option<bool>,
    ) -> Self {
        Self {
            conn,
            page_size,
            indexes,
            latch: CountDownLatch::new(latch_count),
            state: Mutex::new(RunState::Running),
            sfu_fut,
            data_page_scan,
            cancel_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<dyn SqlConnection> {
        &self.conn
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn indexes(&self) -> &[Arc<dyn MergeIndex>] {
        &self.indexes
    }

    pub(crate) fn index(&self, query_index: usize) -> Option<&Arc<dyn MergeIndex>> {
        self.indexes.get(query_index)
    }

    pub(crate) fn latch(&self) -> &CountDownLatch {
        &self.latch
    }

    pub(crate) fn select_for_update_future(&self) -> Option<&Arc<SelectForUpdateFuture>> {
        self.sfu_fut.as_ref()
    }

    pub(crate) fn data_page_scan(&self) -> Option<bool> {
        self.data_page_scan
    }

    /// True once this run's cancel request has been broadcast; flips only
    /// once so the map side sees at most one cancel.
    pub(crate) fn mark_cancel_sent(&self) -> bool {
        !self.cancel_sent.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn state_snapshot(&self) -> RunState {
        self.state.lock().expect("run state lock").clone()
    }

    pub(crate) fn has_error_or_retry(&self) -> bool {
        !matches!(*self.state.lock().expect("run state lock"), RunState::Running)
    }

    /// The stored failure, if the run failed (rather than retried).
    pub(crate) fn exception(&self) -> Option<ReduceError> {
        match &*self.state.lock().expect("run state lock") {
            RunState::Failed(e) | RunState::Disconnected(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub(crate) fn retry_info(&self) -> Option<(NodeId, String)> {
        match &*self.state.lock().expect("run state lock") {
            RunState::Retry { node, cause, .. } => Some((*node, cause.clone())),
            _ => None,
        }
    }

    pub(crate) fn retry_topology_version(&self) -> Option<TopologyVersion> {
        match &*self.state.lock().expect("run state lock") {
            RunState::Retry { top_ver, .. } => Some(*top_ver),
            _ => None,
        }
    }

    /// A mapper found its partition view stale and asked us to retry at
    /// `top_ver`.
    pub(crate) fn set_state_on_retry(
        &self,
        node: NodeId,
        top_ver: TopologyVersion,
        cause: Option<String>,
    ) {
        let cause = cause.unwrap_or_else(|| format!("Mapper requested retry [node={node}]"));
        self.transition(
            RunState::Retry {
                top_ver,
                node,
                cause: cause.clone(),
            },
            ReduceError::RetryRequired { cause },
        );
    }

    pub(crate) fn set_state_on_exception(&self, node: Option<NodeId>, err: ReduceError) {
        debug!("run failed: node={node:?} err={err}");
        self.transition(RunState::Failed(err.clone()), err);
    }

    /// A tracked source left the topology: convert to a retry, not an error.
    pub(crate) fn set_state_on_node_leave(&self, node: NodeId, top_ver: TopologyVersion) {
        let cause = format!("Data node has left the grid during query execution [nodeId={node}]");
        self.transition(
            RunState::Retry {
                top_ver,
                node,
                cause: cause.clone(),
            },
            ReduceError::RetryRequired { cause },
        );
    }

    pub(crate) fn disconnected(&self, err: ReduceError) {
        self.transition(RunState::Disconnected(err.clone()), err);
    }

    fn transition(&self, next: RunState, idx_err: ReduceError) {
        let failed = matches!(next, RunState::Failed(_) | RunState::Disconnected(_));
        {
            let mut state = self.state.lock().expect("run state lock");
            if !matches!(*state, RunState::Running) {
                return;
            }
            *state = next;
        }
        // Wake the orchestrator and every blocked cursor. A retried attempt
        // resolves its SELECT FOR UPDATE future itself, with zero rows.
        self.latch.force_release();
        for idx in &self.indexes {
            idx.fail(idx_err.clone());
        }
        if failed {
            if let Some(f) = &self.sfu_fut {
                f.on_done_err(idx_err);
            }
        }
    }
}

/// Result of a distributed DML statement.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateResult {
    pub updated: u64,
}

pub(crate) struct CompletionFuture<T> {
    mu: Mutex<Option<Result<T, ReduceError>>>,
    cv: Condvar,
}

impl<T: Clone> CompletionFuture<T> {
    pub(crate) fn new() -> Self {
        Self {
            mu: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// First completion wins; later ones report false.
    pub(crate) fn on_done(&self, res: Result<T, ReduceError>) -> bool {
        let mut slot = self.mu.lock().expect("future lock");
        if slot.is_some() {
            return false;
        }
        *slot = Some(res);
        self.cv.notify_all();
        true
    }

    pub(crate) fn get(&self) -> Result<T, ReduceError> {
        let mut slot = self.mu.lock().expect("future lock");
        loop {
            if let Some(res) = slot.as_ref() {
                return res.clone();
            }
            slot = self.cv.wait(slot).expect("future wait");
        }
    }
}

struct UpdateProgress {
    responded: HashSet<NodeId>,
    updated_total: u64,
}

/// Accounting of one DML fan-out: expected responder count, per-node
/// responded set, running row total and the resolve-once future.
pub(crate) struct DistributedUpdateRun {
    node_count: usize,
    progress: Mutex<UpdateProgress>,
    fut: CompletionFuture<UpdateResult>,
}

impl DistributedUpdateRun {
    pub(crate) fn new(node_count: usize) -> Self {
        Self {
            node_count,
            progress: Mutex::new(UpdateProgress {
                responded: HashSet::new(),
                updated_total: 0,
            }),
            fut: CompletionFuture::new(),
        }
    }

    pub(crate) fn future(&self) -> &CompletionFuture<UpdateResult> {
        &self.fut
    }

    pub(crate) fn handle_response(&self, node: NodeId, updated: u64, error: Option<&str>) {
        if let Some(err) = error {
            self.fut.on_done(Err(ReduceError::MapFailed {
                node,
                detail: err.to_string(),
                cancelled: false,
            }));
            return;
        }

        let done = {
            let mut progress = self.progress.lock().expect("update run lock");
            if !progress.responded.insert(node) {
                // Duplicate response from the same node.
                return;
            }
            progress.updated_total += updated;
            if progress.responded.len() == self.node_count {
                Some(progress.updated_total)
            } else {
                None
            }
        };

        if let Some(total) = done {
            self.fut.on_done(Ok(UpdateResult { updated: total }));
        }
    }

    /// A mapped node left before responding: the update cannot complete.
    pub(crate) fn handle_node_left(&self, node: NodeId) {
        {
            let progress = self.progress.lock().expect("update run lock");
            if progress.responded.contains(&node) {
                return;
            }
        }
        self.fut.on_done(Err(ReduceError::Engine(format!(
            "Update failed because map node left topology [nodeId={node}]"
        ))));
    }

    pub(crate) fn handle_disconnect(&self, err: ReduceError) {
        self.fut.on_done(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::{DistributedUpdateRun, ReduceQueryRun, RunState, UpdateResult};
    use crate::common::types::{TopologyVersion, UniqueId};
    use crate::engine::sql::SqlConnection;
    use crate::runtime::error::ReduceError;
    use std::sync::Arc;

    struct FakeConn;

    impl SqlConnection for FakeConn {
        fn schema(&self) -> &str {
            "PUBLIC"
        }

        fn close_quiet(&self) {}
    }

    fn run() -> ReduceQueryRun {
        ReduceQueryRun::new(Arc::new(FakeConn), 16, Vec::new(), 3, None, None)
    }

    #[test]
    fn first_terminal_transition_wins() {
        let r = run();
        let n1 = UniqueId::new(1, 1);
        r.set_state_on_node_leave(n1, TopologyVersion(4));
        r.set_state_on_exception(Some(n1), ReduceError::Cancelled);

        assert!(r.has_error_or_retry());
        assert!(matches!(r.state_snapshot(), RunState::Retry { .. }));
        assert_eq!(r.retry_topology_version(), Some(TopologyVersion(4)));
        // Latch was forced so the orchestrator can observe the state.
        assert_eq!(r.latch().count(), 0);
    }

    #[test]
    fn failure_is_reported_as_exception() {
        let r = run();
        let n1 = UniqueId::new(1, 1);
        r.set_state_on_exception(
            Some(n1),
            ReduceError::MapFailed {
                node: n1,
                detail: "boom".into(),
                cancelled: false,
            },
        );
        assert!(r.exception().is_some());
        assert!(r.retry_info().is_none());
    }

    #[test]
    fn cancel_broadcast_happens_once() {
        let r = run();
        assert!(r.mark_cancel_sent());
        assert!(!r.mark_cancel_sent());
    }

    #[test]
    fn update_run_sums_row_counts() {
        let r = DistributedUpdateRun::new(2);
        let n1 = UniqueId::new(1, 1);
        let n2 = UniqueId::new(2, 2);
        r.handle_response(n1, 3, None);
        // Duplicate is ignored.
        r.handle_response(n1, 3, None);
        r.handle_response(n2, 4, None);
        assert_eq!(
            r.future().get().expect("update result"),
            UpdateResult { updated: 7 }
        );
    }

    #[test]
    fn update_run_fails_when_unresponded_node_leaves() {
        let r = DistributedUpdateRun::new(2);
        let n1 = UniqueId::new(1, 1);
        let n2 = UniqueId::new(2, 2);
        r.handle_response(n1, 3, None);
        // A node that already responded leaving is fine.
        r.handle_node_left(n1);
        r.handle_node_left(n2);
        assert!(r.future().get().is_err());
    }
}

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
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use crate::common::types::{NodeId, TopologyVersion, UniqueId};
use crate::gridsql_logging::debug;
use crate::runtime::error::ReduceError;

/// MVCC snapshot attached to transactional read-only queries. Only the
/// semantic shape matters to the reducer; it forwards the snapshot verbatim.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MvccSnapshot {
    pub coordinator: u64,
    pub counter: u64,
    pub cleanup: u64,
}

/// External snapshot handle for transactional queries. Ownership transfers
/// to the result iterator; `on_done` fires exactly once when the query is
/// released.
pub trait MvccTracker: Send + Sync {
    fn snapshot(&self) -> Option<MvccSnapshot>;
    fn on_done(&self);
}

/// The active near transaction, as far as SELECT FOR UPDATE planning needs
/// to see it.
pub trait TxContext: Send + Sync {
    fn thread_id(&self) -> i64;
    fn subject_id(&self) -> UniqueId;
    fn xid(&self) -> UniqueId;
    fn task_name_hash(&self) -> i32;
    /// Remaining transaction time, milliseconds.
    fn remaining_time(&self) -> i64;
    fn mvcc_snapshot(&self) -> Option<MvccSnapshot>;
    /// Blocks until the transaction's topology is known; returns the version
    /// and whether this client is first on it.
    fn topology_version_future(&self) -> Result<(TopologyVersion, bool), ReduceError>;
}

#[derive(Default)]
struct SfuState {
    expected: Option<HashSet<NodeId>>,
    received: HashMap<NodeId, u64>,
    done: Option<Result<u64, ReduceError>>,
}

impl SfuState {
    fn try_finish(&mut self) -> bool {
        if self.done.is_some() {
            return false;
        }
        let Some(expected) = self.expected.as_ref() else {
            return false;
        };
        if expected.iter().all(|n| self.received.contains_key(n)) {
            let total = self.received.values().sum();
            self.done = Some(Ok(total));
            return true;
        }
        false
    }
}

/// Aggregates per-node locked-row counts of a SELECT FOR UPDATE run.
/// Resolves exactly once: to the row total, to an explicit completion, or to
/// a failure.
pub struct SelectForUpdateFuture {
    mu: Mutex<SfuState>,
    cv: Condvar,
}

impl Default for SelectForUpdateFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectForUpdateFuture {
    pub fn new() -> Self {
        Self {
            mu: Mutex::new(SfuState::default()),
            cv: Condvar::new(),
        }
    }

    /// Called once the mapped node set is known for this attempt.
    pub fn init(&self, top_ver: TopologyVersion, nodes: &[NodeId]) {
        debug!(
            "select-for-update mapped: topVer={top_ver} nodes={}",
            nodes.len()
        );
        let mut st = self.mu.lock().expect("sfu lock");
        if st.done.is_some() {
            return;
        }
        st.expected = Some(nodes.iter().copied().collect());
        if st.try_finish() {
            self.cv.notify_all();
        }
    }

    /// First-page result from one node. `remove_mapping` means the node
    /// locked no rows and asked to be dropped from the tx mapping; the
    /// reducer only records the count either way.
    pub fn on_result(&self, node: NodeId, rows: u64, _remove_mapping: bool) {
        let mut st = self.mu.lock().expect("sfu lock");
        if st.done.is_some() {
            return;
        }
        st.received.entry(node).or_insert(rows);
        if st.try_finish() {
            self.cv.notify_all();
        }
    }

    pub fn on_done_ok(&self, rows: u64) -> bool {
        self.finish(Ok(rows))
    }

    pub fn on_done_err(&self, err: ReduceError) -> bool {
        self.finish(Err(err))
    }

    fn finish(&self, res: Result<u64, ReduceError>) -> bool {
        let mut st = self.mu.lock().expect("sfu lock");
        if st.done.is_some() {
            return false;
        }
        st.done = Some(res);
        self.cv.notify_all();
        true
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.mu.lock().expect("sfu lock").done,
            Some(Err(_))
        )
    }

    /// Blocks until the future resolves.
    pub fn get(&self) -> Result<u64, ReduceError> {
        let mut st = self.mu.lock().expect("sfu lock");
        loop {
            if let Some(res) = st.done.as_ref() {
                return res.clone();
            }
            st = self.cv.wait(st).expect("sfu wait");
        }
    }
}

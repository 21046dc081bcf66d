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
//! In-memory grid harness for the reduce coordinator integration tests:
//! a recording transport, a scriptable partition mapper, a static discovery
//! view and a minimal SQL engine stub.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gridsql::common::types::{CacheId, NodeId, NodeVersion, TopologyVersion, UniqueId};
use gridsql::engine::sql::{QueryCancel, RowCursor, SqlConnection, SqlEngine};
use gridsql::engine::two_step::{MapQuery, ReduceQuery, TwoStepQuery};
use gridsql::engine::value::{ColumnMeta, Row, SortColumn, SqlType, SqlValue};
use gridsql::runtime::error::ReduceError;
use gridsql::runtime::merge_table::FakeTableRegistry;
use gridsql::runtime::partition_mapper::{
    CacheInfo, CacheMode, CacheRegistry, PartitionMapper, PartitionMapping,
};
use gridsql::runtime::reduce::ReduceQueryExecutor;
use gridsql::service::discovery::{
    ClusterDiscovery, ClusterEvent, ClusterEventBus, ClusterEventListener, NodeInfo,
};
use gridsql::service::messages::{
    DmlResponse, FailCode, FailResponse, MapRequest, NextPageResponse, ReduceMessage,
};
use gridsql::service::transport::{MapMessageHandler, Messaging};

pub fn node_id(n: i64) -> NodeId {
    UniqueId::new(n, n)
}

/// One in-memory grid: discovery view, transport recorder, scriptable
/// partition mapper, cache registry and a stub SQL engine sharing a single
/// fake-table registry with the executor under test.
pub struct TestGrid {
    pub local: NodeId,
    nodes: Mutex<HashMap<NodeId, NodeInfo>>,
    disconnected: AtomicBool,
    topology: AtomicU64,
    /// Remote deliveries, in send order.
    sent: Mutex<Vec<(NodeId, MapRequest)>>,
    /// Local-node bypass deliveries.
    local_sent: Mutex<Vec<MapRequest>>,
    /// Nodes whose remote sends fail.
    dead_links: Mutex<HashSet<NodeId>>,
    /// Scripted mapper answers; once drained the default mapping applies.
    mapper_script: Mutex<VecDeque<Option<PartitionMapping>>>,
    mapper_calls: AtomicUsize,
    mapping_nodes: Mutex<Vec<NodeId>>,
    caches: Mutex<HashMap<CacheId, CacheInfo>>,
    pub fake_tables: Arc<FakeTableRegistry>,
}

impl TestGrid {
    pub fn new(local: NodeId) -> Arc<Self> {
        let grid = Arc::new(Self {
            local,
            nodes: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
            topology: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            local_sent: Mutex::new(Vec::new()),
            dead_links: Mutex::new(HashSet::new()),
            mapper_script: Mutex::new(VecDeque::new()),
            mapper_calls: AtomicUsize::new(0),
            mapping_nodes: Mutex::new(Vec::new()),
            caches: Mutex::new(HashMap::new()),
            fake_tables: Arc::new(FakeTableRegistry::new()),
        });
        grid.add_node(local, NodeVersion::new(2, 7, 0));
        grid
    }

    pub fn add_node(&self, id: NodeId, version: NodeVersion) {
        self.nodes
            .lock()
            .unwrap()
            .insert(id, NodeInfo { id, version });
    }

    pub fn remove_node(&self, id: NodeId) {
        self.nodes.lock().unwrap().remove(&id);
    }

    pub fn add_cache(&self, id: CacheId, mode: CacheMode, parallelism: usize) {
        self.caches.lock().unwrap().insert(
            id,
            CacheInfo {
                id,
                name: format!("cache-{id}"),
                mode,
                query_parallelism: parallelism,
            },
        );
    }

    pub fn set_mapping_nodes(&self, nodes: Vec<NodeId>) {
        *self.mapping_nodes.lock().unwrap() = nodes;
    }

    pub fn script_mapper(&self, answers: Vec<Option<PartitionMapping>>) {
        self.mapper_script.lock().unwrap().extend(answers);
    }

    pub fn mapper_calls(&self) -> usize {
        self.mapper_calls.load(Ordering::SeqCst)
    }

    pub fn set_disconnected(&self, value: bool) {
        self.disconnected.store(value, Ordering::SeqCst);
    }

    pub fn fail_link(&self, node: NodeId) {
        self.dead_links.lock().unwrap().insert(node);
    }

    /// All recorded deliveries, remote first, then local bypass.
    pub fn all_sent(&self) -> Vec<(NodeId, MapRequest)> {
        let mut out = self.sent.lock().unwrap().clone();
        let local = self.local_sent.lock().unwrap().clone();
        out.extend(local.into_iter().map(|m| (self.local, m)));
        out
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len() + self.local_sent.lock().unwrap().len()
    }

    /// Query requests seen so far, keeping send order.
    pub fn query_requests(&self) -> Vec<(NodeId, gridsql::service::messages::QueryRequest)> {
        self.all_sent()
            .into_iter()
            .filter_map(|(n, m)| match m {
                MapRequest::Query(q) => Some((n, q)),
                _ => None,
            })
            .collect()
    }

    pub fn dml_requests(&self) -> Vec<(NodeId, gridsql::service::messages::DmlRequest)> {
        self.all_sent()
            .into_iter()
            .filter_map(|(n, m)| match m {
                MapRequest::Dml(d) => Some((n, d)),
                _ => None,
            })
            .collect()
    }

    /// Cancel broadcasts per request id, counted per node.
    pub fn cancel_counts(&self, request_id: u64) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for (node, msg) in self.all_sent() {
            if let MapRequest::Cancel(c) = msg {
                if c.request_id == request_id {
                    *counts.entry(node).or_insert(0) += 1;
                }
            }
        }
        counts
    }
}

impl Messaging for TestGrid {
    fn send(&self, node: NodeId, msg: MapRequest) -> Result<(), String> {
        if self.dead_links.lock().unwrap().contains(&node) {
            return Err(format!("connection refused: {node}"));
        }
        self.sent.lock().unwrap().push((node, msg));
        Ok(())
    }
}

impl MapMessageHandler for TestGrid {
    fn on_message(&self, _source: NodeId, msg: MapRequest) {
        self.local_sent.lock().unwrap().push(msg);
    }
}

impl ClusterDiscovery for TestGrid {
    fn local_node(&self) -> NodeInfo {
        self.nodes
            .lock()
            .unwrap()
            .get(&self.local)
            .cloned()
            .expect("local node")
    }

    fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    fn alive(&self, id: NodeId) -> bool {
        self.nodes.lock().unwrap().contains_key(&id)
    }

    fn client_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl PartitionMapper for TestGrid {
    fn nodes_for_partitions(
        &self,
        _cache_ids: &[CacheId],
        _topology_version: TopologyVersion,
        _partitions: Option<&[u32]>,
        _replicated_only: bool,
    ) -> Option<PartitionMapping> {
        self.mapper_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.mapper_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Some(PartitionMapping {
            nodes: self.mapping_nodes.lock().unwrap().clone(),
            partitions_map: None,
            query_partitions_map: None,
        })
    }
}

impl CacheRegistry for TestGrid {
    fn cache(&self, id: CacheId) -> Option<CacheInfo> {
        self.caches.lock().unwrap().get(&id).cloned()
    }
}

struct StubConnection {
    schema: String,
}

impl SqlConnection for StubConnection {
    fn schema(&self) -> &str {
        &self.schema
    }

    fn close_quiet(&self) {}
}

struct VecCursor {
    rows: VecDeque<Row>,
}

impl RowCursor for VecCursor {
    fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        Ok(self.rows.pop_front())
    }
}

impl SqlEngine for TestGrid {
    fn connection_for_thread(&self, schema: &str) -> Result<Arc<dyn SqlConnection>, ReduceError> {
        Ok(Arc::new(StubConnection {
            schema: schema.to_string(),
        }))
    }

    fn setup_connection(
        &self,
        _conn: &dyn SqlConnection,
        _distributed_joins: bool,
        _enforce_join_order: bool,
    ) {
    }

    /// Understands exactly the statements the reduce paths issue:
    /// `SELECT * FROM T___i`, `SELECT PLAN FROM T___i` and `EXPLAIN ...`.
    /// Merge tables are drained eagerly, as the engine seam requires.
    fn execute_query(
        &self,
        _conn: &dyn SqlConnection,
        sql: &str,
        _params: &[SqlValue],
        _timeout_millis: i64,
        _cancel: Option<&QueryCancel>,
    ) -> Result<Box<dyn RowCursor>, ReduceError> {
        if let Some(table) = sql
            .strip_prefix("SELECT * FROM ")
            .or_else(|| sql.strip_prefix("SELECT PLAN FROM "))
        {
            let shell = self
                .fake_tables
                .by_name(table.trim())
                .ok_or_else(|| ReduceError::Engine(format!("unknown table: {table}")))?;
            let tbl = shell
                .inner()
                .ok_or_else(|| ReduceError::Engine(format!("table has no merge data: {table}")))?;

            let mut cursor = tbl.open_cursor();
            let mut rows = VecDeque::new();
            while let Some(row) = cursor.next_row()? {
                rows.push_back(row);
            }
            return Ok(Box::new(VecCursor { rows }));
        }

        if let Some(stmt) = sql.strip_prefix("EXPLAIN ") {
            let mut rows = VecDeque::new();
            rows.push_back(vec![SqlValue::Str(format!("REDUCE PLAN: {stmt}"))]);
            return Ok(Box::new(VecCursor { rows }));
        }

        Err(ReduceError::Engine(format!("unsupported stub sql: {sql}")))
    }

    fn ready_topology_version(&self) -> TopologyVersion {
        TopologyVersion(self.topology.load(Ordering::SeqCst))
    }

    fn server_topology_changed(&self, _since: TopologyVersion) -> bool {
        false
    }

    fn locked_topology_version(&self) -> Option<TopologyVersion> {
        None
    }

    fn await_ready_topology_version(&self, ver: TopologyVersion) -> Result<(), ReduceError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while TopologyVersion(self.topology.load(Ordering::SeqCst)) < ver {
            if Instant::now() > deadline {
                return Err(ReduceError::Engine(format!(
                    "topology did not reach {ver} in time"
                )));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Simple synchronous event bus for wiring the executor's listener.
#[derive(Default)]
pub struct TestEventBus {
    listeners: Mutex<Vec<Arc<dyn ClusterEventListener>>>,
}

impl TestEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, evt: ClusterEvent) {
        let listeners = self.listeners.lock().unwrap().clone();
        for l in listeners {
            l.on_event(&evt);
        }
    }
}

impl ClusterEventBus for TestEventBus {
    fn subscribe(&self, listener: Arc<dyn ClusterEventListener>) {
        self.listeners.lock().unwrap().push(listener);
    }
}

pub fn executor(grid: &Arc<TestGrid>) -> Arc<ReduceQueryExecutor> {
    Arc::new(ReduceQueryExecutor::new(
        Arc::clone(grid) as Arc<dyn SqlEngine>,
        Arc::clone(grid) as Arc<dyn ClusterDiscovery>,
        Arc::clone(grid) as Arc<dyn CacheRegistry>,
        Arc::clone(grid) as Arc<dyn PartitionMapper>,
        Arc::clone(grid) as Arc<dyn Messaging>,
        Arc::clone(grid) as Arc<dyn MapMessageHandler>,
        Arc::clone(&grid.fake_tables),
    ))
}

/// A grid with the local node plus `remote` data nodes mapped for cache 1.
pub fn grid_with_remotes(remote: usize) -> (Arc<TestGrid>, Vec<NodeId>) {
    let grid = TestGrid::new(node_id(100));
    let mut nodes = Vec::new();
    for i in 0..remote {
        let id = node_id(1 + i as i64);
        grid.add_node(id, NodeVersion::new(2, 7, 0));
        nodes.push(id);
    }
    grid.add_cache(1, CacheMode::Partitioned, 1);
    grid.set_mapping_nodes(nodes.clone());
    (grid, nodes)
}

/// A single-map-query split over cache 1 reducing with `SELECT * FROM T___0`.
pub fn simple_split() -> TwoStepQuery {
    let map = MapQuery {
        query: "SELECT A FROM X".into(),
        partitioned: true,
        columns: vec![ColumnMeta::new("A", SqlType::Int, false)],
        sort_columns: Vec::new(),
        parameter_indexes: None,
    };
    let mut qry = TwoStepQuery::new(vec![1], vec![map]);
    qry.reduce_query = Some(ReduceQuery {
        query: "SELECT * FROM T___0".into(),
        parameter_indexes: None,
    });
    qry.page_size = 2;
    qry
}

pub fn int_rows(values: &[i32]) -> Vec<Row> {
    values.iter().map(|&v| vec![SqlValue::Int(v)]).collect()
}

pub fn page_response(
    request_id: u64,
    page_number: u64,
    values: &[i32],
    last: bool,
) -> ReduceMessage {
    ReduceMessage::NextPage(NextPageResponse {
        request_id,
        query_index: 0,
        segment: 0,
        page_number,
        rows: int_rows(values),
        last,
        retry: None,
        retry_cause: None,
        all_rows: None,
        remove_mapping: false,
    })
}

pub fn fail_response(request_id: u64, error: &str, fail_code: FailCode) -> ReduceMessage {
    ReduceMessage::Fail(FailResponse {
        request_id,
        error: error.to_string(),
        fail_code,
    })
}

pub fn dml_response(request_id: u64, updated: u64, error: Option<&str>) -> ReduceMessage {
    ReduceMessage::Dml(DmlResponse {
        request_id,
        updated,
        error: error.map(|s| s.to_string()),
    })
}

/// Polls `probe` until it yields, panicking after `timeout`.
pub fn wait_for<T>(timeout: Duration, what: &str, probe: impl Fn() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = probe() {
            return v;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Collects an iterator of row results into plain i32s, panicking on error.
pub fn collect_ints(iter: impl Iterator<Item = Result<Row, ReduceError>>) -> Vec<i32> {
    iter.map(|r| match r.expect("row")[0] {
        SqlValue::Int(v) => v,
        ref other => panic!("unexpected value: {other:?}"),
    })
    .collect()
}

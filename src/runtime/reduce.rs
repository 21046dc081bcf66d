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

//! The reduce query executor: plans the fan-out, dispatches map requests,
//! feeds paged results into merge indexes and drives the local reduce
//! statement, riding out topology churn through the retry loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::common::config;
use crate::common::types::{CacheId, NodeId, NodeVersion, UniqueId};
use crate::engine::context::{ReduceContextGuard, ReduceQueryContext};
use crate::engine::sql::{QueryCancel, RowCursor, SqlConnection, SqlEngine};
use crate::engine::tx::{MvccTracker, SelectForUpdateFuture, TxContext};
use crate::engine::two_step::TwoStepQuery;
use crate::engine::value::{Row, SqlValue};
use crate::gridsql_logging::{debug, error, warn};
use crate::runtime::error::ReduceError;
use crate::runtime::merge_index::{MergeIndex, UnsortedMergeIndex};
use crate::runtime::merge_table::{create_merge_table, merge_table_identifier, FakeTableRegistry};
use crate::runtime::page::{PageFetcher, ResultPage};
use crate::runtime::partition_mapper::{CacheInfo, CacheMode, CacheRegistry, PartitionMapper};
use crate::runtime::run::{DistributedUpdateRun, ReduceQueryRun, RunState, UpdateResult};
use crate::service::discovery::{ClusterDiscovery, ClusterEvent, ClusterEventBus, ClusterEventListener};
use crate::service::messages::{
    query_flags, DmlRequest, DmlResponse, FailCode, FailResponse, MapRequest, NextPageRequest,
    NextPageResponse, QueryCancelRequest, QueryRequest, QueryRequestEntry, ReduceMessage,
    SelectForUpdateTxDetails,
};
use crate::service::transport::{BusyLock, MapMessageHandler, MessageTransport, Messaging, Specializer};

/// Oldest map-node version that understands server-side DML.
pub const DML_SINCE: NodeVersion = NodeVersion::new(2, 3, 0);

/// Streaming result of a reduce query.
pub type QueryRowIter = Box<dyn Iterator<Item = Result<Row, ReduceError>> + Send>;

enum AttemptOutcome {
    Done(QueryRowIter),
    Retry,
}

pub(crate) struct ReducerInner {
    engine: Arc<dyn SqlEngine>,
    discovery: Arc<dyn ClusterDiscovery>,
    caches: Arc<dyn CacheRegistry>,
    mapper: Arc<dyn PartitionMapper>,
    transport: MessageTransport,
    fake_tables: Arc<FakeTableRegistry>,
    busy: BusyLock,
    qry_id_gen: AtomicU64,
    runs: Mutex<HashMap<u64, Arc<ReduceQueryRun>>>,
    upd_runs: Mutex<HashMap<u64, Arc<DistributedUpdateRun>>>,
}

/// Reduce-side coordinator of the two-step engine. One per node; runs are
/// tracked in registries keyed by request id.
pub struct ReduceQueryExecutor {
    inner: Arc<ReducerInner>,
}

impl ReduceQueryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn SqlEngine>,
        discovery: Arc<dyn ClusterDiscovery>,
        caches: Arc<dyn CacheRegistry>,
        mapper: Arc<dyn PartitionMapper>,
        messaging: Arc<dyn Messaging>,
        local_map_executor: Arc<dyn MapMessageHandler>,
        fake_tables: Arc<FakeTableRegistry>,
    ) -> Self {
        let local_node = discovery.local_node().id;
        Self {
            inner: Arc::new(ReducerInner {
                engine,
                discovery,
                caches,
                mapper,
                transport: MessageTransport::new(messaging, local_map_executor, local_node),
                fake_tables,
                busy: BusyLock::new(),
                qry_id_gen: AtomicU64::new(0),
                runs: Mutex::new(HashMap::new()),
                upd_runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribes the node-left / disconnect listener.
    pub fn start(&self, events: &dyn ClusterEventBus) {
        events.subscribe(Arc::new(ReducerEventListener {
            inner: Arc::clone(&self.inner),
        }));
    }

    /// Blocks message dispatch; in-flight handlers drain first.
    pub fn stop(&self) {
        self.inner.busy.block();
    }

    /// Inbound demultiplexer for map-side responses. Skips entirely once
    /// the executor is stopped.
    pub fn on_message(&self, node_id: NodeId, msg: ReduceMessage) {
        let Some(_busy) = self.inner.busy.enter_busy() else {
            return;
        };
        self.inner.on_message(node_id, msg);
    }

    /// Fails every active run with a client-disconnect error.
    pub fn on_disconnected(&self, detail: Option<String>) {
        self.inner.on_client_disconnected(detail);
    }

    /// Number of reduce runs currently tracked.
    pub fn active_query_count(&self) -> usize {
        self.inner.runs.lock().expect("runs lock").len()
    }

    /// Idempotent remote cleanup for a run; safe to call after the run is
    /// gone.
    pub fn release_remote_resources(
        &self,
        nodes: &[NodeId],
        request_id: u64,
        distributed_joins: bool,
        mvcc: Option<&dyn MvccTracker>,
    ) {
        match self.inner.run(request_id) {
            Some(run) => self.inner.release_remote_resources_run(
                nodes,
                &run,
                request_id,
                distributed_joins,
                mvcc,
            ),
            None => warn!("Query run was already removed: {request_id}"),
        }
    }

    /// Executes a split query and returns the streaming result iterator.
    /// Blocks until the reduce phase may begin (all first pages, or a
    /// terminal state).
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &self,
        schema: &str,
        qry: &TwoStepQuery,
        keep_binary: bool,
        enforce_join_order: bool,
        timeout_millis: i64,
        cancel: Arc<QueryCancel>,
        params: &[SqlValue],
        mut parts: Option<&[u32]>,
        lazy: bool,
        mut mvcc_tracker: Option<Arc<dyn MvccTracker>>,
        tx: Option<Arc<dyn TxContext>>,
        data_page_scan: Option<bool>,
    ) -> Result<QueryRowIter, ReduceError> {
        let inner = &self.inner;

        if qry.is_local {
            parts = None;
        }

        // Unexercised combination; the planner must not produce it.
        if qry.skip_merge_table && qry.explain {
            return Err(ReduceError::InvalidPlan(
                "EXPLAIN cannot be combined with a skip-merge-table plan".into(),
            ));
        }

        debug_assert!(!qry.mvcc_enabled || mvcc_tracker.is_some());

        let replicated_only = qry.replicated_only;
        let retry_timeout = config::sql_retry_timeout(timeout_millis);
        let start = Instant::now();
        let mut last_retry: Option<(NodeId, String)> = None;
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 && start.elapsed() > retry_timeout {
                let (node, cause) = match last_retry.take() {
                    Some((n, c)) => (Some(n), c),
                    None => (
                        None,
                        "partition mapping was not available within the retry timeout".to_string(),
                    ),
                };
                return Err(ReduceError::MappingFailed { node, cause });
            }

            if attempt != 0 {
                // Wait for the ongoing exchange to settle.
                thread::sleep(Duration::from_millis(u64::from(attempt) * 10));
            }

            // Partition pinning makes no sense over a purely replicated plan.
            if parts.is_some() {
                let mut all_replicated = true;
                for &cid in &qry.cache_ids {
                    let info = inner.caches.cache(cid).ok_or(ReduceError::CacheNotFound(cid))?;
                    if info.mode != CacheMode::Replicated {
                        all_replicated = false;
                        break;
                    }
                }
                if all_replicated {
                    return Err(ReduceError::ReplicatedPartitions);
                }
            }

            let (top_ver, client_first, sfu_fut) = if qry.for_update {
                let tx_ctx = tx.as_ref().ok_or_else(|| {
                    ReduceError::InvalidPlan(
                        "SELECT FOR UPDATE query requires an active transaction".into(),
                    )
                })?;
                let (v, client_first) = tx_ctx.topology_version_future().map_err(|e| {
                    ReduceError::MappingFailed {
                        node: None,
                        cause: format!("Failed to map SELECT FOR UPDATE query on topology: {e}"),
                    }
                })?;
                (v, client_first, Some(Arc::new(SelectForUpdateFuture::new())))
            } else {
                let v = inner.engine.ready_topology_version();
                // Retrying on a locked topology cannot succeed; tell the
                // caller to roll back.
                if inner.engine.server_topology_changed(v)
                    && inner.engine.locked_topology_version().is_some()
                {
                    return Err(ReduceError::TransactionalTopologyChanged);
                }
                (v, false, None)
            };

            let req_id = inner.qry_id_gen.fetch_add(1, Ordering::SeqCst) + 1;
            let conn = inner.engine.connection_for_thread(schema)?;
            let local_node = inner.discovery.local_node().id;

            let mut parts_map: Option<HashMap<NodeId, Vec<u32>>> = None;
            let mut qry_map: Option<HashMap<NodeId, Vec<u32>>> = None;

            let nodes: Vec<NodeId> = if qry.is_local {
                vec![local_node]
            } else {
                match inner.mapper.nodes_for_partitions(
                    &qry.cache_ids,
                    top_ver,
                    parts,
                    replicated_only,
                ) {
                    None => {
                        // Topology unstable: retry.
                        if let Some(f) = &sfu_fut {
                            f.on_done_ok(0);
                        }
                        attempt += 1;
                        continue;
                    }
                    Some(mapping) => {
                        let mut nodes = mapping.nodes;
                        parts_map = mapping.partitions_map;
                        qry_map = mapping.query_partitions_map;
                        debug_assert!(!nodes.is_empty());

                        if replicated_only || qry.explain {
                            // Always prefer the local node; otherwise pick a
                            // random data node to run on replicated data or
                            // to fetch the EXPLAIN plan from.
                            if nodes.contains(&local_node) {
                                nodes = vec![local_node];
                            } else {
                                let pick = rand::thread_rng().gen_range(0..nodes.len());
                                nodes = vec![nodes[pick]];
                            }
                        }
                        nodes
                    }
                }
            };

            if let Some(f) = &sfu_fut {
                if !f.is_failed() {
                    f.init(top_ver, &nodes);
                }
            }

            let page_size = if qry.page_size > 0 {
                qry.page_size
            } else {
                config::default_page_size()
            };

            let skip_merge = !qry.explain && qry.skip_merge_table;

            let segments_per_index: u32 = if qry.explain || replicated_only {
                1
            } else {
                find_first_partitioned(&*inner.caches, &qry.cache_ids)?
                    .query_parallelism
                    .max(1) as u32
            };

            let fetcher: Arc<dyn PageFetcher> = Arc::new(RunPageFetcher {
                inner: Arc::downgrade(inner),
                request_id: req_id,
            });

            let mut indexes: Vec<Arc<dyn MergeIndex>> = Vec::with_capacity(qry.map_queries.len());
            let mut pinned_nodes: Vec<Option<NodeId>> = vec![None; qry.map_queries.len()];
            let mut replicated_qrys = 0usize;

            for (i, map_qry) in qry.map_queries.iter().enumerate() {
                let idx: Arc<dyn MergeIndex> = if !skip_merge {
                    let tbl = create_merge_table(map_qry, qry.explain, Arc::clone(&fetcher), i)?;
                    let idx = tbl.merge_index();
                    inner.fake_tables.table(i).set_inner(Some(tbl));
                    idx
                } else {
                    Arc::new(UnsortedMergeIndex::dummy(Arc::clone(&fetcher), i))
                };

                if !map_qry.partitioned {
                    // A fragment over replicated tables runs on one node and
                    // one segment only.
                    let pick = rand::thread_rng().gen_range(0..nodes.len());
                    let node = nodes[pick];
                    pinned_nodes[i] = Some(node);
                    replicated_qrys += 1;
                    idx.set_sources(&[node], 1);
                } else {
                    idx.set_sources(&nodes, segments_per_index);
                }
                idx.set_page_size(page_size);
                indexes.push(idx);
            }

            let latch_count = if replicated_only {
                1
            } else {
                ((indexes.len() - replicated_qrys) * nodes.len() * segments_per_index as usize
                    + replicated_qrys) as u64
            };

            let run = Arc::new(ReduceQueryRun::new(
                Arc::clone(&conn),
                page_size,
                indexes,
                latch_count,
                sfu_fut.clone(),
                data_page_scan,
            ));

            inner
                .runs
                .lock()
                .expect("runs lock")
                .insert(req_id, Arc::clone(&run));

            let mut release = true;

            let attempt_result: Result<AttemptOutcome, ReduceError> = (|| {
                cancel.check_cancelled()?;

                if inner.discovery.client_disconnected() {
                    return Err(ReduceError::ClientDisconnected(Some(
                        "client node disconnected".into(),
                    )));
                }

                let queries: Vec<QueryRequestEntry> = qry
                    .map_queries
                    .iter()
                    .enumerate()
                    .map(|(i, mq)| QueryRequestEntry {
                        query: if qry.explain {
                            format!("EXPLAIN {}", mq.query)
                        } else {
                            mq.query.clone()
                        },
                        node: pinned_nodes[i],
                    })
                    .collect();

                let distributed_joins = qry.distributed_joins;

                {
                    let inner2 = Arc::clone(inner);
                    let run2 = Arc::clone(&run);
                    let nodes2 = nodes.clone();
                    cancel.set_handler(Box::new(move || {
                        inner2.send_cancel_once(&run2, &nodes2, req_id);
                    }))?;
                }

                // Join order is always enforced on the map side so plans stay
                // deterministic across nodes.
                let mut flags = query_flags::ENFORCE_JOIN_ORDER;
                if distributed_joins {
                    flags |= query_flags::DISTRIBUTED_JOINS;
                }
                if qry.is_local {
                    flags |= query_flags::IS_LOCAL;
                }
                if qry.explain {
                    flags |= query_flags::EXPLAIN;
                }
                if replicated_only {
                    flags |= query_flags::REPLICATED;
                }
                if lazy && qry.map_queries.len() == 1 {
                    flags |= query_flags::LAZY;
                }
                let flags = query_flags::set_data_page_scan(flags, data_page_scan);

                let mvcc_snapshot = tx
                    .as_ref()
                    .and_then(|t| t.mvcc_snapshot())
                    .or_else(|| mvcc_tracker.as_ref().and_then(|t| t.snapshot()));

                let req = QueryRequest {
                    request_id: req_id,
                    topology_version: top_ver,
                    page_size,
                    caches: qry.cache_ids.clone(),
                    tables: if distributed_joins {
                        Some(qry.tables.clone())
                    } else {
                        None
                    },
                    partitions: parts_map.clone(),
                    query_partitions: None,
                    queries,
                    parameters: params.to_vec(),
                    flags,
                    timeout_millis,
                    schema: schema.to_string(),
                    mvcc_snapshot,
                    tx_details: None,
                };

                let sfu_counter = AtomicU32::new(0);
                let qry_map_ref = qry_map.as_ref();
                let tx_for_spec = if qry.for_update { tx.as_ref() } else { None };
                let specializer = move |node: NodeId, msg: &MapRequest| -> MapRequest {
                    let MapRequest::Query(q) = msg else {
                        return msg.clone();
                    };
                    let mut q = q.clone();
                    if let Some(map) = qry_map_ref {
                        q.query_partitions = map.get(&node).cloned();
                    }
                    if let Some(tx_ctx) = tx_for_spec {
                        q.tx_details = Some(SelectForUpdateTxDetails {
                            thread_id: tx_ctx.thread_id(),
                            version: UniqueId::random(),
                            operation_counter: sfu_counter.fetch_add(1, Ordering::SeqCst) + 1,
                            subject_id: tx_ctx.subject_id(),
                            xid: tx_ctx.xid(),
                            task_name_hash: tx_ctx.task_name_hash(),
                            client_first,
                            timeout_millis: tx_ctx.remaining_time(),
                        });
                    }
                    MapRequest::Query(q)
                };
                let spec: Option<Specializer<'_>> = if parts.is_some() || qry.for_update {
                    Some(&specializer)
                } else {
                    None
                };

                let mut retry = false;

                if inner
                    .transport
                    .send_to_nodes(&nodes, &MapRequest::Query(req), spec, false)
                {
                    inner.await_all_replies(&run, &nodes, &cancel)?;

                    if run.has_error_or_retry() {
                        if let Some(err) = run.exception() {
                            if err.is_client_disconnect() {
                                return Err(err);
                            }
                            if err.was_cancelled() {
                                return Err(ReduceError::Cancelled);
                            }
                            return Err(err);
                        }

                        // A mapper saw a stale partition map; wait for our
                        // topology to catch up, then go again.
                        if let Some(retry_ver) = run.retry_topology_version() {
                            inner.engine.await_ready_topology_version(retry_ver)?;
                        }
                        retry = true;
                    }
                } else {
                    // Send failed: retriable.
                    retry = true;
                }

                if retry {
                    return Ok(AttemptOutcome::Retry);
                }

                let res_iter: QueryRowIter = if skip_merge {
                    // Remote resources now belong to the iterator.
                    release = false;
                    Box::new(MergeStreamIterator::new(
                        Arc::clone(inner),
                        nodes.clone(),
                        Arc::clone(&run),
                        req_id,
                        distributed_joins,
                        mvcc_tracker.take(),
                    ))
                } else {
                    cancel.check_cancelled()?;

                    inner.engine.setup_connection(&*conn, false, enforce_join_order);

                    let _ctx = ReduceContextGuard::set(ReduceQueryContext {
                        local_node,
                        request_id: req_id,
                        page_size,
                        keep_binary,
                    });

                    if qry.explain {
                        let rows = inner.explain_plan(&*conn, qry, params, &fetcher)?;
                        Box::new(rows.into_iter().map(Ok::<Row, ReduceError>))
                    } else {
                        let rdc = qry.reduce_query.as_ref().ok_or_else(|| {
                            ReduceError::InvalidPlan("two-step plan without a reduce query".into())
                        })?;

                        let cursor = inner.engine.execute_query(
                            &*conn,
                            &rdc.query,
                            &rdc.parameters(params),
                            timeout_millis,
                            Some(&cancel),
                        )?;

                        // The tracker now belongs to the iterator.
                        Box::new(FieldsIterator::new(cursor, mvcc_tracker.take()))
                    }
                };

                if let Some(f) = &sfu_fut {
                    f.get()?;
                }

                Ok(AttemptOutcome::Done(res_iter))
            })();

            if release {
                inner.release_remote_resources_run(
                    &nodes,
                    &run,
                    req_id,
                    qry.distributed_joins,
                    mvcc_tracker.as_deref(),
                );

                if !skip_merge {
                    // Drop all merge tables; the shells stay for reuse.
                    for i in 0..qry.map_queries.len() {
                        inner.fake_tables.reset_slot(i);
                    }
                }
            }

            match attempt_result {
                Ok(AttemptOutcome::Done(it)) => return Ok(it),
                Ok(AttemptOutcome::Retry) => {
                    // Send failures leave no retry cause; keep the last one.
                    if let Some(info) = run.retry_info() {
                        last_retry = Some(info);
                    }
                    if let Some(f) = &sfu_fut {
                        f.on_done_ok(0);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    run.connection().close_quiet();
                    let err = normalize_failure(err);
                    if let Some(f) = &sfu_fut {
                        f.on_done_err(err.clone());
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Fans a DML statement out to the data nodes and aggregates affected
    /// row counts. Returns `None` when some mapped node predates server-side
    /// DML and the caller must fall back to client-side execution.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        schema: &str,
        cache_ids: &[CacheId],
        select_query: &str,
        params: &[SqlValue],
        enforce_join_order: bool,
        page_size: usize,
        timeout_millis: i64,
        parts: Option<&[u32]>,
        replicated_only: bool,
        cancel: Arc<QueryCancel>,
    ) -> Result<Option<UpdateResult>, ReduceError> {
        let inner = &self.inner;

        let top_ver = inner.engine.ready_topology_version();
        let req_id = inner.qry_id_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let local_node = inner.discovery.local_node().id;

        // No retry loop here: an unstable topology fails the update.
        let mapping = inner
            .mapper
            .nodes_for_partitions(cache_ids, top_ver, parts, replicated_only)
            .ok_or_else(|| ReduceError::MappingFailed {
                node: None,
                cause: "Failed to determine nodes participating in the update \
                        (retry update once topology recovers)"
                    .into(),
            })?;

        let mut nodes = mapping.nodes;
        if replicated_only {
            if nodes.contains(&local_node) {
                nodes = vec![local_node];
            } else {
                let pick = rand::thread_rng().gen_range(0..nodes.len());
                nodes = vec![nodes[pick]];
            }
        }

        for &node in &nodes {
            let ver = inner.discovery.node(node).map(|n| n.version);
            if !ver.map(|v| v.at_least(DML_SINCE)).unwrap_or(false) {
                warn!(
                    "Server-side DML optimization is skipped because map node does not support it. \
                     Falling back to normal DML. [node={node}, v={ver:?}]"
                );
                return Ok(None);
            }
        }

        let run = Arc::new(DistributedUpdateRun::new(nodes.len()));

        let mut flags = if enforce_join_order {
            query_flags::ENFORCE_JOIN_ORDER
        } else {
            0
        };
        if replicated_only {
            flags |= query_flags::REPLICATED;
        }

        let req = DmlRequest {
            request_id: req_id,
            topology_version: top_ver,
            caches: cache_ids.to_vec(),
            schema: schema.to_string(),
            query: select_query.to_string(),
            page_size,
            query_partitions: None,
            parameters: params.to_vec(),
            flags,
            timeout_millis,
        };

        inner
            .upd_runs
            .lock()
            .expect("upd runs lock")
            .insert(req_id, Arc::clone(&run));

        // Explicit partitions specialize per recipient; per-query partitions
        // win over the reservation map.
        let parts_map = mapping.query_partitions_map.or(mapping.partitions_map);

        let result: Result<UpdateResult, ReduceError> = (|| {
            {
                let inner2 = Arc::clone(inner);
                let run2 = Arc::clone(&run);
                let nodes2 = nodes.clone();
                cancel.set_handler(Box::new(move || {
                    run2.future().on_done(Err(ReduceError::Cancelled));
                    inner2.send_cancel(&nodes2, req_id);
                }))?;
            }

            let specializer = |node: NodeId, msg: &MapRequest| -> MapRequest {
                let MapRequest::Dml(d) = msg else {
                    return msg.clone();
                };
                let mut d = d.clone();
                if let Some(map) = parts_map.as_ref() {
                    d.query_partitions = map.get(&node).cloned();
                }
                MapRequest::Dml(d)
            };
            let spec: Option<Specializer<'_>> = if parts.is_some() {
                Some(&specializer)
            } else {
                None
            };

            if inner
                .transport
                .send_to_nodes(&nodes, &MapRequest::Dml(req), spec, false)
            {
                run.future().get()
            } else {
                Err(ReduceError::Engine(
                    "Failed to send update request to participating nodes".into(),
                ))
            }
        })();

        if result.is_err() {
            error!("Error during update [localNodeId={local_node}]");
            inner.send_cancel(&nodes, req_id);
        }

        if inner
            .upd_runs
            .lock()
            .expect("upd runs lock")
            .remove(&req_id)
            .is_none()
        {
            warn!("Update run was already removed: {req_id}");
        }

        result.map(Some)
    }
}

impl ReducerInner {
    fn run(&self, request_id: u64) -> Option<Arc<ReduceQueryRun>> {
        self.runs
            .lock()
            .expect("runs lock")
            .get(&request_id)
            .cloned()
    }

    fn upd_run(&self, request_id: u64) -> Option<Arc<DistributedUpdateRun>> {
        self.upd_runs
            .lock()
            .expect("upd runs lock")
            .get(&request_id)
            .cloned()
    }

    fn on_message(&self, node_id: NodeId, msg: ReduceMessage) {
        // Messages from already-departed nodes are dropped.
        if self.discovery.node(node_id).is_none() {
            return;
        }

        let req_id = msg.request_id();

        match msg {
            ReduceMessage::NextPage(m) => self.on_next_page(node_id, m),
            ReduceMessage::Fail(m) => self.on_fail(node_id, &m),
            ReduceMessage::Dml(m) => self.on_dml_response(node_id, &m),
        }

        debug!(
            "Processed response: {} -> {} [reqId={}]",
            node_id,
            self.transport.local_node(),
            req_id
        );
    }

    fn on_next_page(&self, node: NodeId, msg: NextPageResponse) {
        // Run already finished with an error or was cancelled.
        let Some(run) = self.run(msg.request_id) else {
            return;
        };

        let Some(idx) = run.index(msg.query_index).cloned() else {
            self.fail_run(
                msg.request_id,
                node,
                &format!("Unknown map query index: {}", msg.query_index),
                FailCode::General,
            );
            return;
        };

        let page = ResultPage {
            source: node,
            segment: msg.segment,
            page_number: msg.page_number,
            rows: msg.rows,
            last: msg.last,
        };

        if let Err(e) = idx.add_page(page) {
            error!("Error in message: {e}");
            self.fail_run(msg.request_id, node, "Error in message.", FailCode::General);
            return;
        }

        if let Some(retry_ver) = msg.retry {
            run.set_state_on_retry(node, retry_ver, msg.retry_cause);
        } else if msg.page_number == 0 {
            // Count down on each first page received.
            run.latch().count_down();

            if let Some(sfu) = run.select_for_update_future() {
                sfu.on_result(node, msg.all_rows.unwrap_or(0), msg.remove_mapping);
            }
        }
    }

    fn on_fail(&self, node: NodeId, msg: &FailResponse) {
        self.fail_run(msg.request_id, node, &msg.error, msg.fail_code);
    }

    fn fail_run(&self, request_id: u64, node: NodeId, detail: &str, code: FailCode) {
        let Some(run) = self.run(request_id) else {
            return;
        };
        let err = ReduceError::MapFailed {
            node,
            detail: detail.to_string(),
            cancelled: code == FailCode::CancelledByOriginator,
        };
        run.set_state_on_exception(Some(node), err);
    }

    fn on_dml_response(&self, node: NodeId, msg: &DmlResponse) {
        let Some(run) = self.upd_run(msg.request_id) else {
            warn!(
                "Unexpected dml response (will ignore). [localNodeId={}, nodeId={}, reqId={}]",
                self.transport.local_node(),
                node,
                msg.request_id
            );
            return;
        };
        run.handle_response(node, msg.updated, msg.error.as_deref());
    }

    /// Blocks on the run's first-page latch, polling for liveness: a dead
    /// target converts the run to a retry and forces the latch.
    fn await_all_replies(
        &self,
        run: &Arc<ReduceQueryRun>,
        nodes: &[NodeId],
        cancel: &QueryCancel,
    ) -> Result<(), ReduceError> {
        while !run.latch().await_timeout(config::reply_poll_interval()) {
            cancel.check_cancelled()?;

            for &node in nodes {
                if !self.discovery.alive(node) {
                    self.handle_node_left(run, node);
                    debug_assert_eq!(run.latch().count(), 0);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handle_node_left(&self, run: &Arc<ReduceQueryRun>, node: NodeId) {
        run.set_state_on_node_leave(node, self.engine.ready_topology_version());
    }

    fn on_node_left(&self, node: NodeId) {
        let runs: Vec<Arc<ReduceQueryRun>> = self
            .runs
            .lock()
            .expect("runs lock")
            .values()
            .cloned()
            .collect();

        for run in runs {
            if run.indexes().iter().any(|idx| idx.has_source(node)) {
                self.handle_node_left(&run, node);
            }
        }

        let upd_runs: Vec<Arc<DistributedUpdateRun>> = self
            .upd_runs
            .lock()
            .expect("upd runs lock")
            .values()
            .cloned()
            .collect();

        for run in upd_runs {
            run.handle_node_left(node);
        }
    }

    fn on_client_disconnected(&self, detail: Option<String>) {
        let err = ReduceError::ClientDisconnected(detail);

        let runs: Vec<Arc<ReduceQueryRun>> = self
            .runs
            .lock()
            .expect("runs lock")
            .values()
            .cloned()
            .collect();

        for run in runs {
            run.disconnected(err.clone());
        }

        let upd_runs: Vec<Arc<DistributedUpdateRun>> = self
            .upd_runs
            .lock()
            .expect("upd runs lock")
            .values()
            .cloned()
            .collect();

        for run in upd_runs {
            run.handle_disconnect(err.clone());
        }
    }

    fn send_cancel(&self, nodes: &[NodeId], request_id: u64) {
        let msg = MapRequest::Cancel(QueryCancelRequest { request_id });
        self.transport.send_to_nodes(nodes, &msg, None, false);
    }

    /// Broadcasts the cancel request for a run at most once.
    fn send_cancel_once(&self, run: &ReduceQueryRun, nodes: &[NodeId], request_id: u64) {
        if !run.mark_cancel_sent() {
            return;
        }
        self.send_cancel(nodes, request_id);
    }

    fn release_remote_resources_run(
        &self,
        nodes: &[NodeId],
        run: &Arc<ReduceQueryRun>,
        request_id: u64,
        distributed_joins: bool,
        mvcc: Option<&dyn MvccTracker>,
    ) {
        // Distributed joins always need a cancel to clean up remote
        // resources; otherwise only unread streams do.
        if distributed_joins || run.indexes().iter().any(|idx| !idx.fetched_all()) {
            self.send_cancel_once(run, nodes, request_id);
        }

        if self
            .runs
            .lock()
            .expect("runs lock")
            .remove(&request_id)
            .is_none()
        {
            warn!("Query run was already removed: {request_id}");
        } else if let Some(tracker) = mvcc {
            tracker.on_done();
        }
    }

    /// EXPLAIN path: one plan row per map table, then the reduce plan over
    /// freshly bound merge tables.
    fn explain_plan(
        &self,
        conn: &dyn SqlConnection,
        qry: &TwoStepQuery,
        params: &[SqlValue],
        fetcher: &Arc<dyn PageFetcher>,
    ) -> Result<Vec<Row>, ReduceError> {
        let mut out = Vec::with_capacity(qry.map_queries.len() + 1);

        for i in 0..qry.map_queries.len() {
            let sql = format!("SELECT PLAN FROM {}", merge_table_identifier(i));
            let mut cur = self.engine.execute_query(conn, &sql, &[], 0, None)?;
            out.push(vec![plan_value(cur.next_row()?)?]);
        }

        // The map tables carried the PLAN column; rebind tables with the
        // real column shapes before explaining the reduce fragment.
        for (i, mq) in qry.map_queries.iter().enumerate() {
            let tbl = create_merge_table(mq, false, Arc::clone(fetcher), i)?;
            self.fake_tables.table(i).set_inner(Some(tbl));
        }

        let rdc = qry.reduce_query.as_ref().ok_or_else(|| {
            ReduceError::InvalidPlan("two-step plan without a reduce query".into())
        })?;

        let mut cur = self.engine.execute_query(
            conn,
            &format!("EXPLAIN {}", rdc.query),
            &rdc.parameters(params),
            0,
            None,
        )?;
        out.push(vec![plan_value(cur.next_row()?)?]);

        Ok(out)
    }
}

fn plan_value(row: Option<Row>) -> Result<SqlValue, ReduceError> {
    let row = row.ok_or_else(|| ReduceError::Engine("explain returned no plan".into()))?;
    row.into_iter()
        .next()
        .ok_or_else(|| ReduceError::Engine("explain returned an empty row".into()))
}

fn find_first_partitioned(
    caches: &dyn CacheRegistry,
    cache_ids: &[CacheId],
) -> Result<CacheInfo, ReduceError> {
    for (i, &cid) in cache_ids.iter().enumerate() {
        let info = caches.cache(cid).ok_or(ReduceError::CacheNotFound(cid))?;

        if i == 0 && info.mode == CacheMode::Local {
            return Err(ReduceError::InvalidPlan(format!(
                "Cache is LOCAL: {}",
                info.name
            )));
        }

        if info.mode == CacheMode::Partitioned {
            return Ok(info);
        }
    }

    Err(ReduceError::InvalidPlan(
        "failed to find a partitioned cache".into(),
    ))
}

fn normalize_failure(err: ReduceError) -> ReduceError {
    if err.is_client_disconnect() {
        return err;
    }
    if err.was_cancelled() {
        return ReduceError::Cancelled;
    }
    match err {
        ReduceError::Engine(detail) => ReduceError::LocalExecution { detail },
        ReduceError::FetchFailed { node } => ReduceError::LocalExecution {
            detail: format!("failed to fetch data from node {node}"),
        },
        other => other,
    }
}

/// Pulls the successor of an exhausted page. Captures only the request id;
/// a released run makes the fetch a no-op, a terminal or retrying run makes
/// it raise.
struct RunPageFetcher {
    inner: Weak<ReducerInner>,
    request_id: u64,
}

impl PageFetcher for RunPageFetcher {
    fn fetch_next_page(
        &self,
        node: NodeId,
        query_index: usize,
        segment: u32,
    ) -> Result<(), ReduceError> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let Some(run) = inner.run(self.request_id) else {
            return Ok(());
        };

        match run.state_snapshot() {
            RunState::Running => {}
            RunState::Failed(e) | RunState::Disconnected(e) => return Err(e),
            RunState::Retry { cause, .. } => return Err(ReduceError::RetryRequired { cause }),
        }

        let msg = MapRequest::NextPage(NextPageRequest {
            request_id: self.request_id,
            query_index,
            segment,
            page_size: run.page_size(),
            flags: query_flags::set_data_page_scan(0, run.data_page_scan()),
        });

        if inner.transport.send_to_nodes(&[node], &msg, None, false) {
            Ok(())
        } else {
            Err(ReduceError::FetchFailed { node })
        }
    }
}

struct ReducerEventListener {
    inner: Arc<ReducerInner>,
}

impl ClusterEventListener for ReducerEventListener {
    fn on_event(&self, evt: &ClusterEvent) {
        let Some(_busy) = self.inner.busy.enter_busy() else {
            return;
        };
        match evt {
            ClusterEvent::NodeLeft(node) | ClusterEvent::NodeFailed(node) => {
                self.inner.on_node_left(*node);
            }
            ClusterEvent::ClientDisconnected => {
                self.inner.on_client_disconnected(None);
            }
        }
    }
}

/// Result iterator of the skip-merge-table fast path: drains the merge
/// indexes one after another and releases remote resources when it finishes,
/// fails, or is dropped.
struct MergeStreamIterator {
    inner: Arc<ReducerInner>,
    nodes: Vec<NodeId>,
    run: Arc<ReduceQueryRun>,
    request_id: u64,
    distributed_joins: bool,
    mvcc: Option<Arc<dyn MvccTracker>>,
    remaining: VecDeque<Arc<dyn MergeIndex>>,
    current: Option<Box<dyn RowCursor>>,
    released: bool,
}

impl MergeStreamIterator {
    fn new(
        inner: Arc<ReducerInner>,
        nodes: Vec<NodeId>,
        run: Arc<ReduceQueryRun>,
        request_id: u64,
        distributed_joins: bool,
        mvcc: Option<Arc<dyn MvccTracker>>,
    ) -> Self {
        let remaining = run.indexes().iter().cloned().collect();
        Self {
            inner,
            nodes,
            run,
            request_id,
            distributed_joins,
            mvcc,
            remaining,
            current: None,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner.release_remote_resources_run(
            &self.nodes,
            &self.run,
            self.request_id,
            self.distributed_joins,
            self.mvcc.as_deref(),
        );
        self.mvcc = None;
    }
}

impl Iterator for MergeStreamIterator {
    type Item = Result<Row, ReduceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.released {
            return None;
        }

        loop {
            if let Some(cursor) = self.current.as_mut() {
                match cursor.next_row() {
                    Ok(Some(row)) => return Some(Ok(row)),
                    Ok(None) => {
                        self.current = None;
                    }
                    Err(e) => {
                        self.release();
                        return Some(Err(e));
                    }
                }
            }

            match self.remaining.pop_front() {
                Some(idx) => self.current = Some(idx.open_cursor()),
                None => {
                    self.release();
                    return None;
                }
            }
        }
    }
}

impl Drop for MergeStreamIterator {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wraps the engine result set of the reduce statement; owns the MVCC
/// tracker and signals it done exactly once.
struct FieldsIterator {
    cursor: Box<dyn RowCursor>,
    mvcc: Option<Arc<dyn MvccTracker>>,
    done: bool,
}

impl FieldsIterator {
    fn new(cursor: Box<dyn RowCursor>, mvcc: Option<Arc<dyn MvccTracker>>) -> Self {
        Self {
            cursor,
            mvcc,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(tracker) = self.mvcc.take() {
            tracker.on_done();
        }
    }
}

impl Iterator for FieldsIterator {
    type Item = Result<Row, ReduceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

impl Drop for FieldsIterator {
    fn drop(&mut self) {
        if !self.done {
            self.finish();
        }
    }
}

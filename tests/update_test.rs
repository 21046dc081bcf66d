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
//! Distributed DML fan-out scenarios.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gridsql::common::types::NodeVersion;
use gridsql::engine::sql::QueryCancel;
use gridsql::runtime::error::ReduceError;
use gridsql::runtime::partition_mapper::CacheMode;
use gridsql::runtime::reduce::ReduceQueryExecutor;

use crate::common::{dml_response, executor, grid_with_remotes, node_id, wait_for, TestGrid};

mod common;

fn spawn_update(
    exec: Arc<ReduceQueryExecutor>,
    cancel: Arc<QueryCancel>,
) -> thread::JoinHandle<Result<Option<gridsql::UpdateResult>, ReduceError>> {
    thread::spawn(move || {
        exec.update(
            "PUBLIC",
            &[1],
            "UPDATE X SET A = A + 1",
            &[],
            false,
            1024,
            0,
            None,
            false,
            cancel,
        )
    })
}

#[test]
fn dml_falls_back_when_a_node_is_too_old() {
    let grid = TestGrid::new(node_id(100));
    let old = node_id(1);
    grid.add_node(old, NodeVersion::new(2, 2, 9));
    grid.add_cache(1, CacheMode::Partitioned, 1);
    grid.set_mapping_nodes(vec![old]);

    let exec = executor(&grid);
    let res = exec
        .update(
            "PUBLIC",
            &[1],
            "UPDATE X SET A = A + 1",
            &[],
            false,
            1024,
            0,
            None,
            false,
            Arc::new(QueryCancel::new()),
        )
        .expect("update call");

    // Fallback sentinel, and nothing was dispatched.
    assert!(res.is_none());
    assert!(grid.dml_requests().is_empty());
    assert_eq!(grid.sent_count(), 0);
}

#[test]
fn dml_aggregates_per_node_counts() {
    let (grid, nodes) = grid_with_remotes(2);
    let exec = executor(&grid);

    let handle = spawn_update(Arc::clone(&exec), Arc::new(QueryCancel::new()));

    let req_id = wait_for(Duration::from_secs(5), "dml dispatch", || {
        let reqs = grid.dml_requests();
        (reqs.len() == 2).then(|| reqs[0].1.request_id)
    });

    exec.on_message(nodes[0], dml_response(req_id, 3, None));
    exec.on_message(nodes[1], dml_response(req_id, 4, None));

    let res = handle
        .join()
        .expect("update thread")
        .expect("update result")
        .expect("no fallback");
    assert_eq!(res.updated, 7);
}

#[test]
fn dml_node_error_fails_the_update() {
    let (grid, nodes) = grid_with_remotes(2);
    let exec = executor(&grid);

    let handle = spawn_update(Arc::clone(&exec), Arc::new(QueryCancel::new()));

    let req_id = wait_for(Duration::from_secs(5), "dml dispatch", || {
        let reqs = grid.dml_requests();
        (reqs.len() == 2).then(|| reqs[0].1.request_id)
    });

    exec.on_message(nodes[0], dml_response(req_id, 0, Some("constraint violation")));

    let err = handle
        .join()
        .expect("update thread")
        .expect_err("failed update");
    assert!(matches!(err, ReduceError::MapFailed { .. }), "got {err:?}");

    // The failed update broadcast a cancel while releasing.
    let counts = grid.cancel_counts(req_id);
    assert!(counts.values().all(|&c| c >= 1));
}

#[test]
fn dml_unstable_mapping_fails_immediately() {
    let (grid, _nodes) = grid_with_remotes(1);
    grid.script_mapper(vec![None]);
    let exec = executor(&grid);

    let err = exec
        .update(
            "PUBLIC",
            &[1],
            "UPDATE X SET A = A + 1",
            &[],
            false,
            1024,
            0,
            None,
            false,
            Arc::new(QueryCancel::new()),
        )
        .expect_err("mapping unavailable");

    // DML has no retry loop.
    assert!(matches!(err, ReduceError::MappingFailed { .. }));
    assert_eq!(grid.mapper_calls(), 1);
    assert_eq!(grid.sent_count(), 0);
}

#[test]
fn unknown_dml_response_is_ignored() {
    let (grid, nodes) = grid_with_remotes(1);
    let exec = executor(&grid);

    exec.on_message(nodes[0], dml_response(987_654, 5, None));
    assert_eq!(grid.sent_count(), 0);
}

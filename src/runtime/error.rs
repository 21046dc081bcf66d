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
use thiserror::Error;

use crate::common::types::{CacheId, NodeId};

/// Everything the reduce coordinator can fail with.
#[derive(Clone, Debug, Error)]
pub enum ReduceError {
    /// The retry loop ran out of budget chasing an unstable topology.
    #[error("Failed to map SQL query to topology on data node [dataNodeId={node:?}, msg={cause}]")]
    MappingFailed {
        node: Option<NodeId>,
        cause: String,
    },

    /// Cancelled by the caller or reported cancelled-by-originator by a
    /// mapper.
    #[error("The query was cancelled while executing")]
    Cancelled,

    /// A mapper node reported a failure.
    #[error("Failed to execute map query on remote node [nodeId={node}, errMsg={detail}]")]
    MapFailed {
        node: NodeId,
        detail: String,
        /// True when the map side reported cancelled-by-originator; the
        /// orchestrator re-raises such failures as [`ReduceError::Cancelled`].
        cancelled: bool,
    },

    /// A tracked source departed or a mapper asked for a retry; the current
    /// attempt is abandoned, not the query.
    #[error("Query retry required: {cause}")]
    RetryRequired { cause: String },

    #[error("Query was cancelled, client node disconnected{}", detail_suffix(.0))]
    ClientDisconnected(Option<String>),

    #[error("Server topology is changed during query execution inside a transaction. \
             It's recommended to rollback and retry transaction.")]
    TransactionalTopologyChanged,

    #[error("Partitions are not supported for replicated caches")]
    ReplicatedPartitions,

    #[error("Cache not found on local node (was concurrently destroyed?) [cacheId={0}]")]
    CacheNotFound(CacheId),

    #[error("Failed to fetch data from node: {node}")]
    FetchFailed { node: NodeId },

    #[error("Failed to run reduce query locally: {detail}")]
    LocalExecution { detail: String },

    #[error("Invalid two-step plan: {0}")]
    InvalidPlan(String),

    /// Failure surfaced by the host SQL engine or another external seam.
    #[error("{0}")]
    Engine(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

impl ReduceError {
    /// True when the error is a cancellation or carries one as its
    /// suppressed cause.
    pub fn was_cancelled(&self) -> bool {
        matches!(
            self,
            ReduceError::Cancelled | ReduceError::MapFailed { cancelled: true, .. }
        )
    }

    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, ReduceError::ClientDisconnected(_))
    }
}

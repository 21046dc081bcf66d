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
use std::collections::HashMap;

use crate::common::types::{CacheId, NodeId, TopologyVersion};

/// Result of mapping a query onto the current topology.
#[derive(Clone, Debug)]
pub struct PartitionMapping {
    pub nodes: Vec<NodeId>,
    /// Per-node partition reservations for the whole mapping.
    pub partitions_map: Option<HashMap<NodeId, Vec<u32>>>,
    /// Per-node partitions each node should actually query; present when the
    /// caller pinned explicit partitions.
    pub query_partitions_map: Option<HashMap<NodeId, Vec<u32>>>,
}

/// External partition mapper. `None` means the topology is currently
/// unstable and the caller should retry.
pub trait PartitionMapper: Send + Sync {
    fn nodes_for_partitions(
        &self,
        cache_ids: &[CacheId],
        topology_version: TopologyVersion,
        partitions: Option<&[u32]>,
        replicated_only: bool,
    ) -> Option<PartitionMapping>;
}

/// Cache deployment mode, as far as reduce planning cares.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheMode {
    Partitioned,
    Replicated,
    Local,
}

#[derive(Clone, Debug)]
pub struct CacheInfo {
    pub id: CacheId,
    pub name: String,
    pub mode: CacheMode,
    /// Parallel query lanes per node for this cache.
    pub query_parallelism: usize,
}

/// Lookup of cache metadata by id.
pub trait CacheRegistry: Send + Sync {
    fn cache(&self, id: CacheId) -> Option<CacheInfo>;
}

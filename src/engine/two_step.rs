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
use crate::common::types::CacheId;
use crate::engine::value::{ColumnMeta, SortColumn, SqlValue};

/// One map fragment of a split query, executed on every data-owning node
/// over its local shard.
#[derive(Clone, Debug)]
pub struct MapQuery {
    pub query: String,
    /// False for fragments touching only replicated caches; such fragments
    /// run on a single node.
    pub partitioned: bool,
    pub columns: Vec<ColumnMeta>,
    pub sort_columns: Vec<SortColumn>,
    /// Which of the caller's parameters this fragment consumes; `None`
    /// means all of them.
    pub parameter_indexes: Option<Vec<usize>>,
}

impl MapQuery {
    pub fn parameters(&self, all: &[SqlValue]) -> Vec<SqlValue> {
        select_parameters(&self.parameter_indexes, all)
    }
}

/// The final fragment executed on the originator over the merge tables.
#[derive(Clone, Debug)]
pub struct ReduceQuery {
    pub query: String,
    pub parameter_indexes: Option<Vec<usize>>,
}

impl ReduceQuery {
    pub fn parameters(&self, all: &[SqlValue]) -> Vec<SqlValue> {
        select_parameters(&self.parameter_indexes, all)
    }
}

fn select_parameters(indexes: &Option<Vec<usize>>, all: &[SqlValue]) -> Vec<SqlValue> {
    match indexes {
        None => all.to_vec(),
        Some(idxs) => idxs
            .iter()
            .map(|&i| all.get(i).cloned().unwrap_or(SqlValue::Null))
            .collect(),
    }
}

/// A two-step plan as produced by the splitter: map fragments plus the
/// reduce fragment and the flags the reducer plans by.
#[derive(Clone, Debug)]
pub struct TwoStepQuery {
    pub cache_ids: Vec<CacheId>,
    pub map_queries: Vec<MapQuery>,
    pub reduce_query: Option<ReduceQuery>,
    /// Table names referenced by the plan; shipped to mappers only when
    /// distributed joins are on.
    pub tables: Vec<String>,
    pub is_local: bool,
    pub replicated_only: bool,
    pub explain: bool,
    pub distributed_joins: bool,
    pub skip_merge_table: bool,
    pub for_update: bool,
    pub mvcc_enabled: bool,
    /// Rows per response page; 0 picks the configured default.
    pub page_size: usize,
}

impl TwoStepQuery {
    pub fn new(cache_ids: Vec<CacheId>, map_queries: Vec<MapQuery>) -> Self {
        Self {
            cache_ids,
            map_queries,
            reduce_query: None,
            tables: Vec::new(),
            is_local: false,
            replicated_only: false,
            explain: false,
            distributed_joins: false,
            skip_merge_table: false,
            for_update: false,
            mvcc_enabled: false,
            page_size: 0,
        }
    }
}

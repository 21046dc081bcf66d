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

//! Semantic contract of the messages exchanged between the reducer and the
//! map executors. Marshalling is the messaging layer's concern.

use std::collections::HashMap;

use crate::common::types::{CacheId, NodeId, TopologyVersion, UniqueId};
use crate::engine::tx::MvccSnapshot;
use crate::engine::value::{Row, SqlValue};

/// Flags carried by [`QueryRequest`] and [`NextPageRequest`].
pub mod query_flags {
    /// Always set on the map side to keep plans deterministic.
    pub const ENFORCE_JOIN_ORDER: u32 = 1;
    pub const DISTRIBUTED_JOINS: u32 = 1 << 1;
    pub const IS_LOCAL: u32 = 1 << 2;
    pub const EXPLAIN: u32 = 1 << 3;
    pub const REPLICATED: u32 = 1 << 4;
    pub const LAZY: u32 = 1 << 5;

    const DATA_PAGE_SCAN_ENABLED: u32 = 1 << 6;
    const DATA_PAGE_SCAN_DISABLED: u32 = 1 << 7;

    /// Encodes the tri-state data-page-scan override into `flags`.
    pub fn set_data_page_scan(flags: u32, enabled: Option<bool>) -> u32 {
        match enabled {
            None => flags,
            Some(true) => flags | DATA_PAGE_SCAN_ENABLED,
            Some(false) => flags | DATA_PAGE_SCAN_DISABLED,
        }
    }

    pub fn data_page_scan(flags: u32) -> Option<bool> {
        if flags & DATA_PAGE_SCAN_ENABLED != 0 {
            Some(true)
        } else if flags & DATA_PAGE_SCAN_DISABLED != 0 {
            Some(false)
        } else {
            None
        }
    }
}

/// Per-recipient SELECT FOR UPDATE transaction details attached by the
/// request specializer.
#[derive(Clone, Debug)]
pub struct SelectForUpdateTxDetails {
    pub thread_id: i64,
    /// Fresh id for this (request, recipient) pair.
    pub version: UniqueId,
    /// Per-run ordering counter.
    pub operation_counter: u32,
    pub subject_id: UniqueId,
    pub xid: UniqueId,
    pub task_name_hash: i32,
    pub client_first: bool,
    pub timeout_millis: i64,
}

/// One map fragment as shipped to the mappers.
#[derive(Clone, Debug)]
pub struct QueryRequestEntry {
    pub query: String,
    /// Single-node pin for fragments over replicated caches only.
    pub node: Option<NodeId>,
}

/// Map-query fan-out request.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub request_id: u64,
    pub topology_version: TopologyVersion,
    pub page_size: usize,
    pub caches: Vec<CacheId>,
    /// Referenced tables; present only when distributed joins are enabled.
    pub tables: Option<Vec<String>>,
    /// Per-node partition reservations for the whole mapping.
    pub partitions: Option<HashMap<NodeId, Vec<u32>>>,
    /// Partitions this recipient should query; filled by the specializer
    /// when the caller pinned explicit partitions.
    pub query_partitions: Option<Vec<u32>>,
    pub queries: Vec<QueryRequestEntry>,
    pub parameters: Vec<SqlValue>,
    pub flags: u32,
    pub timeout_millis: i64,
    pub schema: String,
    pub mvcc_snapshot: Option<MvccSnapshot>,
    pub tx_details: Option<SelectForUpdateTxDetails>,
}

/// DML fan-out request.
#[derive(Clone, Debug)]
pub struct DmlRequest {
    pub request_id: u64,
    pub topology_version: TopologyVersion,
    pub caches: Vec<CacheId>,
    pub schema: String,
    pub query: String,
    pub page_size: usize,
    pub query_partitions: Option<Vec<u32>>,
    pub parameters: Vec<SqlValue>,
    pub flags: u32,
    pub timeout_millis: i64,
}

#[derive(Clone, Debug)]
pub struct NextPageRequest {
    pub request_id: u64,
    pub query_index: usize,
    pub segment: u32,
    pub page_size: usize,
    pub flags: u32,
}

#[derive(Clone, Debug)]
pub struct QueryCancelRequest {
    pub request_id: u64,
}

/// Everything the reducer sends towards map executors.
#[derive(Clone, Debug)]
pub enum MapRequest {
    Query(QueryRequest),
    NextPage(NextPageRequest),
    Cancel(QueryCancelRequest),
    Dml(DmlRequest),
}

impl MapRequest {
    pub fn request_id(&self) -> u64 {
        match self {
            MapRequest::Query(m) => m.request_id,
            MapRequest::NextPage(m) => m.request_id,
            MapRequest::Cancel(m) => m.request_id,
            MapRequest::Dml(m) => m.request_id,
        }
    }
}

/// One page of a map fragment's result stream.
#[derive(Clone, Debug)]
pub struct NextPageResponse {
    pub request_id: u64,
    pub query_index: usize,
    pub segment: u32,
    pub page_number: u64,
    pub rows: Vec<Row>,
    pub last: bool,
    /// Set when the mapper's partition view was stale; the reducer must
    /// retry once the topology reaches this version.
    pub retry: Option<TopologyVersion>,
    pub retry_cause: Option<String>,
    /// Total locked rows, first page of a SELECT FOR UPDATE stream only.
    pub all_rows: Option<u64>,
    pub remove_mapping: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailCode {
    General,
    CancelledByOriginator,
}

#[derive(Clone, Debug)]
pub struct FailResponse {
    pub request_id: u64,
    pub error: String,
    pub fail_code: FailCode,
}

#[derive(Clone, Debug)]
pub struct DmlResponse {
    pub request_id: u64,
    pub updated: u64,
    pub error: Option<String>,
}

/// Everything a map executor sends back to the reducer.
#[derive(Clone, Debug)]
pub enum ReduceMessage {
    NextPage(NextPageResponse),
    Fail(FailResponse),
    Dml(DmlResponse),
}

impl ReduceMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ReduceMessage::NextPage(m) => m.request_id,
            ReduceMessage::Fail(m) => m.request_id,
            ReduceMessage::Dml(m) => m.request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::query_flags;

    #[test]
    fn data_page_scan_tri_state() {
        let base = query_flags::ENFORCE_JOIN_ORDER;
        assert_eq!(
            query_flags::data_page_scan(query_flags::set_data_page_scan(base, None)),
            None
        );
        assert_eq!(
            query_flags::data_page_scan(query_flags::set_data_page_scan(base, Some(true))),
            Some(true)
        );
        assert_eq!(
            query_flags::data_page_scan(query_flags::set_data_page_scan(base, Some(false))),
            Some(false)
        );
    }
}

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

//! Reduce-side coordinator of a two-step distributed SQL engine over a
//! partitioned key-value grid: fans map queries out to data nodes, merges
//! their paged partial results locally and streams the reduced rows back to
//! the caller.

pub mod common;
pub mod engine;
pub mod runtime;
pub mod service;

pub use common::app_config as gridsql_config;
pub use common::logging as gridsql_logging;

pub use common::types::{CacheId, NodeId, NodeVersion, TopologyVersion, UniqueId};
pub use engine::{
    ColumnMeta, MapQuery, QueryCancel, ReduceQuery, Row, RowCursor, SortColumn, SqlConnection,
    SqlEngine, SqlType, SqlValue, TwoStepQuery,
};
pub use runtime::error::ReduceError;
pub use runtime::merge_table::FakeTableRegistry;
pub use runtime::reduce::{QueryRowIter, ReduceQueryExecutor, DML_SINCE};
pub use runtime::run::UpdateResult;
pub use service::messages::ReduceMessage;

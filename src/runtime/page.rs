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
use crate::common::types::NodeId;
use crate::engine::value::Row;
use crate::runtime::error::ReduceError;

/// One page of one source stream, as buffered inside a merge index.
/// Successor pages are pulled through [`PageFetcher`]: pages carry only the
/// stable source coordinates, never a handle back into the run.
#[derive(Clone, Debug)]
pub struct ResultPage {
    pub source: NodeId,
    pub segment: u32,
    pub page_number: u64,
    pub rows: Vec<Row>,
    pub last: bool,
}

impl ResultPage {
    pub fn source_key(&self) -> (NodeId, u32) {
        (self.source, self.segment)
    }
}

/// Issues the next-page request for one exhausted source page. Looks the run
/// up by request id and no-ops when it is already gone; raises when the run
/// is in a terminal or retry state.
pub trait PageFetcher: Send + Sync {
    fn fetch_next_page(
        &self,
        node: NodeId,
        query_index: usize,
        segment: u32,
    ) -> Result<(), ReduceError>;
}

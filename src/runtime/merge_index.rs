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

//! In-memory sinks for the paged row streams of one map query. The unsorted
//! index concatenates pages in arrival order; the sorted index runs a k-way
//! merge over per-source streams keyed by the declared sort columns.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use crate::common::types::NodeId;
use crate::engine::sql::RowCursor;
use crate::engine::value::{compare_rows, Row, SortColumn};
use crate::gridsql_logging::debug;
use crate::runtime::error::ReduceError;
use crate::runtime::page::{PageFetcher, ResultPage};

pub(crate) const MERGE_INDEX_UNSORTED: &str = "merge_scan";
pub(crate) const MERGE_INDEX_SORTED: &str = "merge_sorted";

pub type SourceKey = (NodeId, u32);

/// Sink side of a merge index. One instance per map query per run; sources
/// are frozen before the request is dispatched.
pub trait MergeIndex: Send + Sync {
    fn index_name(&self) -> &'static str;

    fn query_index(&self) -> usize;

    fn set_sources(&self, nodes: &[NodeId], segments_per_node: u32);

    fn set_page_size(&self, page_size: usize);

    /// True when `node` contributes any segment stream to this index.
    fn has_source(&self, node: NodeId) -> bool;

    /// Accepts one page. Rejects pages from unknown sources, non-monotonic
    /// page numbers and pages past a stream's last page.
    fn add_page(&self, page: ResultPage) -> Result<(), ReduceError>;

    /// Terminal notification: wakes every blocked cursor with `err`.
    fn fail(&self, err: ReduceError);

    /// True once every source stream has delivered its last page.
    fn fetched_all(&self) -> bool;

    fn open_cursor(self: Arc<Self>) -> Box<dyn RowCursor>;
}

#[derive(Default)]
struct SourceProgress {
    next_page: u64,
    last_seen: bool,
}

/// Per-source page accounting shared by both index variants.
#[derive(Default)]
struct SourceTable {
    map: HashMap<SourceKey, SourceProgress>,
}

impl SourceTable {
    fn set_sources(&mut self, nodes: &[NodeId], segments_per_node: u32) {
        self.map.clear();
        for &node in nodes {
            for seg in 0..segments_per_node {
                self.map.insert((node, seg), SourceProgress::default());
            }
        }
    }

    fn has_node(&self, node: NodeId) -> bool {
        self.map.keys().any(|(n, _)| *n == node)
    }

    fn keys(&self) -> Vec<SourceKey> {
        self.map.keys().copied().collect()
    }

    fn accept(&mut self, page: &ResultPage) -> Result<(), ReduceError> {
        let key = page.source_key();
        let progress = self.map.get_mut(&key).ok_or_else(|| {
            ReduceError::Engine(format!(
                "Received a result page from an unknown source [node={}, segment={}]",
                page.source, page.segment
            ))
        })?;

        if progress.last_seen {
            return Err(ReduceError::Engine(format!(
                "Received a result page past the last one [node={}, segment={}, page={}]",
                page.source, page.segment, page.page_number
            )));
        }

        if page.page_number != progress.next_page {
            return Err(ReduceError::Engine(format!(
                "Received an out-of-order result page [node={}, segment={}, expected={}, got={}]",
                page.source, page.segment, progress.next_page, page.page_number
            )));
        }

        progress.next_page += 1;
        if page.last {
            progress.last_seen = true;
        }
        Ok(())
    }

    fn fetched_all(&self) -> bool {
        !self.map.is_empty() && self.map.values().all(|p| p.last_seen)
    }
}

// ---------------------------------------------------------------------------
// Unsorted variant
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UnsortedState {
    sources: SourceTable,
    queue: VecDeque<ResultPage>,
    failure: Option<ReduceError>,
    page_size: usize,
}

/// Append-only concatenation of pages in arrival order.
pub struct UnsortedMergeIndex {
    query_index: usize,
    fetcher: Arc<dyn PageFetcher>,
    mu: Mutex<UnsortedState>,
    cv: Condvar,
}

impl UnsortedMergeIndex {
    pub fn new(fetcher: Arc<dyn PageFetcher>, query_index: usize) -> Self {
        Self {
            query_index,
            fetcher,
            mu: Mutex::new(UnsortedState::default()),
            cv: Condvar::new(),
        }
    }

    /// Index for the skip-merge-table path: same sink, never bound to a
    /// table shell.
    pub fn dummy(fetcher: Arc<dyn PageFetcher>, query_index: usize) -> Self {
        Self::new(fetcher, query_index)
    }

    fn take_next_page(&self) -> Result<Option<ResultPage>, ReduceError> {
        let mut st = self.mu.lock().expect("merge index lock");
        loop {
            if let Some(err) = st.failure.as_ref() {
                return Err(err.clone());
            }
            if let Some(page) = st.queue.pop_front() {
                return Ok(Some(page));
            }
            if st.sources.fetched_all() {
                return Ok(None);
            }
            st = self.cv.wait(st).expect("merge index wait");
        }
    }
}

impl MergeIndex for UnsortedMergeIndex {
    fn index_name(&self) -> &'static str {
        MERGE_INDEX_UNSORTED
    }

    fn query_index(&self) -> usize {
        self.query_index
    }

    fn set_sources(&self, nodes: &[NodeId], segments_per_node: u32) {
        let mut st = self.mu.lock().expect("merge index lock");
        st.sources.set_sources(nodes, segments_per_node);
    }

    fn set_page_size(&self, page_size: usize) {
        self.mu.lock().expect("merge index lock").page_size = page_size;
    }

    fn has_source(&self, node: NodeId) -> bool {
        self.mu.lock().expect("merge index lock").sources.has_node(node)
    }

    fn add_page(&self, page: ResultPage) -> Result<(), ReduceError> {
        let mut st = self.mu.lock().expect("merge index lock");
        if st.failure.is_some() {
            // The run is already terminal; late pages are dropped.
            return Ok(());
        }
        debug!(
            "merge index page: qry={} node={} seg={} page={} rows={} last={} page_size={}",
            self.query_index,
            page.source,
            page.segment,
            page.page_number,
            page.rows.len(),
            page.last,
            st.page_size
        );
        st.sources.accept(&page)?;
        st.queue.push_back(page);
        self.cv.notify_all();
        Ok(())
    }

    fn fail(&self, err: ReduceError) {
        let mut st = self.mu.lock().expect("merge index lock");
        if st.failure.is_none() {
            st.failure = Some(err);
        }
        self.cv.notify_all();
    }

    fn fetched_all(&self) -> bool {
        self.mu.lock().expect("merge index lock").sources.fetched_all()
    }

    fn open_cursor(self: Arc<Self>) -> Box<dyn RowCursor> {
        Box::new(UnsortedCursor {
            idx: self,
            page: None,
            pos: 0,
        })
    }
}

struct UnsortedCursor {
    idx: Arc<UnsortedMergeIndex>,
    page: Option<ResultPage>,
    pos: usize,
}

impl RowCursor for UnsortedCursor {
    fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        loop {
            if let Some(page) = self.page.as_mut() {
                if self.pos < page.rows.len() {
                    let row = mem::take(&mut page.rows[self.pos]);
                    self.pos += 1;
                    return Ok(Some(row));
                }

                let done = self.page.take().expect("current page");
                if !done.last {
                    self.idx.fetcher.fetch_next_page(
                        done.source,
                        self.idx.query_index,
                        done.segment,
                    )?;
                }
            }

            match self.idx.take_next_page()? {
                Some(page) => {
                    self.page = Some(page);
                    self.pos = 0;
                }
                None => return Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sorted variant
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SortedState {
    sources: SourceTable,
    streams: HashMap<SourceKey, VecDeque<ResultPage>>,
    failure: Option<ReduceError>,
    page_size: usize,
}

/// K-way merge over per-source streams, keyed by the declared sort columns.
/// Equal keys may surface in any source order.
pub struct SortedMergeIndex {
    query_index: usize,
    sort_columns: Arc<Vec<SortColumn>>,
    fetcher: Arc<dyn PageFetcher>,
    mu: Mutex<SortedState>,
    cv: Condvar,
}

impl SortedMergeIndex {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        query_index: usize,
        sort_columns: Vec<SortColumn>,
    ) -> Self {
        Self {
            query_index,
            sort_columns: Arc::new(sort_columns),
            fetcher,
            mu: Mutex::new(SortedState::default()),
            cv: Condvar::new(),
        }
    }

    fn source_keys(&self) -> Vec<SourceKey> {
        self.mu.lock().expect("merge index lock").sources.keys()
    }

    /// Blocks until the next page of `key`'s stream arrives. Callers only
    /// wait here when the stream has promised more pages.
    fn take_stream_page(&self, key: SourceKey) -> Result<ResultPage, ReduceError> {
        let mut st = self.mu.lock().expect("merge index lock");
        loop {
            if let Some(err) = st.failure.as_ref() {
                return Err(err.clone());
            }
            if let Some(queue) = st.streams.get_mut(&key) {
                if let Some(page) = queue.pop_front() {
                    return Ok(page);
                }
            }
            st = self.cv.wait(st).expect("merge index wait");
        }
    }
}

impl MergeIndex for SortedMergeIndex {
    fn index_name(&self) -> &'static str {
        MERGE_INDEX_SORTED
    }

    fn query_index(&self) -> usize {
        self.query_index
    }

    fn set_sources(&self, nodes: &[NodeId], segments_per_node: u32) {
        let mut st = self.mu.lock().expect("merge index lock");
        st.sources.set_sources(nodes, segments_per_node);
        st.streams.clear();
        for key in st.sources.keys() {
            st.streams.insert(key, VecDeque::new());
        }
    }

    fn set_page_size(&self, page_size: usize) {
        self.mu.lock().expect("merge index lock").page_size = page_size;
    }

    fn has_source(&self, node: NodeId) -> bool {
        self.mu.lock().expect("merge index lock").sources.has_node(node)
    }

    fn add_page(&self, page: ResultPage) -> Result<(), ReduceError> {
        let mut st = self.mu.lock().expect("merge index lock");
        if st.failure.is_some() {
            return Ok(());
        }
        debug!(
            "sorted merge index page: qry={} node={} seg={} page={} rows={} last={} page_size={}",
            self.query_index,
            page.source,
            page.segment,
            page.page_number,
            page.rows.len(),
            page.last,
            st.page_size
        );
        st.sources.accept(&page)?;
        let key = page.source_key();
        st.streams.entry(key).or_default().push_back(page);
        self.cv.notify_all();
        Ok(())
    }

    fn fail(&self, err: ReduceError) {
        let mut st = self.mu.lock().expect("merge index lock");
        if st.failure.is_none() {
            st.failure = Some(err);
        }
        self.cv.notify_all();
    }

    fn fetched_all(&self) -> bool {
        self.mu.lock().expect("merge index lock").sources.fetched_all()
    }

    fn open_cursor(self: Arc<Self>) -> Box<dyn RowCursor> {
        Box::new(SortedCursor {
            idx: self,
            heap: BinaryHeap::new(),
            pages: HashMap::new(),
            started: false,
        })
    }
}

struct HeapEntry {
    row: Row,
    source: SourceKey,
    sort: Arc<Vec<SortColumn>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap keeps the largest element on top; reverse so the
        // smallest row surfaces first.
        compare_rows(&self.sort, &other.row, &self.row)
    }
}

struct SortedCursor {
    idx: Arc<SortedMergeIndex>,
    heap: BinaryHeap<HeapEntry>,
    /// Page currently being consumed, per source stream.
    pages: HashMap<SourceKey, (ResultPage, usize)>,
    started: bool,
}

impl SortedCursor {
    /// Materializes the head row of `key`'s stream into the heap, pulling
    /// pages until one yields a row or the stream ends.
    fn advance_source(&mut self, key: SourceKey) -> Result<(), ReduceError> {
        loop {
            if let Some((page, pos)) = self.pages.get_mut(&key) {
                if *pos < page.rows.len() {
                    let row = mem::take(&mut page.rows[*pos]);
                    *pos += 1;
                    self.heap.push(HeapEntry {
                        row,
                        source: key,
                        sort: Arc::clone(&self.idx.sort_columns),
                    });
                    return Ok(());
                }

                let (done, _) = self.pages.remove(&key).expect("current page");
                if done.last {
                    return Ok(());
                }
                self.idx
                    .fetcher
                    .fetch_next_page(done.source, self.idx.query_index, done.segment)?;
            }

            let page = self.idx.take_stream_page(key)?;
            self.pages.insert(key, (page, 0));
        }
    }
}

impl RowCursor for SortedCursor {
    fn next_row(&mut self) -> Result<Option<Row>, ReduceError> {
        if !self.started {
            self.started = true;
            for key in self.idx.source_keys() {
                self.advance_source(key)?;
            }
        }

        match self.heap.pop() {
            None => Ok(None),
            Some(entry) => {
                let HeapEntry { row, source, .. } = entry;
                self.advance_source(source)?;
                Ok(Some(row))
            }
        }
    }
}

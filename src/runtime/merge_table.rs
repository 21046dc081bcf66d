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
use std::sync::{Arc, Mutex, RwLock};

use crate::engine::sql::RowCursor;
use crate::engine::two_step::MapQuery;
use crate::engine::value::ColumnMeta;
use crate::runtime::error::ReduceError;
use crate::runtime::merge_index::{MergeIndex, SortedMergeIndex, UnsortedMergeIndex};
use crate::runtime::page::PageFetcher;

/// Canonical name of the merge table backing map query `idx`.
pub fn merge_table_identifier(idx: usize) -> String {
    format!("T___{idx}")
}

/// Reducer-local table backed by one merge index. For sorted merges a scan
/// cursor is available alongside the sorted one so the local planner can
/// choose either access path.
pub struct MergeTable {
    columns: Vec<ColumnMeta>,
    merge_index: Arc<dyn MergeIndex>,
    sorted: bool,
}

impl MergeTable {
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn merge_index(&self) -> Arc<dyn MergeIndex> {
        Arc::clone(&self.merge_index)
    }

    /// Merge-order cursor: sorted output for a sorted table, arrival order
    /// otherwise.
    pub fn open_cursor(&self) -> Box<dyn RowCursor> {
        Arc::clone(&self.merge_index).open_cursor()
    }

    /// Scan access path installed next to a sorted index. Rows still stream
    /// in merge order; only the planner-visible contract differs.
    pub fn open_scan_cursor(&self) -> Box<dyn RowCursor> {
        Arc::clone(&self.merge_index).open_cursor()
    }

    pub fn has_scan_index(&self) -> bool {
        self.sorted
    }
}

/// Builds the merge table for one map query. EXPLAIN tables carry the single
/// string column `PLAN` and always merge unsorted.
pub(crate) fn create_merge_table(
    map_qry: &MapQuery,
    explain: bool,
    fetcher: Arc<dyn PageFetcher>,
    ordinal: usize,
) -> Result<Arc<MergeTable>, ReduceError> {
    let columns = if explain {
        vec![ColumnMeta::plan()]
    } else {
        for c in &map_qry.columns {
            if c.name.is_empty() {
                return Err(ReduceError::InvalidPlan(format!(
                    "map query column without an alias in {}",
                    merge_table_identifier(ordinal)
                )));
            }
        }
        map_qry.columns.clone()
    };

    let sorted = !explain && !map_qry.sort_columns.is_empty();

    let merge_index: Arc<dyn MergeIndex> = if sorted {
        Arc::new(SortedMergeIndex::new(
            fetcher,
            ordinal,
            map_qry.sort_columns.clone(),
        ))
    } else {
        Arc::new(UnsortedMergeIndex::new(fetcher, ordinal))
    };

    Ok(Arc::new(MergeTable {
        columns,
        merge_index,
        sorted,
    }))
}

/// One reducer-local table shell the engine resolves by canonical name.
/// Shells persist for reuse; only the inner table comes and goes per run.
pub struct FakeTable {
    name: String,
    inner: Mutex<Option<Arc<MergeTable>>>,
}

impl FakeTable {
    fn new(name: String) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_inner(&self, table: Option<Arc<MergeTable>>) {
        *self.inner.lock().expect("fake table lock") = table;
    }

    pub fn inner(&self) -> Option<Arc<MergeTable>> {
        self.inner.lock().expect("fake table lock").clone()
    }
}

/// Process-wide, copy-on-write list of table shells indexed by map-query
/// ordinal. Reads take no growth lock; growth is double-checked under a
/// dedicated mutex. Slots are never removed.
pub struct FakeTableRegistry {
    tables: RwLock<Arc<Vec<Arc<FakeTable>>>>,
    grow_lock: Mutex<()>,
}

impl Default for FakeTableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTableRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Arc::new(Vec::new())),
            grow_lock: Mutex::new(()),
        }
    }

    /// Gets or lazily creates the shell for `ordinal`.
    pub fn table(&self, ordinal: usize) -> Arc<FakeTable> {
        {
            let tables = self.tables.read().expect("fake tables lock");
            if let Some(t) = tables.get(ordinal) {
                return Arc::clone(t);
            }
        }

        let _grow = self.grow_lock.lock().expect("fake tables grow lock");
        let mut current = Arc::clone(&self.tables.read().expect("fake tables lock"));
        while current.len() <= ordinal {
            // Re-check inside the lock; another thread may have grown past us.
            let mut next = (*current).clone();
            next.push(Arc::new(FakeTable::new(merge_table_identifier(next.len()))));
            let next = Arc::new(next);
            *self.tables.write().expect("fake tables lock") = Arc::clone(&next);
            current = next;
        }
        Arc::clone(&current[ordinal])
    }

    /// Resolves a shell by canonical name, for the engine side.
    pub fn by_name(&self, name: &str) -> Option<Arc<FakeTable>> {
        let tables = self.tables.read().expect("fake tables lock");
        tables.iter().find(|t| t.name() == name).cloned()
    }

    /// Drops the inner table of `ordinal`, keeping the shell.
    pub fn reset_slot(&self, ordinal: usize) {
        let tables = self.tables.read().expect("fake tables lock");
        if let Some(t) = tables.get(ordinal) {
            t.set_inner(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{create_merge_table, merge_table_identifier, FakeTableRegistry};
    use crate::engine::two_step::MapQuery;
    use crate::engine::value::{ColumnMeta, SortColumn, SqlType};
    use crate::runtime::error::ReduceError;
    use crate::runtime::page::PageFetcher;
    use std::sync::Arc;

    struct NoopFetcher;

    impl PageFetcher for NoopFetcher {
        fn fetch_next_page(
            &self,
            _node: crate::common::types::NodeId,
            _query_index: usize,
            _segment: u32,
        ) -> Result<(), ReduceError> {
            Ok(())
        }
    }

    fn map_query(sorted: bool) -> MapQuery {
        MapQuery {
            query: "SELECT A FROM X".into(),
            partitioned: true,
            columns: vec![ColumnMeta::new("A", SqlType::Int, false)],
            sort_columns: if sorted {
                vec![SortColumn::new(0, true)]
            } else {
                Vec::new()
            },
            parameter_indexes: None,
        }
    }

    #[test]
    fn registry_grows_lazily_and_keeps_shells() {
        let reg = FakeTableRegistry::new();
        let t2 = reg.table(2);
        assert_eq!(t2.name(), "T___2");
        assert_eq!(reg.table(0).name(), "T___0");
        assert!(reg.by_name("T___1").is_some());
        assert!(reg.by_name("T___7").is_none());

        let tbl = create_merge_table(&map_query(false), false, Arc::new(NoopFetcher), 2)
            .expect("merge table");
        t2.set_inner(Some(tbl));
        assert!(reg.table(2).inner().is_some());

        // Reset keeps the shell, drops the inner table; twice is a no-op.
        reg.reset_slot(2);
        reg.reset_slot(2);
        assert!(reg.table(2).inner().is_none());
        assert_eq!(reg.table(2).name(), "T___2");
    }

    #[test]
    fn sorted_map_query_gets_scan_index() {
        let tbl = create_merge_table(&map_query(true), false, Arc::new(NoopFetcher), 0)
            .expect("merge table");
        assert!(tbl.has_scan_index());

        let plain = create_merge_table(&map_query(false), false, Arc::new(NoopFetcher), 0)
            .expect("merge table");
        assert!(!plain.has_scan_index());
    }

    #[test]
    fn explain_table_has_plan_column() {
        let tbl = create_merge_table(&map_query(true), true, Arc::new(NoopFetcher), 1)
            .expect("merge table");
        assert_eq!(tbl.columns().len(), 1);
        assert_eq!(tbl.columns()[0].name, "PLAN");
        assert!(!tbl.has_scan_index());
        assert_eq!(merge_table_identifier(1), "T___1");
    }
}

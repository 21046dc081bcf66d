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
use std::cmp::Ordering;
use std::fmt;

/// Dynamically typed SQL value as it travels between map and reduce sides.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SqlValue {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Milliseconds since epoch.
    Timestamp(i64),
}

/// One result row.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Bool(_) => 1,
            SqlValue::Int(_) | SqlValue::Long(_) | SqlValue::Double(_) => 2,
            SqlValue::Str(_) => 3,
            SqlValue::Bytes(_) => 4,
            SqlValue::Timestamp(_) => 5,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Long(v) => Some(*v as f64),
            SqlValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Total SQL ordering: nulls first, then by type family, numeric types
    /// compared as one family. NaN sorts after every other number.
    pub fn sql_cmp(&self, other: &SqlValue) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a.cmp(b),
            (SqlValue::Int(a), SqlValue::Int(b)) => a.cmp(b),
            (SqlValue::Long(a), SqlValue::Long(b)) => a.cmp(b),
            (SqlValue::Str(a), SqlValue::Str(b)) => a.cmp(b),
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a.cmp(b),
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => a.cmp(b),
            _ => {
                let a = self.as_f64().expect("numeric family");
                let b = other.as_f64().expect("numeric family");
                match a.partial_cmp(&b) {
                    Some(ord) => ord,
                    None => match (a.is_nan(), b.is_nan()) {
                        (true, true) => Ordering::Equal,
                        (true, false) => Ordering::Greater,
                        (false, true) => Ordering::Less,
                        (false, false) => Ordering::Equal,
                    },
                }
            }
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Long(v) => write!(f, "{v}"),
            SqlValue::Double(v) => write!(f, "{v}"),
            SqlValue::Str(v) => write!(f, "{v}"),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Timestamp(v) => write!(f, "ts:{v}"),
        }
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Long(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Double(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Str(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Str(v)
    }
}

/// SQL column type carried by map-query column metadata.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SqlType {
    Boolean,
    Int,
    Long,
    Double,
    String,
    Bytes,
    Timestamp,
}

/// Column of a merge table, taken from the split query's metadata.
#[derive(Clone, Debug)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: SqlType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable,
        }
    }

    /// The single column of an EXPLAIN merge table.
    pub fn plan() -> Self {
        Self::new("PLAN", SqlType::String, false)
    }
}

/// One declared sort column of a sorted map query.
#[derive(Copy, Clone, Debug)]
pub struct SortColumn {
    pub column: usize,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortColumn {
    /// Engine default nulls placement: nulls first on ascending order.
    pub fn new(column: usize, ascending: bool) -> Self {
        Self {
            column,
            ascending,
            nulls_first: ascending,
        }
    }
}

/// Compares two rows by the declared sort columns.
pub fn compare_rows(sort_cols: &[SortColumn], a: &Row, b: &Row) -> Ordering {
    for sc in sort_cols {
        let va = a.get(sc.column).unwrap_or(&SqlValue::Null);
        let vb = b.get(sc.column).unwrap_or(&SqlValue::Null);

        let ord = match (va.is_null(), vb.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if sc.nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if sc.nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => {
                let ord = va.sql_cmp(vb);
                if sc.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
        };

        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

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
use std::fmt;

/// 128-bit identifier carried as a hi/lo pair, rendered in UUID form.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Fresh identifier for per-request tokens (SELECT FOR UPDATE versions).
    pub fn random() -> Self {
        Self {
            hi: rand::random::<i64>(),
            lo: rand::random::<i64>(),
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hi, lo) = (self.hi as u64, self.lo as u64);
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (hi >> 32) as u32,
            (hi >> 16) as u16,
            hi as u16,
            (lo >> 48) as u16,
            lo & 0x0000_FFFF_FFFF_FFFF
        )
    }
}

/// Cluster node identity. Nodes are addressed by the same 128-bit id the
/// membership service hands out.
pub type NodeId = UniqueId;

/// Cache identifier as assigned by the grid cache processor.
pub type CacheId = i32;

/// Monotonic counter naming a cluster-membership snapshot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopologyVersion(pub u64);

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product version advertised by a node, used for capability gating.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeVersion {
    pub major: u16,
    pub minor: u16,
    pub maintenance: u16,
}

impl NodeVersion {
    pub const fn new(major: u16, minor: u16, maintenance: u16) -> Self {
        Self {
            major,
            minor,
            maintenance,
        }
    }

    pub fn at_least(self, other: NodeVersion) -> bool {
        self >= other
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maintenance)
    }
}

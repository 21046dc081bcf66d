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
use std::cell::RefCell;

use crate::common::types::NodeId;

/// Context of the reduce statement currently executing on this thread's
/// connection. The engine reads it while resolving merge tables.
#[derive(Clone, Debug)]
pub struct ReduceQueryContext {
    pub local_node: NodeId,
    pub request_id: u64,
    pub page_size: usize,
    pub keep_binary: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<ReduceQueryContext>> = const { RefCell::new(None) };
}

impl ReduceQueryContext {
    pub fn current() -> Option<ReduceQueryContext> {
        CURRENT.with(|c| c.borrow().clone())
    }
}

/// Scoped installation of the reduce context; cleared on every exit path.
pub struct ReduceContextGuard;

impl ReduceContextGuard {
    pub fn set(ctx: ReduceQueryContext) -> Self {
        CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
        ReduceContextGuard
    }
}

impl Drop for ReduceContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::{ReduceContextGuard, ReduceQueryContext};
    use crate::common::types::UniqueId;

    #[test]
    fn guard_clears_on_drop() {
        {
            let _g = ReduceContextGuard::set(ReduceQueryContext {
                local_node: UniqueId::new(1, 2),
                request_id: 7,
                page_size: 64,
                keep_binary: false,
            });
            assert_eq!(ReduceQueryContext::current().map(|c| c.request_id), Some(7));
        }
        assert!(ReduceQueryContext::current().is_none());
    }
}

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
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::thread;

use crate::common::types::NodeId;
use crate::gridsql_logging::{debug, warn};
use crate::service::messages::MapRequest;

/// Remote delivery seam of the messaging layer. Per-stream ordering of
/// deliveries is the layer's guarantee.
pub trait Messaging: Send + Sync {
    fn send(&self, node: NodeId, msg: MapRequest) -> Result<(), String>;
}

/// In-process entry point of the local map executor; local-node deliveries
/// bypass the network.
pub trait MapMessageHandler: Send + Sync {
    fn on_message(&self, source: NodeId, msg: MapRequest);
}

/// Per-recipient request rewrite (partition pinning, tx details).
pub type Specializer<'a> = &'a (dyn Fn(NodeId, &MapRequest) -> MapRequest + Sync);

/// Fans one message out to a node set, specializing per recipient and
/// short-circuiting the local node through the in-process handler.
pub(crate) struct MessageTransport {
    messaging: Arc<dyn Messaging>,
    local_handler: Arc<dyn MapMessageHandler>,
    local_node: NodeId,
}

impl MessageTransport {
    pub(crate) fn new(
        messaging: Arc<dyn Messaging>,
        local_handler: Arc<dyn MapMessageHandler>,
        local_node: NodeId,
    ) -> Self {
        Self {
            messaging,
            local_handler,
            local_node,
        }
    }

    pub(crate) fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Returns true iff every delivery succeeded. The local delivery is
    /// performed last so remote mappers start first.
    pub(crate) fn send_to_nodes(
        &self,
        nodes: &[NodeId],
        msg: &MapRequest,
        specialize: Option<Specializer<'_>>,
        run_local_parallel: bool,
    ) -> bool {
        debug!(
            "Sending request: id={} nodes={} specialized={}",
            msg.request_id(),
            nodes.len(),
            specialize.is_some()
        );

        let mut ok = true;
        let mut local_msg: Option<MapRequest> = None;

        for &node in nodes {
            let msg0 = match specialize {
                Some(f) => f(node, msg),
                None => msg.clone(),
            };

            if node == self.local_node {
                local_msg = Some(msg0);
                continue;
            }

            if let Err(e) = self.messaging.send(node, msg0) {
                warn!("Failed to send message to node {node}: {e}");
                ok = false;
            }
        }

        if let Some(msg0) = local_msg {
            if run_local_parallel {
                let handler = Arc::clone(&self.local_handler);
                let local = self.local_node;
                thread::spawn(move || handler.on_message(local, msg0));
            } else {
                self.local_handler.on_message(self.local_node, msg0);
            }
        }

        ok
    }
}

/// Guards message dispatch against shutdown: readers are in-flight
/// dispatches, the writer is `block()`.
pub(crate) struct BusyLock {
    stopped: RwLock<bool>,
}

pub(crate) struct BusyGuard<'a> {
    _guard: RwLockReadGuard<'a, bool>,
}

impl BusyLock {
    pub(crate) fn new() -> Self {
        Self {
            stopped: RwLock::new(false),
        }
    }

    pub(crate) fn enter_busy(&self) -> Option<BusyGuard<'_>> {
        let guard = self.stopped.read().expect("busy lock");
        if *guard {
            return None;
        }
        Some(BusyGuard { _guard: guard })
    }

    pub(crate) fn block(&self) {
        *self.stopped.write().expect("busy lock") = true;
    }
}

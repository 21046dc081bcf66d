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
use std::sync::Arc;

use crate::common::types::{NodeId, NodeVersion};

/// Node descriptor as exposed by the membership service.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub version: NodeVersion,
}

/// Read-only view of cluster membership.
pub trait ClusterDiscovery: Send + Sync {
    fn local_node(&self) -> NodeInfo;

    /// `None` for a node that already left.
    fn node(&self, id: NodeId) -> Option<NodeInfo>;

    fn alive(&self, id: NodeId) -> bool;

    /// True while this client node is detached from the cluster.
    fn client_disconnected(&self) -> bool;
}

/// Membership and connectivity events the reducer reacts to.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    NodeLeft(NodeId),
    NodeFailed(NodeId),
    ClientDisconnected,
}

pub trait ClusterEventListener: Send + Sync {
    fn on_event(&self, evt: &ClusterEvent);
}

/// Host-side event source the reducer subscribes to on start.
pub trait ClusterEventBus: Send + Sync {
    fn subscribe(&self, listener: Arc<dyn ClusterEventListener>);
}

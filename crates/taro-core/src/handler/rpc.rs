//! Protocol request dispatch
//!
//! Decodes [`Request`] variants into coordinator calls. Join and reconnect
//! wire the node's push channel; the transport drains it via
//! [`RequestHandler::take_push_stream`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use taro_api::model::NodeId;
use taro_api::remote::{Request, Response, ServerPush};
use taro_common::TaroError;

use crate::coordinator::Coordinator;

pub struct RequestHandler {
    coordinator: Arc<Coordinator>,
    push_streams: DashMap<NodeId, mpsc::UnboundedReceiver<ServerPush>>,
}

impl RequestHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            push_streams: DashMap::new(),
        }
    }

    /// The push channel wired by the node's last join/reconnect
    pub fn take_push_stream(&self, node_id: &str) -> Option<mpsc::UnboundedReceiver<ServerPush>> {
        self.push_streams.remove(node_id).map(|(_, rx)| rx)
    }

    pub async fn handle(&self, request: Request) -> Result<Response, TaroError> {
        match request {
            Request::Join(req) => {
                let (snapshot, rx) = self.coordinator.join(&req.node_id).await?;
                self.push_streams.insert(req.node_id, rx);
                Ok(Response::Joined(snapshot))
            }
            Request::SyncComplete { node_id } => {
                self.coordinator.sync_complete(&node_id).await?;
                Ok(Response::Ok)
            }
            Request::Reconnect { node_id } => {
                let (snapshot, rx) = self.coordinator.reconnect(&node_id).await?;
                self.push_streams.insert(node_id, rx);
                Ok(Response::Joined(snapshot))
            }
            Request::Leave { node_id } => {
                self.coordinator.leave(&node_id).await?;
                Ok(Response::Ok)
            }
            Request::BeginLock(req) => {
                let outcome = self
                    .coordinator
                    .begin_lock(&req.node_id, &req.lock_id, req.level, req.greedy)
                    .await?;
                Ok(Response::BeginLock(outcome))
            }
            Request::CommitLock(req) => {
                self.coordinator
                    .commit_lock(&req.node_id, &req.lock_id)
                    .await?;
                Ok(Response::Ok)
            }
            Request::AbortLock(req) => {
                self.coordinator
                    .abort_lock(&req.node_id, &req.lock_id)
                    .await?;
                Ok(Response::Ok)
            }
            Request::PinLock { lock_id } => {
                self.coordinator.pin_lock(&lock_id).await;
                Ok(Response::Ok)
            }
            Request::EvictLock { lock_id } => {
                self.coordinator.evict_lock(&lock_id).await?;
                Ok(Response::Ok)
            }
            Request::Wait(req) => {
                let timeout = req.timeout_ms.map(Duration::from_millis);
                let outcome = self
                    .coordinator
                    .wait(&req.node_id, &req.lock_id, timeout)
                    .await?;
                Ok(Response::Wait { outcome })
            }
            Request::Notify { lock_id } => {
                self.coordinator.notify(&lock_id).await;
                Ok(Response::Ok)
            }
            Request::NotifyAll { lock_id } => {
                self.coordinator.notify_all(&lock_id).await;
                Ok(Response::Ok)
            }
            Request::BindRoot(req) => {
                self.coordinator
                    .bind_root(&req.node_id, req.scope, &req.root, req.root_type, req.initial)
                    .await?;
                Ok(Response::Ok)
            }
            Request::FaultRoot {
                node_id,
                scope,
                root,
            } => {
                let value = self.coordinator.fault_root(&node_id, scope, &root).await?;
                Ok(Response::RootValue { value })
            }
            Request::EvictCache {
                scope,
                root,
                target,
            } => {
                let count = self.coordinator.evict_cache(scope, &root, target).await?;
                Ok(Response::Evicted { count })
            }
            Request::PublishChangeSet(req) => {
                let seq = self
                    .coordinator
                    .publish_change_set(&req.node_id, &req.lock_id, req.seq, req.changes)
                    .await?;
                Ok(Response::Ack { seq })
            }
            Request::AckDelivery {
                node_id,
                commit_seq,
            } => {
                self.coordinator.ack_delivery(&node_id, commit_seq);
                Ok(Response::Ok)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfigurationBuilder;
    use taro_api::model::{LockLevel, RootScope, RootType};
    use taro_api::remote::{BeginLockOutcome, BeginLockRequest, BindRootRequest, JoinRequest};
    use serde_json::json;

    async fn handler() -> RequestHandler {
        let config = ConfigurationBuilder::new().build().unwrap();
        let coordinator = Arc::new(Coordinator::new(config).await.unwrap());
        coordinator.start().await.unwrap();
        RequestHandler::new(coordinator)
    }

    #[tokio::test]
    async fn test_join_wires_push_stream() {
        let handler = handler().await;
        let response = handler
            .handle(Request::Join(JoinRequest {
                node_id: "a".to_string(),
            }))
            .await
            .unwrap();
        match response {
            Response::Joined(snapshot) => assert_eq!(snapshot.nodes.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(handler.take_push_stream("a").is_some());
        assert!(handler.take_push_stream("a").is_none());
    }

    #[tokio::test]
    async fn test_begin_and_bind_through_dispatch() {
        let handler = handler().await;
        handler
            .handle(Request::Join(JoinRequest {
                node_id: "a".to_string(),
            }))
            .await
            .unwrap();
        handler
            .handle(Request::SyncComplete {
                node_id: "a".to_string(),
            })
            .await
            .unwrap();

        let response = handler
            .handle(Request::BeginLock(BeginLockRequest {
                node_id: "a".to_string(),
                lock_id: "l".to_string(),
                level: LockLevel::Write,
                greedy: false,
            }))
            .await
            .unwrap();
        assert!(matches!(
            response,
            Response::BeginLock(BeginLockOutcome::Granted)
        ));

        let response = handler
            .handle(Request::BindRoot(BindRootRequest {
                node_id: "a".to_string(),
                scope: RootScope::Instance,
                root: "m".to_string(),
                root_type: RootType::Map,
                initial: json!({}),
            }))
            .await
            .unwrap();
        assert!(matches!(response, Response::Ok));

        // Conflicting rebind surfaces the typed error through dispatch
        let err = handler
            .handle(Request::BindRoot(BindRootRequest {
                node_id: "a".to_string(),
                scope: RootScope::Instance,
                root: "m".to_string(),
                root_type: RootType::List,
                initial: json!([]),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, TaroError::TypeConflict { .. }));
    }
}

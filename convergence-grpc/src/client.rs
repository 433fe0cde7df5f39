// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Outbound dispatch: anycast casts of `check_resource` to any known worker (spec §4.4's "cast
//! ... over the topic — any engine may pick it up"), directed casts of `cancel_check_resource` to
//! one specific engine, and the bounded `EngineListener.listening()` liveness probe (spec §4.3.2).
//! A real topic bus (AMQP/Kafka-backed `cast`) is out of scope; addressing is instead resolved
//! through an `EngineDirectory` of known peer endpoints, which is what a service-discovery layer
//! would otherwise populate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::transport::Channel;

use convergence_checker::{CheckResourceDispatcher, EngineLiveness};
use convergence_model::{ConvergenceError, EngineId, ResourceId, SenderKey, StackId, TraversalId};

use crate::proto::engine_listener_client::EngineListenerClient;
use crate::proto::engine_worker_client::EngineWorkerClient;
use crate::proto::{CancelCheckResourceRequest, CheckResourceRequest, ListeningRequest};
use crate::wire::{encode_input_data, encode_optional};

/// Casting a `cancel_check_resource` is directed at one specific engine (spec §4.5), unlike
/// `check_resource`'s anycast. Kept as its own trait because the call site (stopping a traversal)
/// is in `convergence-worker`, not `convergence-checker`.
#[async_trait]
pub trait CancelDispatcher: Send + Sync {
    fn cast_cancel_check_resource(&self, stack_id: StackId, engine_id: EngineId);
}

/// Resolves engine ids and anycast targets to network endpoints. A production deployment backs
/// this with whatever service discovery the fleet uses; `StaticDirectory` is the simplest
/// correct implementation — a fixed, operator-supplied peer list — and is enough for a
/// single-AZ or statically-configured fleet.
pub trait EngineDirectory: Send + Sync {
    /// Any currently known `EngineWorker` endpoint, for an anycast `check_resource` cast.
    fn any_worker_endpoint(&self) -> Option<String>;
    /// The `EngineWorker` endpoint for one specific engine, for a directed `cancel_check_resource`.
    fn worker_endpoint_for(&self, engine_id: EngineId) -> Option<String>;
    /// The `EngineListener` endpoint for one specific engine (a distinct bind address, §4.5).
    fn listener_endpoint_for(&self, engine_id: EngineId) -> Option<String>;
}

/// A fixed map of `engine_id -> (worker_addr, listener_addr)`, populated at startup from
/// configuration or a control-plane registration call.
#[derive(Default)]
pub struct StaticDirectory {
    peers: DashMap<EngineId, (String, String)>,
    round_robin: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine_id: EngineId, worker_addr: String, listener_addr: String) {
        self.peers.insert(engine_id, (worker_addr, listener_addr));
    }

    pub fn deregister(&self, engine_id: EngineId) {
        self.peers.remove(&engine_id);
    }
}

impl EngineDirectory for StaticDirectory {
    fn any_worker_endpoint(&self) -> Option<String> {
        if self.peers.is_empty() {
            return None;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        self.peers.iter().nth(idx).map(|e| e.value().0.clone())
    }

    fn worker_endpoint_for(&self, engine_id: EngineId) -> Option<String> {
        self.peers.get(&engine_id).map(|e| e.value().0.clone())
    }

    fn listener_endpoint_for(&self, engine_id: EngineId) -> Option<String> {
        self.peers.get(&engine_id).map(|e| e.value().1.clone())
    }
}

async fn worker_client(
    endpoint: &str,
) -> Result<EngineWorkerClient<Channel>, tonic::transport::Error> {
    let channel = Channel::from_shared(endpoint.to_string())
        .expect("endpoint must be a valid URI")
        .connect()
        .await?;
    Ok(EngineWorkerClient::new(channel))
}

async fn listener_client(
    endpoint: &str,
) -> Result<EngineListenerClient<Channel>, tonic::transport::Error> {
    let channel = Channel::from_shared(endpoint.to_string())
        .expect("endpoint must be a valid URI")
        .connect()
        .await?;
    Ok(EngineListenerClient::new(channel))
}

/// The production `CheckResourceDispatcher`/`CancelDispatcher`: resolves a target endpoint
/// through an `EngineDirectory` and fires the RPC on a detached task, matching the cast
/// semantics of spec §4.4 — the caller never awaits the callee's effects, only (implicitly) that
/// the connection attempt was made.
pub struct GrpcDispatcher<D> {
    directory: std::sync::Arc<D>,
}

impl<D> GrpcDispatcher<D> {
    pub fn new(directory: std::sync::Arc<D>) -> Self {
        Self { directory }
    }
}

impl<D: EngineDirectory + 'static> CheckResourceDispatcher for GrpcDispatcher<D> {
    fn cast_check_resource(
        &self,
        resource_id: ResourceId,
        traversal_id: TraversalId,
        data: std::collections::BTreeMap<SenderKey, Option<serde_json::Value>>,
        is_update: bool,
        adopt_stack_data: Option<serde_json::Value>,
    ) {
        let Some(endpoint) = self.directory.any_worker_endpoint() else {
            tracing::warn!(resource_id, "no known EngineWorker endpoint to cast check_resource to");
            return;
        };
        let input_data_json = match encode_input_data(&data) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(resource_id, error = %e, "failed to encode check_resource payload");
                return;
            }
        };
        let adopt_stack_data_json = encode_optional(&adopt_stack_data);

        tokio::spawn(async move {
            let request = CheckResourceRequest {
                resource_id,
                current_traversal: traversal_id.to_string(),
                input_data_json,
                is_update,
                adopt_stack_data_json,
                converge: false,
            };
            match worker_client(&endpoint).await {
                Ok(mut client) => {
                    if let Err(e) = client.check_resource(request).await {
                        tracing::warn!(resource_id, %endpoint, error = %e, "check_resource cast failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(resource_id, %endpoint, error = %e, "could not connect to cast check_resource");
                }
            }
        });
    }
}

impl<D: EngineDirectory + 'static> CancelDispatcher for GrpcDispatcher<D> {
    fn cast_cancel_check_resource(&self, stack_id: StackId, engine_id: EngineId) {
        let Some(endpoint) = self.directory.worker_endpoint_for(engine_id) else {
            tracing::warn!(%stack_id, %engine_id, "no known endpoint for engine, cannot cast cancel");
            return;
        };
        tokio::spawn(async move {
            let request = CancelCheckResourceRequest {
                stack_id: stack_id.to_string(),
                engine_id: engine_id.to_string(),
            };
            match worker_client(&endpoint).await {
                Ok(mut client) => {
                    if let Err(e) = client.cancel_check_resource(request).await {
                        tracing::warn!(%stack_id, %engine_id, error = %e, "cancel_check_resource cast failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(%stack_id, %engine_id, error = %e, "could not connect to cast cancel_check_resource");
                }
            }
        });
    }
}

/// The production `EngineLiveness`: calls the peer's `EngineListener.listening()` with a bounded
/// timeout, treating any connection failure, RPC error, or timeout as "not alive" (spec §4.3.2 —
/// a dead-or-unreachable peer is indistinguishable for lock-stealing purposes).
pub struct GrpcLiveness<D> {
    directory: std::sync::Arc<D>,
    timeout: Duration,
}

impl<D> GrpcLiveness<D> {
    pub fn new(directory: std::sync::Arc<D>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }
}

#[async_trait]
impl<D: EngineDirectory + 'static> EngineLiveness for GrpcLiveness<D> {
    async fn is_alive(&self, engine_id: EngineId) -> bool {
        let Some(endpoint) = self.directory.listener_endpoint_for(engine_id) else {
            return false;
        };
        let probe = async {
            let mut client = listener_client(&endpoint).await.map_err(|_| ())?;
            client
                .listening(ListeningRequest {})
                .await
                .map(|r| r.into_inner().listening)
                .map_err(|_| ())
        };
        matches!(tokio::time::timeout(self.timeout, probe).await, Ok(Ok(true)))
    }
}

/// Exists only so call sites that need `convergence_model::ConvergenceError` out of a transport
/// failure (rather than silently reporting "not alive"/dropping a cast) have a conversion path
/// available.
pub fn transport_error(e: tonic::transport::Error) -> ConvergenceError {
    ConvergenceError::Other(format!("grpc transport error: {e}"))
}

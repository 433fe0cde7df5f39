// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Thin `tonic` service adapters: decode the wire request, call the domain handler, encode the
//! (empty) ack. All cast semantics live in the caller (`client`) — from the server's point of
//! view every RPC here is an ordinary unary call that happens to carry no meaningful reply.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::proto::engine_listener_server::EngineListener as EngineListenerService;
use crate::proto::engine_worker_server::EngineWorker as EngineWorkerService;
use crate::proto::{
    CancelCheckResourceAck, CancelCheckResourceRequest, CheckResourceAck, CheckResourceRequest,
    ListeningReply, ListeningRequest,
};
use crate::rpc::{EngineListenerRpc, EngineWorkerRpc};
use crate::wire::{decode_input_data, decode_optional};

/// Adapts an `EngineWorkerRpc` implementation onto `tonic`'s generated `EngineWorker` service
/// trait. Constructed once per process and registered with a `tonic::transport::Server`.
pub struct EngineWorkerGrpc<H> {
    handler: Arc<H>,
}

impl<H> EngineWorkerGrpc<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<H: EngineWorkerRpc + 'static> EngineWorkerService for EngineWorkerGrpc<H> {
    async fn check_resource(
        &self,
        request: Request<CheckResourceRequest>,
    ) -> Result<Response<CheckResourceAck>, Status> {
        let req = request.into_inner();
        let current_traversal = parse_uuid(&req.current_traversal)?;
        let data = decode_input_data(&req.input_data_json)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let adopt_stack_data = decode_optional(req.adopt_stack_data_json)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        self.handler
            .check_resource(
                req.resource_id,
                current_traversal,
                data,
                req.is_update,
                adopt_stack_data,
                req.converge,
            )
            .await
            .map_err(to_status)?;

        Ok(Response::new(CheckResourceAck {}))
    }

    async fn cancel_check_resource(
        &self,
        request: Request<CancelCheckResourceRequest>,
    ) -> Result<Response<CancelCheckResourceAck>, Status> {
        let req = request.into_inner();
        let stack_id = parse_uuid(&req.stack_id)?;
        let engine_id = parse_uuid(&req.engine_id)?;

        self.handler
            .cancel_check_resource(stack_id, engine_id)
            .await
            .map_err(to_status)?;

        Ok(Response::new(CancelCheckResourceAck {}))
    }
}

/// Adapts an `EngineListenerRpc` implementation onto the `EngineListener` service — a single
/// `listening()` method, served on a bind address distinct from `EngineWorker`'s (spec §4.5).
pub struct EngineListenerGrpc<H> {
    handler: Arc<H>,
}

impl<H> EngineListenerGrpc<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<H: EngineListenerRpc + 'static> EngineListenerService for EngineListenerGrpc<H> {
    async fn listening(
        &self,
        _request: Request<ListeningRequest>,
    ) -> Result<Response<ListeningReply>, Status> {
        Ok(Response::new(ListeningReply {
            listening: self.handler.listening().await,
        }))
    }
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid, Status> {
    s.parse()
        .map_err(|_| Status::invalid_argument(format!("not a UUID: {s}")))
}

fn to_status(err: convergence_model::ConvergenceError) -> Status {
    use convergence_model::ConvergenceError as E;
    match err {
        E::NotFound(msg) => Status::not_found(msg),
        E::UpdateInProgress { .. } => Status::failed_precondition(err.to_string()),
        E::CircularDependency { .. } => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

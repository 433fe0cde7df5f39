// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! The `convergence-engined` process: wires the Postgres-backed stores, the gRPC dispatch/
//! liveness seams, the in-memory graph cache, and the Worker Service into one running engine,
//! and serves `EngineWorker`/`EngineListener` on their two distinct bind addresses (spec §4.5)
//! until the process receives a shutdown signal.

mod driver;

use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tonic::transport::Server;

use convergence_checker::{CheckRunner, CheckerConfig};
use convergence_config::{Cli, EngineConfig};
use convergence_grpc::client::{GrpcDispatcher, GrpcLiveness, StaticDirectory};
use convergence_grpc::proto::engine_listener_server::EngineListenerServer;
use convergence_grpc::proto::engine_worker_server::EngineWorkerServer;
use convergence_grpc::server::{EngineListenerGrpc, EngineWorkerGrpc};
use convergence_store::pg::PgStore;
use convergence_syncpoint::pg::PgSyncPointStore;
use convergence_telemetry::{init_tracing, Metrics};
use convergence_worker::graph_store::InMemoryGraphStore;
use convergence_worker::{WorkerConfig, WorkerService};

/// Turns a `0.0.0.0:PORT`-style bind address into a loopback URI a same-host client can dial.
/// Single-node deployments self-register under this address as their only `EngineDirectory`
/// peer; a multi-node fleet instead populates `StaticDirectory` from a control-plane
/// registration call, which is the extension point this stands in for.
fn local_uri(bind_addr: &str) -> String {
    let port = bind_addr.rsplit(':').next().unwrap_or(bind_addr);
    format!("http://127.0.0.1:{port}")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = EngineConfig::load(&cli.config)?;
    let engine_id = config.resolve_engine_id()?;
    tracing::info!(%engine_id, "starting convergence-engined");

    let metrics = Arc::new(Metrics::new()?);

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    let resources: Arc<PgStore> = Arc::new(PgStore::new(pool.clone()));
    let stacks = resources.clone();
    let sync_points = Arc::new(PgSyncPointStore::new(pool));

    let directory = Arc::new(StaticDirectory::new());
    directory.register(
        engine_id,
        local_uri(&config.rpc_bind_addr),
        local_uri(&config.engine_listener_bind_addr),
    );
    let dispatcher = Arc::new(GrpcDispatcher::new(directory.clone()));
    let liveness = Arc::new(GrpcLiveness::new(directory, config.engine_life_check_timeout));

    let graphs = Arc::new(InMemoryGraphStore::new());

    let runner = Arc::new(CheckRunner {
        engine_id,
        resources,
        stacks,
        sync_points,
        graphs,
        drivers: Arc::new(driver::UnimplementedDriverFactory),
        dispatcher: dispatcher.clone(),
        liveness,
        rollback: Arc::new(driver::UnimplementedRollbackStarter),
        config: CheckerConfig {
            engine_life_check_timeout: config.engine_life_check_timeout,
        },
        metrics: Some(metrics.clone()),
    });

    let worker = Arc::new(WorkerService::new(
        runner,
        dispatcher,
        task_executor::Executor::new(),
        WorkerConfig {
            cancel_retries: config.cancel_retries,
            cancel_retry_wait: config.cancel_retry_wait,
        },
    ));

    let worker_addr = config.rpc_bind_addr.parse()?;
    let listener_addr = config.engine_listener_bind_addr.parse()?;

    let worker_server = Server::builder()
        .add_service(EngineWorkerServer::new(EngineWorkerGrpc::new(worker.clone())))
        .serve(worker_addr);
    let listener_server = Server::builder()
        .add_service(EngineListenerServer::new(EngineListenerGrpc::new(worker)))
        .serve(listener_addr);

    tracing::info!(%worker_addr, %listener_addr, "serving EngineWorker and EngineListener");
    tracing::debug!(families = metrics.render()?.lines().count(), "metrics registry ready for a scrape sidecar");

    tokio::select! {
        res = worker_server => res?,
        res = listener_server => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    Ok(())
}

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

//! Logging and metrics (SPEC_FULL §9.2). `init_tracing` wraps `tracing_subscriber`'s layered
//! `EnvFilter` + `fmt::layer()` the way every service in the pack does process-wide logging
//! setup; it is the Rust-native analogue of heat's `LOG.exception`-plus-`oslo.log` story, not a
//! port of pants' PyO3-log-bridging `PantsLogger`, which has no counterpart here. `Metrics`
//! registers the counters/histograms named in SPEC_FULL §9.2 against a `prometheus::Registry`,
//! mirroring the metrics surface `golem-shard-manager`/`golem-worker-executor-base` expose.

use std::sync::Arc;

use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("failed to install global tracing subscriber: {0}")]
    Subscriber(String),
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Installs a process-wide `tracing` subscriber: `RUST_LOG`-driven `EnvFilter` (defaulting to
/// `info`) plus a structured `fmt` layer. Call once, at process start.
pub fn init_tracing() -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// The engine's metrics surface (SPEC_FULL §9.2): nodes checked, propagations performed,
/// sync-point CAS retries, replacements created, lock steals, and stack outcomes by status.
/// Cloned handles share the same underlying `prometheus` collectors via `Arc`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub nodes_checked: IntCounterVec,
    pub propagations: IntCounterVec,
    pub sync_point_cas_retries: IntCounterVec,
    pub replacements_created: IntCounterVec,
    pub lock_steals: IntCounterVec,
    pub stack_outcomes: IntCounterVec,
    pub check_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let nodes_checked = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_nodes_checked_total",
                "Convergence nodes processed by the Check-Runner",
            ),
            &["is_update"],
        )?;
        let propagations = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_propagations_total",
                "Successor sync-point contributions written",
            ),
            &["ready"],
        )?;
        let sync_point_cas_retries = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_sync_point_cas_retries_total",
                "Sync-point atomic_key CAS conflicts requiring a retry",
            ),
            &["entity"],
        )?;
        let replacements_created = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_replacements_created_total",
                "Replacement resource rows created on UpdateReplace",
            ),
            &["resource_type"],
        )?;
        let lock_steals = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_lock_steals_total",
                "Resource locks stolen from a dead peer engine",
            ),
            &["reason"],
        )?;
        let stack_outcomes = IntCounterVec::new(
            prometheus::Opts::new(
                "convergence_stack_outcomes_total",
                "Stack traversals reaching a terminal status",
            ),
            &["action", "status"],
        )?;
        let check_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "convergence_check_duration_seconds",
                "Wall time spent in one Check-Runner invocation",
            ),
            &["is_update"],
        )?;

        registry.register(Box::new(nodes_checked.clone()))?;
        registry.register(Box::new(propagations.clone()))?;
        registry.register(Box::new(sync_point_cas_retries.clone()))?;
        registry.register(Box::new(replacements_created.clone()))?;
        registry.register(Box::new(lock_steals.clone()))?;
        registry.register(Box::new(stack_outcomes.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            nodes_checked,
            propagations,
            sync_point_cas_retries,
            replacements_created,
            lock_steals,
            stack_outcomes,
            check_duration,
        })
    }

    /// Renders the registry in Prometheus text exposition format, for a `/metrics` endpoint.
    pub fn render(&self) -> Result<String, TelemetryError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// A process-wide handle, constructed once at startup and cloned into every component that
/// reports metrics (the Worker Service, the Check-Runner's call sites).
pub type SharedMetrics = Arc<Metrics>;

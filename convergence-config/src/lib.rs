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

//! Engine configuration (SPEC_FULL §9.1). Layered the way pants' `options` crate layers
//! `config.rs`/`env.rs`/`flags.rs` sources into one merged `OptionsSource`, simplified here to a
//! single-binary service rather than a CLI-flag framework: built-in defaults, then a TOML file,
//! then `CONVERGENCE_`-prefixed environment variables, each layer overriding the last.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// The thin CLI surface every `convergence-engined` process accepts, mirroring how pants'
/// `client`/`process_executor` binaries take a handful of `clap`-parsed flags rather than a full
/// options framework.
#[derive(Parser, Debug)]
#[command(name = "convergence-engined", about = "Convergence engine worker process")]
pub struct Cli {
    /// Path to a TOML config file. Defaults to `/etc/convergence-engine/engine.toml`; missing is
    /// not an error, only environment variables and built-in defaults apply.
    #[arg(long, default_value = "/etc/convergence-engine/engine.toml")]
    pub config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("failed to persist generated engine id to {path}: {source}")]
    PersistEngineId {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Operator-facing configuration for one engine process (SPEC_FULL §9.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: String,
    pub rpc_bind_addr: String,
    pub engine_listener_bind_addr: String,
    /// Defaults to a generated UUID persisted to `engine_id_file`, akin to heat's per-process
    /// `engine_id`. `None` here means "not yet resolved"; `resolve_engine_id` fills it in.
    pub engine_id: Option<uuid::Uuid>,
    pub engine_id_file: PathBuf,
    pub cancel_retries: u32,
    #[serde(with = "duration_secs")]
    pub cancel_retry_wait: Duration,
    #[serde(with = "duration_secs")]
    pub engine_life_check_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub stale_lock_retry_max_wait: Duration,
    pub rpc_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/convergence".to_string(),
            rpc_bind_addr: "0.0.0.0:7233".to_string(),
            engine_listener_bind_addr: "0.0.0.0:7234".to_string(),
            engine_id: None,
            engine_id_file: PathBuf::from("/var/lib/convergence-engine/engine_id"),
            cancel_retries: 3,
            cancel_retry_wait: Duration::from_secs(5),
            engine_life_check_timeout: Duration::from_secs(2),
            stale_lock_retry_max_wait: Duration::from_secs(60),
            rpc_topic: "engine_worker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Layers built-in defaults, `path` (if it exists), then `CONVERGENCE_`-prefixed environment
    /// variables, highest priority last.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("CONVERGENCE_"));
        Ok(figment.extract()?)
    }

    /// Resolves `engine_id`: if configured explicitly (file or env), use it; otherwise mint a
    /// fresh one and persist it to `engine_id_file` so the same process identity survives a
    /// restart on the same host.
    pub fn resolve_engine_id(&mut self) -> Result<uuid::Uuid, ConfigError> {
        if let Some(id) = self.engine_id {
            return Ok(id);
        }
        if let Ok(contents) = std::fs::read_to_string(&self.engine_id_file) {
            if let Ok(id) = contents.trim().parse() {
                self.engine_id = Some(id);
                return Ok(id);
            }
        }
        let id = uuid::Uuid::new_v4();
        if let Some(parent) = self.engine_id_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut file = std::fs::File::create(&self.engine_id_file).map_err(|source| {
            ConfigError::PersistEngineId {
                path: self.engine_id_file.clone(),
                source,
            }
        })?;
        write!(file, "{id}").map_err(|source| ConfigError::PersistEngineId {
            path: self.engine_id_file.clone(),
            source,
        })?;
        self.engine_id = Some(id);
        Ok(id)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_file_or_env() {
        let config = EngineConfig::load(Path::new("/nonexistent/engine.toml")).unwrap();
        assert_eq!(config.rpc_topic, "engine_worker");
        assert_eq!(config.cancel_retries, 3);
    }

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CONVERGENCE_RPC_TOPIC", "custom_topic");
            jail.set_env("CONVERGENCE_CANCEL_RETRIES", "7");
            let config = EngineConfig::load(Path::new("/nonexistent/engine.toml")).unwrap();
            assert_eq!(config.rpc_topic, "custom_topic");
            assert_eq!(config.cancel_retries, 7);
            Ok(())
        });
    }

    #[test]
    fn toml_file_overrides_defaults_and_env_overrides_the_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "engine.toml",
                r#"
                rpc_bind_addr = "0.0.0.0:9000"
                cancel_retries = 5
                "#,
            )?;
            let config = EngineConfig::load(Path::new("engine.toml")).unwrap();
            assert_eq!(config.rpc_bind_addr, "0.0.0.0:9000");
            assert_eq!(config.cancel_retries, 5);

            jail.set_env("CONVERGENCE_CANCEL_RETRIES", "9");
            let config = EngineConfig::load(Path::new("engine.toml")).unwrap();
            assert_eq!(config.cancel_retries, 9);
            Ok(())
        });
    }

    #[test]
    fn resolve_engine_id_persists_generated_id_across_loads() {
        figment::Jail::expect_with(|jail| {
            let mut config = EngineConfig::default();
            config.engine_id_file = jail.directory().join("engine_id");
            let first = config.resolve_engine_id().unwrap();

            let mut reloaded = EngineConfig::default();
            reloaded.engine_id_file = config.engine_id_file.clone();
            let second = reloaded.resolve_engine_id().unwrap();

            assert_eq!(first, second);
            Ok(())
        });
    }
}

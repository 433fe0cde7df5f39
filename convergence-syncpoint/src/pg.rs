// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `sqlx`/Postgres-backed `SyncPointStore`, following the same record-struct-plus-pool shape as
//! `convergence-store::pg`. `input_data`/`extra_data` are stored as `jsonb`; `SenderKey` map keys
//! go through their `to_wire()`/`from_wire()` string form since JSON object keys must be strings.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use convergence_model::{
    ConvergenceError, SenderKey, StackId, SyncPoint, SyncPointExtra, SyncPointKey,
    SyncPointKeyOwned, TraversalId,
};

use crate::SyncPointStore;

fn encode_input_data(
    data: &BTreeMap<SenderKey, Option<serde_json::Value>>,
) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(k, v)| (k.to_wire(), v.clone().unwrap_or(serde_json::Value::Null)))
        .collect();
    serde_json::Value::Object(map)
}

fn decode_input_data(
    value: serde_json::Value,
) -> Result<BTreeMap<SenderKey, Option<serde_json::Value>>, ConvergenceError> {
    let serde_json::Value::Object(map) = value else {
        return Err(ConvergenceError::Other(
            "sync_point.input_data is not a JSON object".to_string(),
        ));
    };
    map.into_iter()
        .map(|(k, v)| {
            let key = SenderKey::from_wire(&k).ok_or_else(|| {
                ConvergenceError::Other(format!("bad sender key in input_data: {k}"))
            })?;
            let value = if v.is_null() { None } else { Some(v) };
            Ok((key, value))
        })
        .collect()
}

#[derive(sqlx::FromRow, Debug, Clone)]
struct SyncPointRow {
    stack_id: Uuid,
    entity_id: i64,
    traversal_id: Uuid,
    is_update: bool,
    atomic_key: i64,
    input_data: serde_json::Value,
    extra_data: serde_json::Value,
}

impl TryFrom<SyncPointRow> for SyncPoint {
    type Error = ConvergenceError;

    fn try_from(row: SyncPointRow) -> Result<Self, Self::Error> {
        let input_data = decode_input_data(row.input_data)?;
        let extra_data: SyncPointExtra = serde_json::from_value(row.extra_data)
            .map_err(|e| ConvergenceError::Other(format!("bad sync_point.extra_data: {e}")))?;
        Ok(Self {
            stack_id: row.stack_id,
            key: SyncPointKeyOwned {
                entity_id: row.entity_id,
                traversal_id: row.traversal_id,
                is_update: row.is_update,
            },
            atomic_key: row.atomic_key,
            input_data,
            extra_data,
        })
    }
}

/// `SyncPointStore` backed by a single Postgres pool. Shares a pool with `convergence-store`'s
/// `PgStore` in production; kept as its own type since `convergence-syncpoint` has no dependency
/// on `convergence-store`.
pub struct PgSyncPointStore {
    pool: PgPool,
}

impl PgSyncPointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncPointStore for PgSyncPointStore {
    async fn create(&self, stack_id: StackId, key: SyncPointKey) -> Result<(), ConvergenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_point (stack_id, entity_id, traversal_id, is_update, atomic_key, input_data, extra_data)
            VALUES ($1, $2, $3, $4, 0, '{}'::jsonb, $5)
            ON CONFLICT (entity_id, traversal_id, is_update) DO NOTHING
            "#,
        )
        .bind(stack_id)
        .bind(key.entity_id)
        .bind(key.traversal_id)
        .bind(key.is_update)
        .bind(serde_json::to_value(SyncPointExtra::default()).unwrap())
        .execute(&self.pool)
        .await
        .map_err(|e| ConvergenceError::Other(format!("sync_point create failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: SyncPointKey) -> Result<SyncPoint, ConvergenceError> {
        let row = sqlx::query_as::<_, SyncPointRow>(
            "SELECT * FROM sync_point WHERE entity_id = $1 AND traversal_id = $2 AND is_update = $3",
        )
        .bind(key.entity_id)
        .bind(key.traversal_id)
        .bind(key.is_update)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConvergenceError::Other(format!("sync_point lookup failed: {e}")))?
        .ok_or_else(|| ConvergenceError::NotFound(format!("sync point {key:?}")))?;
        row.try_into()
    }

    async fn delete_all(
        &self,
        stack_id: StackId,
        traversal_id: TraversalId,
    ) -> Result<(), ConvergenceError> {
        sqlx::query("DELETE FROM sync_point WHERE stack_id = $1 AND traversal_id = $2")
            .bind(stack_id)
            .bind(traversal_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ConvergenceError::Other(format!("sync_point delete_all failed: {e}")))?;
        Ok(())
    }

    async fn update_input_data(
        &self,
        key: SyncPointKey,
        expected_atomic_key: i64,
        input_data: BTreeMap<SenderKey, Option<serde_json::Value>>,
        extra_data: SyncPointExtra,
    ) -> Result<bool, ConvergenceError> {
        let input_data_json = encode_input_data(&input_data);
        let extra_data_json = serde_json::to_value(&extra_data)
            .map_err(|e| ConvergenceError::Other(format!("encode extra_data: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE sync_point
            SET atomic_key = atomic_key + 1, input_data = $5, extra_data = $6
            WHERE entity_id = $1 AND traversal_id = $2 AND is_update = $3 AND atomic_key = $4
            "#,
        )
        .bind(key.entity_id)
        .bind(key.traversal_id)
        .bind(key.is_update)
        .bind(expected_atomic_key)
        .bind(input_data_json)
        .bind(extra_data_json)
        .execute(&self.pool)
        .await
        .map_err(|e| ConvergenceError::Other(format!("sync_point CAS update failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}

//! Database query functions for the `flows` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Flow, FlowEngine};
use crate::{Error, Result};

/// Insert a new flow template.
pub async fn insert_flow(
    pool: &PgPool,
    name: &str,
    parameters_schema: &serde_json::Value,
    engine: FlowEngine,
    code_location: &str,
    entrypoint: &str,
    default_max_retries: i32,
) -> Result<Flow> {
    let flow = sqlx::query_as::<_, Flow>(
        "INSERT INTO flows (name, parameters_schema, engine, code_location, entrypoint, default_max_retries) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(name)
    .bind(parameters_schema)
    .bind(engine)
    .bind(code_location)
    .bind(entrypoint)
    .bind(default_max_retries)
    .fetch_one(pool)
    .await?;

    Ok(flow)
}

/// Fetch a single flow by ID.
pub async fn get_flow(pool: &PgPool, id: Uuid) -> Result<Flow> {
    sqlx::query_as::<_, Flow>("SELECT * FROM flows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(Error::NotFound)
}

/// List every flow, ordered by creation time.
pub async fn list_flows(pool: &PgPool) -> Result<Vec<Flow>> {
    let flows = sqlx::query_as::<_, Flow>("SELECT * FROM flows ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;

    Ok(flows)
}

//! `gridflow flow` commands: register, list, and show flow templates.
//!
//! Read a flow definition from disk, insert it, and print a summary -- the
//! registered flow's `code_location` then points at a *second* TOML file,
//! the task graph, which `gridflow-core::catalog` reads and templates at
//! flow-run time.

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use gridflow_db::models::{Flow, FlowEngine};
use gridflow_db::queries::flows;

/// On-disk shape of a flow registration file (`gridflow flow register <file>`).
/// Distinct from the task-graph TOML a flow's `code_location` points at --
/// this one describes the flow template row itself.
#[derive(Debug, Deserialize)]
struct FlowDefinitionToml {
    flow: FlowDefinition,
}

#[derive(Debug, Deserialize)]
struct FlowDefinition {
    name: String,
    #[serde(default = "default_parameters_schema")]
    parameters_schema: serde_json::Value,
    #[serde(default = "default_engine")]
    engine: FlowEngine,
    code_location: String,
    #[serde(default = "default_entrypoint")]
    entrypoint: String,
    #[serde(default = "default_max_retries")]
    default_max_retries: i32,
}

fn default_parameters_schema() -> serde_json::Value {
    serde_json::json!({})
}

fn default_engine() -> FlowEngine {
    FlowEngine::Process
}

fn default_entrypoint() -> String {
    "main".to_string()
}

fn default_max_retries() -> i32 {
    3
}

/// `gridflow flow register <file>`: parse a flow definition TOML and insert
/// the template row.
pub async fn run_register(pool: &PgPool, file_path: &str) -> Result<()> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read flow definition file: {file_path}"))?;
    let parsed: FlowDefinitionToml = toml::from_str(&content)
        .with_context(|| format!("failed to parse flow definition from {file_path}"))?;
    let def = parsed.flow;

    let flow = flows::insert_flow(
        pool,
        &def.name,
        &def.parameters_schema,
        def.engine,
        &def.code_location,
        &def.entrypoint,
        def.default_max_retries,
    )
    .await?;

    println!("Flow registered.");
    println!();
    print_flow(&flow);

    Ok(())
}

/// `gridflow flow list`: every registered flow template.
pub async fn run_list(pool: &PgPool) -> Result<()> {
    let all = flows::list_flows(pool).await?;

    if all.is_empty() {
        println!("No flows registered. Use `gridflow flow register <file>` to add one.");
        return Ok(());
    }

    let id_w = 36;
    let name_w = all.iter().map(|f| f.name.len()).max().unwrap_or(4).max(4);

    println!("{:<id_w$}  {:<name_w$}  {:<9}  ENTRYPOINT", "ID", "NAME", "ENGINE");
    for flow in &all {
        println!(
            "{:<id_w$}  {:<name_w$}  {:<9}  {}",
            flow.id, flow.name, flow.engine, flow.entrypoint
        );
    }

    Ok(())
}

/// `gridflow flow show <flow-id>`: full detail for one flow template.
pub async fn run_show(pool: &PgPool, flow_id_str: &str) -> Result<()> {
    let flow_id =
        Uuid::parse_str(flow_id_str).with_context(|| format!("invalid flow ID: {flow_id_str}"))?;
    let flow = flows::get_flow(pool, flow_id).await?;
    print_flow(&flow);
    Ok(())
}

fn print_flow(flow: &Flow) {
    println!("Flow: {}", flow.name);
    println!("  ID:                 {}", flow.id);
    println!("  Engine:             {}", flow.engine);
    println!("  Code location:      {}", flow.code_location);
    println!("  Entrypoint:         {}", flow.entrypoint);
    println!("  Default max retries: {}", flow.default_max_retries);
    println!(
        "  Created:            {}",
        flow.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  Parameters schema:  {}",
        flow.parameters_schema
    );
}

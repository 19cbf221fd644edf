//! Task DAG materialization.
//!
//! A flow's task graph is declared as TOML alongside its code
//! (`Flow::code_location`) -- one `[[tasks]]` table per task, `depends_on`
//! naming sibling tasks. Materialization parses that file, validates it as
//! a DAG (duplicate names, unknown dependencies, cycles), and templates
//! each task's `entrypoint`
//! against the flow-run's `parameters` so the same flow definition produces
//! a deterministic graph for a given `(flow_id, parameters)` pair. The
//! result is immutable from the moment it is returned: nothing in this
//! crate ever mutates a `FlowGraph` in place.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One task declaration as it appears in a flow's graph TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskSpec {
    pub name: String,
    pub entrypoint: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides `Flow::default_max_retries` for this task when present.
    pub max_retries: Option<i32>,
}

/// Raw deserialization target for a flow's graph TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphToml {
    #[serde(default, rename = "tasks")]
    pub tasks: Vec<TaskSpec>,
}

/// A single task within a materialized [`FlowGraph`], after parameter
/// templating and topological-depth assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub name: String,
    pub entrypoint: String,
    pub depends_on: Vec<String>,
    pub max_retries: i32,
    /// Longest path from a root task to this one; used for the ready-set
    /// tie-break rule (depth ascending, then name lexicographic).
    pub depth: u32,
}

/// A validated, acyclic task graph for one flow-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowGraph {
    nodes: Vec<TaskNode>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

impl FlowGraph {
    /// All task nodes, in declaration order (not topological order).
    pub fn tasks(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|t| t.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependents of `name` (tasks that declare it in `depends_on`).
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TaskNode> {
        self.nodes
            .iter()
            .filter(move |t| t.depends_on.iter().any(|d| d == name))
    }

    /// Every task whose every dependency is present in `succeeded`, and
    /// which is itself not already in `succeeded`. Ordered by topological
    /// depth ascending, then name lexicographic.
    pub fn ready_set<'a>(
        &'a self,
        pending: &HashSet<&str>,
        succeeded: &HashSet<&str>,
    ) -> Vec<&'a TaskNode> {
        let mut ready: Vec<&TaskNode> = self
            .nodes
            .iter()
            .filter(|t| pending.contains(t.name.as_str()))
            .filter(|t| t.depends_on.iter().all(|d| succeeded.contains(d.as_str())))
            .collect();
        ready.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.name.cmp(&b.name)));
        ready
    }
}

/// Parse and validate a flow graph TOML string, without parameter
/// templating. Used directly by unit tests and by [`materialize`].
pub fn parse_graph(content: &str) -> Result<FlowGraph, GraphError> {
    let raw: GraphToml = toml::from_str(content)?;
    validate_and_build(raw.tasks)
}

/// Deterministically materialize a flow's task graph for a given set of
/// flow-run parameters.
///
/// `graph_toml` is the flow's declared TOML (read from `code_location` by
/// the caller); `parameters` supplies `{{key}}` substitutions applied to
/// each task's `entrypoint` before parsing resumes below -- substitution
/// happens on the raw string so a parameter can never introduce a new task
/// or dependency edge, only change an entrypoint's templated arguments.
pub fn materialize(graph_toml: &str, parameters: &serde_json::Value) -> Result<FlowGraph, GraphError> {
    let templated = template_entrypoints(graph_toml, parameters);
    parse_graph(&templated)
}

/// Replace every `{{key}}` occurrence with the stringified value of
/// `parameters[key]` (objects/arrays render as compact JSON, scalars
/// render unquoted). Keys absent from `parameters` are left untouched so a
/// malformed reference surfaces later as an entrypoint the worker can't
/// resolve, rather than silently producing an empty string.
fn template_entrypoints(content: &str, parameters: &serde_json::Value) -> String {
    let Some(map) = parameters.as_object() else {
        return content.to_string();
    };

    let mut out = content.to_string();
    for (key, value) in map {
        let needle = format!("{{{{{key}}}}}");
        if !out.contains(&needle) {
            continue;
        }
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

fn validate_and_build(tasks: Vec<TaskSpec>) -> Result<FlowGraph, GraphError> {
    if tasks.is_empty() {
        return Ok(FlowGraph { nodes: Vec::new() });
    }

    let mut seen = HashSet::new();
    for t in &tasks {
        if !seen.insert(t.name.as_str()) {
            return Err(GraphError::DuplicateTaskName(t.name.clone()));
        }
    }

    for t in &tasks {
        for dep in &t.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    task: t.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let name_to_idx: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    let n = tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for t in &tasks {
        let idx = name_to_idx[t.name.as_str()];
        for dep in &t.depends_on {
            let dep_idx = name_to_idx[dep.as_str()];
            adj[dep_idx].push(idx);
            in_degree[idx] += 1;
        }
    }

    let mut depth = vec![0u32; n];
    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut remaining = in_degree.clone();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adj[node] {
            depth[next] = depth[next].max(depth[node] + 1);
            remaining[next] -= 1;
            if remaining[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let cyclic: Vec<&str> = remaining
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| tasks[i].name.as_str())
            .collect();
        return Err(GraphError::CycleDetected(cyclic.join(", ")));
    }

    let nodes = tasks
        .into_iter()
        .enumerate()
        .map(|(i, t)| TaskNode {
            name: t.name,
            entrypoint: t.entrypoint,
            depends_on: t.depends_on,
            max_retries: t.max_retries.unwrap_or(-1),
            depth: depth[i],
        })
        .collect();

    Ok(FlowGraph { nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_graph_is_valid() {
        let graph = parse_graph("").unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn linear_chain_depths_increase() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"

[[tasks]]
name = "b"
entrypoint = "mod.b"
depends_on = ["a"]

[[tasks]]
name = "c"
entrypoint = "mod.c"
depends_on = ["b"]
"#;
        let graph = parse_graph(toml).unwrap();
        assert_eq!(graph.get("a").unwrap().depth, 0);
        assert_eq!(graph.get("b").unwrap().depth, 1);
        assert_eq!(graph.get("c").unwrap().depth, 2);
    }

    #[test]
    fn diamond_dependents_reach_d_only_after_both() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"

[[tasks]]
name = "b"
entrypoint = "mod.b"
depends_on = ["a"]

[[tasks]]
name = "c"
entrypoint = "mod.c"
depends_on = ["a"]

[[tasks]]
name = "d"
entrypoint = "mod.d"
depends_on = ["b", "c"]
"#;
        let graph = parse_graph(toml).unwrap();
        let pending: HashSet<&str> = ["b", "c", "d"].into_iter().collect();
        let succeeded: HashSet<&str> = ["a"].into_iter().collect();
        let ready = graph.ready_set(&pending, &succeeded);
        let names: Vec<&str> = ready.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);

        let pending_d: HashSet<&str> = ["d"].into_iter().collect();
        let succeeded_bc: HashSet<&str> = ["a", "b", "c"].into_iter().collect();
        let ready_d = graph.ready_set(&pending_d, &succeeded_bc);
        assert_eq!(ready_d.len(), 1);
        assert_eq!(ready_d[0].name, "d");
    }

    #[test]
    fn ready_set_orders_by_depth_then_name() {
        let toml = r#"
[[tasks]]
name = "z"
entrypoint = "mod.z"

[[tasks]]
name = "a"
entrypoint = "mod.a"
"#;
        let graph = parse_graph(toml).unwrap();
        let pending: HashSet<&str> = ["z", "a"].into_iter().collect();
        let succeeded: HashSet<&str> = HashSet::new();
        let ready = graph.ready_set(&pending, &succeeded);
        let names: Vec<&str> = ready.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
    }

    #[test]
    fn rejects_duplicate_task_names() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"

[[tasks]]
name = "a"
entrypoint = "mod.a2"
"#;
        let err = parse_graph(toml).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTaskName(n) if n == "a"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"
depends_on = ["missing"]
"#;
        let err = parse_graph(toml).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_direct_cycle() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"
depends_on = ["b"]

[[tasks]]
name = "b"
entrypoint = "mod.b"
depends_on = ["a"]
"#;
        let err = parse_graph(toml).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
    }

    #[test]
    fn materialize_templates_entrypoint_from_parameters() {
        let toml = r#"
[[tasks]]
name = "fetch"
entrypoint = "fetch --url {{url}}"
"#;
        let graph = materialize(toml, &json!({"url": "https://example.com"})).unwrap();
        assert_eq!(
            graph.get("fetch").unwrap().entrypoint,
            "fetch --url https://example.com"
        );
    }

    #[test]
    fn materialize_is_deterministic_for_same_parameters() {
        let toml = r#"
[[tasks]]
name = "fetch"
entrypoint = "fetch --n {{n}}"
"#;
        let params = json!({"n": 3});
        let a = materialize(toml, &params).unwrap();
        let b = materialize(toml, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn task_max_retries_defaults_to_sentinel_when_absent() {
        let toml = r#"
[[tasks]]
name = "a"
entrypoint = "mod.a"
"#;
        let graph = parse_graph(toml).unwrap();
        assert_eq!(graph.get("a").unwrap().max_retries, -1);
    }
}

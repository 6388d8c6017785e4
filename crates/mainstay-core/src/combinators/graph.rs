//! Directed acyclic task graphs
//!
//! Named nodes, explicit edges, a designated start and end. Cycles are
//! rejected at build time; resolution walks the topology in waves,
//! evaluating independent siblings concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::errors::ExecutionError;
use crate::runtime::WorkflowCtx;
use crate::task::Task;

/// Builder for [`Graph`]; `build` validates the topology.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<(String, Arc<Task>)>,
    edges: Vec<(String, String)>,
    start: Option<String>,
    end: Option<String>,
}

impl GraphBuilder {
    pub fn add_node(mut self, name: impl Into<String>, task: Task) -> Self {
        self.nodes.push((name.into(), Arc::new(task)));
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn start_with(mut self, node: impl Into<String>) -> Self {
        self.start = Some(node.into());
        self
    }

    pub fn end_with(mut self, node: impl Into<String>) -> Self {
        self.end = Some(node.into());
        self
    }

    pub fn build(self) -> Result<Graph, ExecutionError> {
        let node_names: HashSet<&str> = self.nodes.iter().map(|(n, _)| n.as_str()).collect();
        if node_names.len() != self.nodes.len() {
            return Err(invalid(&self.name, "duplicate node names"));
        }

        for (from, to) in &self.edges {
            for node in [from, to] {
                if !node_names.contains(node.as_str()) {
                    return Err(ExecutionError::TaskNotFound { name: node.clone() });
                }
            }
        }

        let start = self
            .start
            .ok_or_else(|| invalid(&self.name, "no start node designated"))?;
        let end = self
            .end
            .ok_or_else(|| invalid(&self.name, "no end node designated"))?;
        for node in [&start, &end] {
            if !node_names.contains(node.as_str()) {
                return Err(ExecutionError::TaskNotFound { name: node.clone() });
            }
        }

        let graph = Graph {
            name: self.name,
            nodes: self.nodes.into_iter().collect(),
            edges: self.edges,
            start,
            end,
        };
        graph.reject_cycles()?;
        Ok(graph)
    }
}

fn invalid(graph: &str, message: &str) -> ExecutionError {
    ExecutionError::TaskFailed {
        message: format!("graph '{graph}': {message}"),
        value: None,
    }
}

/// A validated DAG of tasks.
pub struct Graph {
    name: String,
    nodes: HashMap<String, Arc<Task>>,
    edges: Vec<(String, String)>,
    start: String,
    end: String,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            start: None,
            end: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn predecessors(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == node)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    /// Kahn's algorithm; leftover nodes mean a cycle.
    fn reject_cycles(&self) -> Result<Vec<Vec<String>>, ExecutionError> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        for (_, to) in &self.edges {
            *in_degree.get_mut(to.as_str()).expect("validated edge") += 1;
        }

        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut ready: Vec<&str> = {
            let mut ready: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(n, _)| *n)
                .collect();
            ready.sort();
            ready
        };
        let mut resolved = 0;

        while !ready.is_empty() {
            resolved += ready.len();
            waves.push(ready.iter().map(|n| n.to_string()).collect());

            let mut next: Vec<&str> = Vec::new();
            for node in ready.drain(..) {
                for (from, to) in &self.edges {
                    if from.as_str() == node {
                        let degree = in_degree.get_mut(to.as_str()).expect("validated edge");
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(to.as_str());
                        }
                    }
                }
            }
            next.sort();
            ready = next;
        }

        if resolved != self.nodes.len() {
            return Err(invalid(&self.name, "cycle detected"));
        }
        Ok(waves)
    }

    /// Resolve the graph: the start node receives `input`; every other node
    /// receives its predecessors' outputs (a single value for one
    /// predecessor, an array in edge order otherwise). Returns the end
    /// node's output.
    pub async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, ExecutionError> {
        let waves = self.reject_cycles()?;
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for wave in waves {
            let calls = wave.iter().map(|node| {
                let task = self.nodes.get(node).expect("validated node").clone();
                let args = self.node_args(node, &input, &outputs);
                async move { task.call(ctx, args).await }
            });

            let results = futures::future::try_join_all(calls).await?;
            for (node, result) in wave.into_iter().zip(results) {
                outputs.insert(node, result);
            }
        }

        outputs
            .remove(&self.end)
            .ok_or_else(|| invalid(&self.name, "end node produced no output"))
    }

    fn node_args(
        &self,
        node: &str,
        input: &Value,
        outputs: &HashMap<String, Value>,
    ) -> Vec<Value> {
        let preds = self.predecessors(node);
        match preds.len() {
            0 => {
                if node == self.start {
                    vec![input.clone()]
                } else {
                    vec![]
                }
            }
            1 => vec![outputs.get(preds[0]).cloned().unwrap_or(Value::Null)],
            _ => vec![Value::Array(
                preds
                    .iter()
                    .map(|p| outputs.get(*p).cloned().unwrap_or(Value::Null))
                    .collect(),
            )],
        }
    }
}

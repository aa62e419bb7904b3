use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::MessageKind;

use super::edge::{Edge, Predicate, Selector};
use super::executor::Executor;

/// An immutable, validated workflow graph.
pub struct Workflow {
    id: String,
    executors: HashMap<String, Arc<dyn Executor>>,
    executor_order: Vec<String>,
    edges: Vec<Edge>,
    start: String,
    /// Source id -> indices into `edges`, in declaration order.
    outgoing: HashMap<String, Vec<usize>>,
    /// Fan-in target -> its inbound sources, in declaration order.
    fan_in: HashMap<String, Vec<String>>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_executor_id(&self) -> &str {
        &self.start
    }

    pub fn executor(&self, id: &str) -> Option<&Arc<dyn Executor>> {
        self.executors.get(id)
    }

    /// Executor ids in declaration order.
    pub fn executor_ids(&self) -> &[String] {
        &self.executor_order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of `source`, in declaration order.
    pub fn outgoing_edges<'a>(&'a self, source: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing
            .get(source)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.outgoing_edges(source).any(|e| e.target == target)
    }

    /// Ordered inbound sources of a fan-in target.
    pub fn fan_in_sources(&self, target: &str) -> Option<&[String]> {
        self.fan_in.get(target).map(Vec::as_slice)
    }

    pub fn is_request_sink(&self, id: &str) -> bool {
        self.executors
            .get(id)
            .is_some_and(|e| e.is_request_sink())
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("executors", &self.executor_order)
            .field("edges", &self.edges)
            .field("start", &self.start)
            .finish()
    }
}

/// Fluent builder for [`Workflow`]. All checks run in [`build`](Self::build).
pub struct WorkflowBuilder {
    id: String,
    executors: Vec<Arc<dyn Executor>>,
    edges: Vec<Edge>,
    start: Vec<String>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executors: Vec::new(),
            edges: Vec::new(),
            start: Vec::new(),
        }
    }

    pub fn add_executor(self, executor: impl Executor) -> Self {
        self.add_executor_arc(Arc::new(executor))
    }

    pub fn add_executor_arc(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Designate the start executor. Calling this with two different ids is a
    /// validation error.
    pub fn set_start_executor(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.start.contains(&id) {
            self.start.push(id);
        }
        self
    }

    pub fn add_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::direct(source, target));
        self
    }

    pub fn add_conditional_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        self.edges.push(Edge::conditional(source, target, predicate));
        self
    }

    /// Self-loop used for retry/iteration on a single executor.
    pub fn add_loop_edge(mut self, node: impl Into<String>, predicate: Option<Predicate>) -> Self {
        self.edges.push(Edge::loop_back(node, predicate));
        self
    }

    pub fn add_fan_out_edges(mut self, source: impl Into<String>, targets: &[&str]) -> Self {
        let source = source.into();
        for target in targets {
            self.edges.push(Edge::fan_out(source.clone(), *target));
        }
        self
    }

    /// Declare a fan-in group: `target` runs once per complete set of
    /// deliveries, receiving a `Batch` ordered like `sources`.
    pub fn add_fan_in_edges(mut self, sources: &[&str], target: impl Into<String>) -> Self {
        let target = target.into();
        for source in sources {
            self.edges.push(Edge::fan_in(*source, target.clone()));
        }
        self
    }

    /// Route each message to the subset of `targets` the selector picks.
    pub fn add_multi_selection_edges(
        mut self,
        source: impl Into<String>,
        targets: &[&str],
        selector: Selector,
    ) -> Self {
        let source = source.into();
        let candidates: Arc<[String]> = targets.iter().map(|t| t.to_string()).collect();
        for target in targets {
            self.edges.push(Edge::selection(
                source.clone(),
                *target,
                selector,
                candidates.clone(),
            ));
        }
        self
    }

    pub fn add_edge_raw(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Workflow> {
        let invalid = |msg: String| StepflowError::GraphValidation(format!("{}: {}", self.id, msg));

        // Executors: unique ids, at least one handler each.
        let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        let mut executor_order = Vec::with_capacity(self.executors.len());
        for executor in &self.executors {
            let id = executor.id().to_string();
            if executor.accepts().is_empty() {
                return Err(invalid(format!("executor '{}' has no handlers", id)));
            }
            if executors.insert(id.clone(), executor.clone()).is_some() {
                return Err(invalid(format!("duplicate executor id '{}'", id)));
            }
            executor_order.push(id);
        }

        // Exactly one start executor, and it must exist.
        let start = match self.start.as_slice() {
            [] => return Err(invalid("no start executor".into())),
            [only] => only.clone(),
            many => {
                return Err(invalid(format!(
                    "duplicate start executor: {}",
                    many.join(", ")
                )))
            }
        };
        if !executors.contains_key(&start) {
            return Err(invalid(format!("start executor '{}' not found", start)));
        }

        // Edges: endpoints exist, no accidental self-loops, no duplicates.
        let mut seen = HashSet::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut fan_in: HashMap<String, Vec<String>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            for endpoint in [&edge.source, &edge.target] {
                if !executors.contains_key(endpoint) {
                    return Err(invalid(format!(
                        "edge {} -> {} references unknown executor '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
            if edge.source == edge.target && !edge.loop_back {
                return Err(invalid(format!(
                    "self-loop on '{}' must be declared with add_loop_edge",
                    edge.source
                )));
            }
            if !seen.insert((edge.source.clone(), edge.target.clone())) {
                return Err(invalid(format!(
                    "duplicate edge {} -> {}",
                    edge.source, edge.target
                )));
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            if edge.is_fan_in() {
                fan_in
                    .entry(edge.target.clone())
                    .or_default()
                    .push(edge.source.clone());
            }
        }

        // Fan-in targets must take the aggregated batch.
        for target in fan_in.keys() {
            let accepts_batch = executors
                .get(target)
                .is_some_and(|e| e.accepts().contains(&MessageKind::Batch));
            if !accepts_batch {
                return Err(invalid(format!(
                    "fan-in target '{}' has no handler for batch messages",
                    target
                )));
            }
        }

        // Request-info sinks need a declared way back to every requester.
        for edge in &self.edges {
            let into_sink = executors
                .get(&edge.target)
                .is_some_and(|e| e.is_request_sink());
            if into_sink && !seen.contains(&(edge.target.clone(), edge.source.clone())) {
                return Err(invalid(format!(
                    "request sink '{}' has no return edge to '{}'",
                    edge.target, edge.source
                )));
            }
        }

        debug!(
            workflow_id = %self.id,
            executors = executors.len(),
            edges = self.edges.len(),
            fan_in_groups = fan_in.len(),
            "Workflow validated"
        );

        Ok(Workflow {
            id: self.id,
            executors,
            executor_order,
            edges: self.edges,
            start,
            outgoing,
            fan_in,
        })
    }
}

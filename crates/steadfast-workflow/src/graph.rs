//! Graph workflows: a validated DAG of phases and control nodes.

use crate::branch::Branch;
use crate::phase::{Phase, PhaseExecution};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use steadfast_core::OperationError;
use steadfast_executor::SharedBuffer;

/// When an edge may be followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeCondition {
    Always,
    /// The source node succeeded.
    OnSuccess,
    /// The source node failed.
    OnFailure,
    /// The source conditional produced this routing label.
    Custom(String),
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
}

/// Inputs handed to a conditional node's chooser.
pub struct ConditionalInput {
    pub history: Vec<PhaseExecution>,
    pub buffer: Option<SharedBuffer>,
    /// Whether the most recently executed node succeeded.
    pub last_success: bool,
}

/// A user function returning the next node id, or a label matched against
/// this node's `Custom` edges.
pub type ConditionalFn = Arc<
    dyn Fn(ConditionalInput) -> BoxFuture<'static, Result<String, OperationError>> + Send + Sync,
>;

/// One node in a graph workflow.
pub enum GraphNode<T> {
    Phase(Phase<T>),
    Conditional { id: String, chooser: ConditionalFn },
    /// Runs a fixed set of phase nodes in parallel; succeeds when all do.
    ParallelGroup { id: String, children: Vec<String> },
    /// Synchronisation marker before proceeding.
    MergePoint { id: String },
    Branch(Branch<T>),
}

impl<T> GraphNode<T> {
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Phase(phase) => &phase.id,
            GraphNode::Conditional { id, .. } => id,
            GraphNode::ParallelGroup { id, .. } => id,
            GraphNode::MergePoint { id } => id,
            GraphNode::Branch(branch) => &branch.id,
        }
    }
}

impl<T> Clone for GraphNode<T> {
    fn clone(&self) -> Self {
        match self {
            GraphNode::Phase(phase) => GraphNode::Phase(phase.clone()),
            GraphNode::Conditional { id, chooser } => GraphNode::Conditional {
                id: id.clone(),
                chooser: Arc::clone(chooser),
            },
            GraphNode::ParallelGroup { id, children } => GraphNode::ParallelGroup {
                id: id.clone(),
                children: children.clone(),
            },
            GraphNode::MergePoint { id } => GraphNode::MergePoint { id: id.clone() },
            GraphNode::Branch(branch) => GraphNode::Branch(branch.clone()),
        }
    }
}

impl<T> fmt::Debug for GraphNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Phase(phase) => write!(f, "Phase({})", phase.id),
            GraphNode::Conditional { id, .. } => write!(f, "Conditional({id})"),
            GraphNode::ParallelGroup { id, children } => {
                write!(f, "ParallelGroup({id}, {} children)", children.len())
            }
            GraphNode::MergePoint { id } => write!(f, "MergePoint({id})"),
            GraphNode::Branch(branch) => write!(f, "Branch({})", branch.id),
        }
    }
}

/// A validated workflow DAG.
pub struct WorkflowGraph<T> {
    pub(crate) nodes: HashMap<String, GraphNode<T>>,
    pub(crate) edges: Vec<GraphEdge>,
    pub(crate) entry: String,
    pub(crate) exits: HashSet<String>,
    /// Ids of phases nested inside parallel groups; they execute through
    /// their group, not through edges.
    pub(crate) grouped_children: HashSet<String>,
}

impl<T> Clone for WorkflowGraph<T> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            entry: self.entry.clone(),
            exits: self.exits.clone(),
            grouped_children: self.grouped_children.clone(),
        }
    }
}

impl<T> WorkflowGraph<T> {
    pub fn builder() -> GraphBuilder<T> {
        GraphBuilder::new()
    }

    pub(crate) fn node(&self, id: &str) -> Option<&GraphNode<T>> {
        self.nodes.get(id)
    }

    pub(crate) fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphEdge> {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    pub(crate) fn is_exit(&self, id: &str) -> bool {
        self.exits.contains(id)
    }
}

/// Builder that validates the graph before execution: every referenced
/// node must exist, the graph must be acyclic, every non-terminal node
/// needs an outgoing edge, and an entry point must be declared.
pub struct GraphBuilder<T> {
    nodes: Vec<GraphNode<T>>,
    edges: Vec<GraphEdge>,
    entry: Option<String>,
    exits: HashSet<String>,
}

impl<T> Default for GraphBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GraphBuilder<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
            exits: HashSet::new(),
        }
    }

    pub fn phase(mut self, phase: Phase<T>) -> Self {
        self.nodes.push(GraphNode::Phase(phase));
        self
    }

    pub fn conditional<F, Fut>(mut self, id: impl Into<String>, chooser: F) -> Self
    where
        F: Fn(ConditionalInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, OperationError>> + Send + 'static,
    {
        self.nodes.push(GraphNode::Conditional {
            id: id.into(),
            chooser: Arc::new(move |input| Box::pin(chooser(input))),
        });
        self
    }

    pub fn parallel_group<I, S>(mut self, id: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.push(GraphNode::ParallelGroup {
            id: id.into(),
            children: children.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn merge_point(mut self, id: impl Into<String>) -> Self {
        self.nodes.push(GraphNode::MergePoint { id: id.into() });
        self
    }

    pub fn branch(mut self, branch: Branch<T>) -> Self {
        self.nodes.push(GraphNode::Branch(branch));
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        });
        self
    }

    pub fn edge_on_success(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnSuccess,
        });
        self
    }

    pub fn edge_on_failure(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::OnFailure,
        });
        self
    }

    pub fn edge_custom(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Custom(label.into()),
        });
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    /// Declare a terminal node; terminals need no outgoing edge.
    pub fn exit(mut self, id: impl Into<String>) -> Self {
        self.exits.insert(id.into());
        self
    }

    /// Validate and assemble the graph.
    pub fn build(self) -> Result<WorkflowGraph<T>, OperationError> {
        let invalid = |message: String| Err(OperationError::validation(message));

        let mut nodes: HashMap<String, GraphNode<T>> = HashMap::new();
        for node in self.nodes {
            let id = node.id().to_string();
            if nodes.insert(id.clone(), node).is_some() {
                return invalid(format!("duplicate graph node id '{id}'"));
            }
        }

        let Some(entry) = self.entry else {
            return invalid("graph workflow needs a declared entry point".to_string());
        };
        if !nodes.contains_key(&entry) {
            return invalid(format!("entry node '{entry}' does not exist"));
        }
        for exit in &self.exits {
            if !nodes.contains_key(exit) {
                return invalid(format!("exit node '{exit}' does not exist"));
            }
        }

        let mut grouped_children = HashSet::new();
        for node in nodes.values() {
            if let GraphNode::ParallelGroup { id, children } = node {
                if children.is_empty() {
                    return invalid(format!("parallel group '{id}' has no children"));
                }
                for child in children {
                    match nodes.get(child) {
                        Some(GraphNode::Phase(_)) => {
                            grouped_children.insert(child.clone());
                        }
                        Some(_) => {
                            return invalid(format!(
                                "parallel group '{id}' child '{child}' is not a phase node"
                            ));
                        }
                        None => {
                            return invalid(format!(
                                "parallel group '{id}' references missing node '{child}'"
                            ));
                        }
                    }
                }
            }
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end) {
                    return invalid(format!("edge references missing node '{end}'"));
                }
            }
        }

        // Every non-terminal, non-grouped node needs a way forward.
        for id in nodes.keys() {
            if self.exits.contains(id) || grouped_children.contains(id) {
                continue;
            }
            if !self.edges.iter().any(|edge| &edge.from == id) {
                return invalid(format!(
                    "node '{id}' has no outgoing edge and is not a declared exit"
                ));
            }
        }

        detect_cycles(&nodes, &self.edges)?;

        Ok(WorkflowGraph {
            nodes,
            edges: self.edges,
            entry,
            exits: self.exits,
            grouped_children,
        })
    }
}

/// Kahn's algorithm over the explicit edges.
fn detect_cycles<T>(
    nodes: &HashMap<String, GraphNode<T>>,
    edges: &[GraphEdge],
) -> Result<(), OperationError> {
    let mut indegree: HashMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for edge in edges {
        *indegree.get_mut(edge.to.as_str()).expect("validated above") += 1;
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for edge in edges.iter().filter(|e| e.from == id) {
            let d = indegree.get_mut(edge.to.as_str()).expect("validated above");
            *d -= 1;
            if *d == 0 {
                queue.push_back(edge.to.as_str());
            }
        }
    }

    if visited != nodes.len() {
        Err(OperationError::validation(
            "graph contains a cycle; workflow graphs must be acyclic",
        ))
    } else {
        Ok(())
    }
}

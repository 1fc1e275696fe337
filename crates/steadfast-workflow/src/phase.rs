//! Phases and decision hooks.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use steadfast_core::OperationError;
use steadfast_executor::{Operation, SharedBuffer};
use steadfast_gateway::BatchResult;

/// How the operations inside a phase dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential { stop_on_first_error: bool },
    Concurrent,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential {
            stop_on_first_error: false,
        }
    }
}

/// What a decision hook chose to do after its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Advance to the next phase.
    Continue,
    /// Advance to the named phase, forward or backward.
    Jump { target: String },
    /// Re-execute the same phase, gated by the phase's replay allowance.
    Replay,
    /// Skip forward to the target phase, or to the next one.
    Skip { target: Option<String> },
    /// End the workflow.
    Terminate { reason: Option<String> },
}

impl Decision {
    /// Compact label recorded into execution history.
    pub fn label(&self) -> String {
        match self {
            Decision::Continue => "continue".to_string(),
            Decision::Jump { target } => format!("jump:{target}"),
            Decision::Replay => "replay".to_string(),
            Decision::Skip { target: Some(t) } => format!("skip:{t}"),
            Decision::Skip { target: None } => "skip".to_string(),
            Decision::Terminate { .. } => "terminate".to_string(),
        }
    }
}

/// Everything a decision hook gets to see.
pub struct DecisionInput<T> {
    pub phase_result: PhaseResult<T>,
    /// The full, append-only execution history so far.
    pub history: Vec<PhaseExecution>,
    pub buffer: Option<SharedBuffer>,
    /// Results of the whole concurrent group, when the phase closed one.
    pub concurrent_results: Option<Vec<PhaseResult<T>>>,
}

/// Hook choosing how the workflow proceeds after a phase.
pub type DecisionHook<T> = Arc<
    dyn Fn(DecisionInput<T>) -> BoxFuture<'static, Result<Decision, OperationError>> + Send + Sync,
>;

/// One executed (or skipped) phase in the workflow history.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    /// Position in the declared phase list (or graph order).
    pub phase_index: usize,
    /// 1-based execution count for this phase id, counting replays.
    pub execution_number: u32,
    pub success: bool,
    #[serde(skip)]
    pub duration: Duration,
    /// Compact decision label, when a hook ran after this execution.
    pub decision: Option<String>,
    /// A replay-exhausted or raced-out marker rather than a real run.
    pub skipped: bool,
    pub error: Option<String>,
    #[serde(skip)]
    pub timestamp: SystemTime,
}

/// Outcome of one phase execution.
#[derive(Debug, Clone)]
pub struct PhaseResult<T> {
    pub phase_id: String,
    pub success: bool,
    pub batch: BatchResult<T>,
    pub duration: Duration,
}

/// An ordered or concurrent cluster of operations, optionally followed by
/// a decision hook.
pub struct Phase<T> {
    pub id: String,
    pub operations: Vec<Operation<T>>,
    pub mode: ExecutionMode,
    /// Group with adjacent same-marked phases for inter-phase parallelism.
    pub concurrent_phase: bool,
    /// Complete on the first successful operation; cancel the rest.
    pub racing: bool,
    pub decision_hook: Option<DecisionHook<T>>,
    pub allow_replay: bool,
    pub max_replay_count: u32,
    pub allow_skip: bool,
}

impl<T> Clone for Phase<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            operations: self.operations.clone(),
            mode: self.mode,
            concurrent_phase: self.concurrent_phase,
            racing: self.racing,
            decision_hook: self.decision_hook.clone(),
            allow_replay: self.allow_replay,
            max_replay_count: self.max_replay_count,
            allow_skip: self.allow_skip,
        }
    }
}

impl<T> fmt::Debug for Phase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("operations", &self.operations.len())
            .field("mode", &self.mode)
            .field("concurrent_phase", &self.concurrent_phase)
            .finish()
    }
}

impl<T> Phase<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operations: Vec::new(),
            mode: ExecutionMode::default(),
            concurrent_phase: false,
            racing: false,
            decision_hook: None,
            allow_replay: false,
            max_replay_count: 0,
            allow_skip: false,
        }
    }

    pub fn operation(mut self, op: Operation<T>) -> Self {
        self.operations.push(op);
        self
    }

    pub fn operations(mut self, ops: impl IntoIterator<Item = Operation<T>>) -> Self {
        self.operations.extend(ops);
        self
    }

    /// Run operations concurrently instead of in input order.
    pub fn concurrent(mut self) -> Self {
        self.mode = ExecutionMode::Concurrent;
        self
    }

    pub fn stop_on_first_error(mut self) -> Self {
        self.mode = ExecutionMode::Sequential {
            stop_on_first_error: true,
        };
        self
    }

    /// Mark for inter-phase parallelism with adjacent marked phases.
    pub fn concurrent_with_neighbors(mut self) -> Self {
        self.concurrent_phase = true;
        self
    }

    /// Complete on the first successful operation.
    pub fn racing(mut self) -> Self {
        self.racing = true;
        self.mode = ExecutionMode::Concurrent;
        self
    }

    /// Permit `REPLAY` decisions, at most `max_replays` times.
    pub fn allow_replay(mut self, max_replays: u32) -> Self {
        self.allow_replay = true;
        self.max_replay_count = max_replays;
        self
    }

    /// Permit `SKIP` decisions.
    pub fn allow_skip(mut self) -> Self {
        self.allow_skip = true;
        self
    }

    /// Install the decision hook.
    pub fn on_decision<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DecisionInput<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Decision, OperationError>> + Send + 'static,
    {
        self.decision_hook = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }
}

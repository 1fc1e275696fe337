//! Branches: ordered phase lists that can run in parallel with siblings.

use crate::phase::{Phase, PhaseExecution, PhaseResult};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::OperationError;
use steadfast_executor::SharedBuffer;

/// What a branch decision hook chose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchDecision {
    Continue,
    /// Re-run the whole branch, gated by its replay allowance.
    Replay,
    /// End the workflow.
    Terminate { reason: Option<String> },
}

/// Everything a branch decision hook gets to see.
pub struct BranchDecisionInput<T> {
    pub branch_result: BranchResult<T>,
    pub history: Vec<PhaseExecution>,
    pub buffer: Option<SharedBuffer>,
}

pub type BranchDecisionHook<T> = Arc<
    dyn Fn(BranchDecisionInput<T>) -> BoxFuture<'static, Result<BranchDecision, OperationError>>
        + Send
        + Sync,
>;

/// Outcome of one branch run.
#[derive(Debug, Clone)]
pub struct BranchResult<T> {
    pub branch_id: String,
    pub success: bool,
    /// Cancelled before or during execution (racing loser).
    pub skipped: bool,
    pub error: Option<OperationError>,
    pub phase_results: Vec<PhaseResult<T>>,
    pub history: Vec<PhaseExecution>,
    pub duration: Duration,
    pub replays: u32,
}

impl<T> BranchResult<T> {
    pub(crate) fn cancelled(branch_id: String, message: String) -> Self {
        Self {
            branch_id,
            success: false,
            skipped: true,
            error: Some(OperationError::cancelled(message)),
            phase_results: Vec::new(),
            history: Vec::new(),
            duration: Duration::ZERO,
            replays: 0,
        }
    }
}

/// An ordered list of phases with its own decision hook.
pub struct Branch<T> {
    pub id: String,
    pub phases: Vec<Phase<T>>,
    /// Run in parallel with adjacent same-marked branches.
    pub concurrent_branch: bool,
    pub decision_hook: Option<BranchDecisionHook<T>>,
    pub allow_replay: bool,
    pub max_replay_count: u32,
}

impl<T> Clone for Branch<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            phases: self.phases.clone(),
            concurrent_branch: self.concurrent_branch,
            decision_hook: self.decision_hook.clone(),
            allow_replay: self.allow_replay,
            max_replay_count: self.max_replay_count,
        }
    }
}

impl<T> fmt::Debug for Branch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("phases", &self.phases.len())
            .field("concurrent_branch", &self.concurrent_branch)
            .finish()
    }
}

impl<T> Branch<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phases: Vec::new(),
            concurrent_branch: false,
            decision_hook: None,
            allow_replay: false,
            max_replay_count: 0,
        }
    }

    pub fn phase(mut self, phase: Phase<T>) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase<T>>) -> Self {
        self.phases.extend(phases);
        self
    }

    /// Run in parallel with adjacent marked siblings.
    pub fn concurrent_with_siblings(mut self) -> Self {
        self.concurrent_branch = true;
        self
    }

    pub fn allow_replay(mut self, max_replays: u32) -> Self {
        self.allow_replay = true;
        self.max_replay_count = max_replays;
        self
    }

    /// Install the branch decision hook.
    pub fn on_decision<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(BranchDecisionInput<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BranchDecision, OperationError>> + Send + 'static,
    {
        self.decision_hook = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }
}

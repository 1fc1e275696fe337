//! The workflow engine.
//!
//! Three composition modes share the same per-operation executor: linear
//! phase lists (with decision hooks, jumps, replays and skips), branch
//! lists (with branch-level hooks, parallelism and racing), and validated
//! DAGs of phases and control nodes.

use crate::branch::{Branch, BranchDecision, BranchDecisionInput, BranchResult};
use crate::graph::{ConditionalInput, EdgeCondition, GraphNode, WorkflowGraph};
use crate::phase::{Decision, DecisionInput, ExecutionMode, Phase, PhaseExecution, PhaseResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use steadfast_core::{CancelToken, OperationError};
use steadfast_executor::{ProfilePatch, RunOptions, Runner, SharedBuffer};
use steadfast_gateway::{BatchConfig, BatchMode, Gateway};
use tokio::task::JoinSet;

/// Reason recorded when the global iteration cap fires.
pub const LOOP_EXCEEDED_REASON: &str = "Exceeded maximum workflow iterations";

/// Error recorded on a replay-exhausted skip marker.
pub const REPLAY_EXHAUSTED_ERROR: &str = "Exceeded max replay count";

/// Workflow-wide configuration.
pub struct WorkflowConfig<T> {
    /// Cap on total phase executions across the whole run. Default 100.
    pub max_workflow_iterations: u32,
    pub workflow_timeout: Option<Duration>,
    /// One buffer threaded through every hook of every phase.
    pub buffer: Option<SharedBuffer>,
    /// Race sibling branches: first success wins, losers are cancelled.
    pub enable_branch_racing: bool,
    pub common_profile: Option<ProfilePatch<T>>,
    pub group_profiles: HashMap<String, ProfilePatch<T>>,
}

impl<T> Default for WorkflowConfig<T> {
    fn default() -> Self {
        Self {
            max_workflow_iterations: 100,
            workflow_timeout: None,
            buffer: None,
            enable_branch_racing: false,
            common_profile: None,
            group_profiles: HashMap::new(),
        }
    }
}

/// What a workflow is made of.
pub enum WorkflowDefinition<T> {
    Phases(Vec<Phase<T>>),
    Branches(Vec<Branch<T>>),
    Graph(WorkflowGraph<T>),
}

/// A complete workflow description.
pub struct Workflow<T> {
    pub id: String,
    pub definition: WorkflowDefinition<T>,
    pub config: WorkflowConfig<T>,
}

impl<T> Workflow<T> {
    pub fn linear(id: impl Into<String>, phases: Vec<Phase<T>>) -> Self {
        Self {
            id: id.into(),
            definition: WorkflowDefinition::Phases(phases),
            config: WorkflowConfig::default(),
        }
    }

    pub fn branched(id: impl Into<String>, branches: Vec<Branch<T>>) -> Self {
        Self {
            id: id.into(),
            definition: WorkflowDefinition::Branches(branches),
            config: WorkflowConfig::default(),
        }
    }

    pub fn graph(id: impl Into<String>, graph: WorkflowGraph<T>) -> Self {
        Self {
            id: id.into(),
            definition: WorkflowDefinition::Graph(graph),
            config: WorkflowConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkflowConfig<T>) -> Self {
        self.config = config;
        self
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.config.buffer = Some(buffer);
        self
    }

    pub fn max_iterations(mut self, cap: u32) -> Self {
        self.config.max_workflow_iterations = cap;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.workflow_timeout = Some(timeout);
        self
    }

    pub fn enable_branch_racing(mut self) -> Self {
        self.config.enable_branch_racing = true;
        self
    }
}

/// The aggregate a workflow run returns.
#[derive(Debug, Clone)]
pub struct WorkflowResult<T> {
    pub workflow_id: String,
    pub success: bool,
    pub duration: Duration,
    /// Append-only, ordered record of every phase execution, including
    /// replays and skip markers.
    pub history: Vec<PhaseExecution>,
    pub phase_results: Vec<PhaseResult<T>>,
    pub branch_results: Vec<BranchResult<T>>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
    pub total_phases_executed: u32,
    pub replays: u32,
    pub skips: u32,
}

impl<T> WorkflowResult<T> {
    /// History records for one phase id, in execution order.
    pub fn executions_of(&self, phase_id: &str) -> Vec<&PhaseExecution> {
        self.history
            .iter()
            .filter(|record| record.phase_id == phase_id)
            .collect()
    }
}

#[derive(Default)]
struct Totals {
    replays: u32,
    skips: u32,
}

enum ListOutcome {
    Completed,
    Terminated { reason: String },
}

/// Drives workflows over a shared [`Gateway`].
pub struct Engine<T> {
    gateway: Gateway<T>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Engine<T> {
    fn default() -> Self {
        Self::new(Runner::new())
    }
}

impl<T: Clone + Send + Sync + 'static> Engine<T> {
    pub fn new(runner: Runner<T>) -> Self {
        Self {
            gateway: Gateway::new(runner),
        }
    }

    /// Run a workflow to completion.
    ///
    /// Only invariant violations (duplicate phase ids, invalid graphs)
    /// surface as `Err`; operation and phase failures are reported inside
    /// the [`WorkflowResult`].
    pub async fn run(&self, workflow: &Workflow<T>) -> Result<WorkflowResult<T>, OperationError> {
        self.run_cancellable(workflow, &CancelToken::new()).await
    }

    /// [`run`](Self::run) under an external cancellation token.
    pub async fn run_cancellable(
        &self,
        workflow: &Workflow<T>,
        token: &CancelToken,
    ) -> Result<WorkflowResult<T>, OperationError> {
        let started = Instant::now();
        validate_definition(&workflow.definition)?;

        let ctx = Arc::new(RunCtx {
            gateway: self.gateway.clone(),
            workflow_id: workflow.id.clone(),
            buffer: workflow.config.buffer.clone(),
            common_profile: workflow.config.common_profile.clone(),
            group_profiles: workflow.config.group_profiles.clone(),
            max_iterations: workflow.config.max_workflow_iterations,
            iterations: AtomicU32::new(0),
            token: token.clone(),
            deadline: workflow.config.workflow_timeout.map(|t| started + t),
        });

        let mut history = Vec::new();
        let mut phase_results = Vec::new();
        let mut branch_results = Vec::new();
        let mut totals = Totals::default();
        let mut termination_reason = None;

        let outcome = match &workflow.definition {
            WorkflowDefinition::Phases(phases) => {
                RunCtx::run_phase_list(
                    &ctx,
                    phases,
                    None,
                    &mut history,
                    &mut phase_results,
                    &mut totals,
                )
                .await
            }
            WorkflowDefinition::Branches(branches) => {
                RunCtx::run_branches(
                    &ctx,
                    branches,
                    workflow.config.enable_branch_racing,
                    &mut history,
                    &mut branch_results,
                    &mut totals,
                )
                .await
            }
            WorkflowDefinition::Graph(graph) => {
                RunCtx::run_graph(
                    &ctx,
                    graph,
                    &mut history,
                    &mut phase_results,
                    &mut branch_results,
                    &mut totals,
                )
                .await
            }
        };
        if let ListOutcome::Terminated { reason } = outcome {
            termination_reason = Some(reason);
        }

        let terminated_early = termination_reason.is_some();
        let success = !terminated_early
            && all_last_executions_succeeded(&history)
            && branch_results
                .iter()
                .all(|branch| branch.success || branch.skipped);

        Ok(WorkflowResult {
            workflow_id: workflow.id.clone(),
            success,
            duration: started.elapsed(),
            history,
            phase_results,
            branch_results,
            terminated_early,
            termination_reason,
            total_phases_executed: ctx.iterations.load(Ordering::SeqCst),
            replays: totals.replays,
            skips: totals.skips,
        })
    }
}

/// Workflow success: every phase id's latest non-marker execution
/// succeeded.
fn all_last_executions_succeeded(history: &[PhaseExecution]) -> bool {
    let mut last: HashMap<&str, &PhaseExecution> = HashMap::new();
    for record in history {
        if !record.skipped {
            last.insert(record.phase_id.as_str(), record);
        }
    }
    last.values().all(|record| record.success)
}

fn validate_definition<T>(definition: &WorkflowDefinition<T>) -> Result<(), OperationError> {
    let check_unique = |ids: Vec<&str>, what: &str| -> Result<(), OperationError> {
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(OperationError::validation(format!(
                    "duplicate {what} id '{id}'"
                )));
            }
        }
        Ok(())
    };

    match definition {
        WorkflowDefinition::Phases(phases) => {
            check_unique(phases.iter().map(|p| p.id.as_str()).collect(), "phase")
        }
        WorkflowDefinition::Branches(branches) => {
            check_unique(branches.iter().map(|b| b.id.as_str()).collect(), "branch")?;
            for branch in branches {
                check_unique(
                    branch.phases.iter().map(|p| p.id.as_str()).collect(),
                    "phase",
                )?;
            }
            Ok(())
        }
        // Graphs validate at build time.
        WorkflowDefinition::Graph(_) => Ok(()),
    }
}

struct RunCtx<T> {
    gateway: Gateway<T>,
    workflow_id: String,
    buffer: Option<SharedBuffer>,
    common_profile: Option<ProfilePatch<T>>,
    group_profiles: HashMap<String, ProfilePatch<T>>,
    max_iterations: u32,
    iterations: AtomicU32,
    token: CancelToken,
    deadline: Option<Instant>,
}

impl<T: Clone + Send + Sync + 'static> RunCtx<T> {
    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Reserve `n` phase executions against the global cap.
    fn try_reserve(&self, n: u32) -> bool {
        let mut current = self.iterations.load(Ordering::SeqCst);
        loop {
            if current + n > self.max_iterations {
                return false;
            }
            match self.iterations.compare_exchange(
                current,
                current + n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    async fn run_phase(
        &self,
        phase: &Phase<T>,
        phase_index: usize,
        execution_number: u32,
        branch_id: Option<&str>,
    ) -> (PhaseResult<T>, PhaseExecution) {
        let started = Instant::now();
        let mode = match (phase.mode, phase.racing) {
            (_, true) => BatchMode::Concurrent { racing: true },
            (ExecutionMode::Concurrent, false) => BatchMode::Concurrent { racing: false },
            (ExecutionMode::Sequential { stop_on_first_error }, false) => {
                BatchMode::Sequential { stop_on_first_error }
            }
        };

        let batch_config = BatchConfig {
            mode,
            common_profile: self.common_profile.clone(),
            group_profiles: self.group_profiles.clone(),
            buffer: self.buffer.clone(),
        };

        let ops = phase
            .operations
            .iter()
            .cloned()
            .map(|mut op| {
                let mut context = op.context.clone().in_workflow(self.workflow_id.clone());
                context = context.in_phase(phase.id.clone());
                if let Some(branch) = branch_id {
                    context = context.in_branch(branch.to_string());
                }
                op.context = context;
                op
            })
            .collect();

        let opts = RunOptions {
            token: self.token.clone(),
            deadline: self.deadline,
        };

        let batch = match self.gateway.run(ops, &batch_config, &opts).await {
            Ok(batch) => batch,
            Err(error) => {
                // Invariant violation inside the phase (e.g. duplicate op
                // ids): surfaced as a failed phase, not a panic.
                tracing::warn!(
                    workflow = %self.workflow_id,
                    phase = %phase.id,
                    error = %error,
                    "phase dispatch rejected"
                );
                let record = PhaseExecution {
                    phase_id: phase.id.clone(),
                    phase_index,
                    execution_number,
                    success: false,
                    duration: started.elapsed(),
                    decision: None,
                    skipped: false,
                    error: Some(error.message.clone()),
                    timestamp: SystemTime::now(),
                };
                let result = PhaseResult {
                    phase_id: phase.id.clone(),
                    success: false,
                    batch: steadfast_gateway::BatchResult {
                        results: Vec::new(),
                        success: false,
                        stopped_early: false,
                        metrics: Default::default(),
                    },
                    duration: started.elapsed(),
                };
                return (result, record);
            }
        };

        let success = batch.success;
        let duration = started.elapsed();
        let result = PhaseResult {
            phase_id: phase.id.clone(),
            success,
            batch,
            duration,
        };
        let record = PhaseExecution {
            phase_id: phase.id.clone(),
            phase_index,
            execution_number,
            success,
            duration,
            decision: None,
            skipped: false,
            error: result
                .batch
                .results
                .iter()
                .find_map(|r| r.effective_error().map(|e| e.message.clone())),
            timestamp: SystemTime::now(),
        };
        (result, record)
    }

    async fn decide(
        &self,
        phase: &Phase<T>,
        result: &PhaseResult<T>,
        history: &[PhaseExecution],
        concurrent_results: Option<Vec<PhaseResult<T>>>,
    ) -> Decision {
        let Some(hook) = &phase.decision_hook else {
            return Decision::Continue;
        };
        let input = DecisionInput {
            phase_result: result.clone(),
            history: history.to_vec(),
            buffer: self.buffer.clone(),
            concurrent_results,
        };
        match hook(input).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(
                    workflow = %self.workflow_id,
                    phase = %phase.id,
                    error = %error,
                    "decision hook failed; continuing"
                );
                Decision::Continue
            }
        }
    }

    /// Run an ordered phase list with decisions, jumps, replays, skips and
    /// concurrent groups. Shared by top-level linear workflows and branch
    /// bodies.
    async fn run_phase_list(
        ctx: &Arc<Self>,
        phases: &[Phase<T>],
        branch_id: Option<&str>,
        history: &mut Vec<PhaseExecution>,
        phase_results: &mut Vec<PhaseResult<T>>,
        totals: &mut Totals,
    ) -> ListOutcome {
        let mut execution_counts: HashMap<String, u32> = HashMap::new();
        let mut index = 0usize;

        while index < phases.len() {
            if ctx.token.is_cancelled() {
                return ListOutcome::Terminated {
                    reason: "Cancelled".to_string(),
                };
            }
            if ctx.deadline_passed() {
                return ListOutcome::Terminated {
                    reason: "Workflow timeout exceeded".to_string(),
                };
            }

            // Adjacent concurrent-marked phases form one parallel group.
            let group_end = if phases[index].concurrent_phase {
                let mut end = index;
                while end + 1 < phases.len() && phases[end + 1].concurrent_phase {
                    end += 1;
                }
                end
            } else {
                index
            };
            let group_size = (group_end - index + 1) as u32;

            if !ctx.try_reserve(group_size) {
                return ListOutcome::Terminated {
                    reason: LOOP_EXCEEDED_REASON.to_string(),
                };
            }

            let mut group_results: Vec<PhaseResult<T>> = Vec::with_capacity(group_size as usize);
            let mut group_records: Vec<PhaseExecution> = Vec::with_capacity(group_size as usize);

            if group_size == 1 {
                let phase = &phases[index];
                let number = bump(&mut execution_counts, &phase.id);
                let (result, record) = ctx.run_phase(phase, index, number, branch_id).await;
                group_results.push(result);
                group_records.push(record);
            } else {
                let mut join_set = JoinSet::new();
                for (offset, phase) in phases[index..=group_end].iter().enumerate() {
                    let number = bump(&mut execution_counts, &phase.id);
                    let task_ctx = Arc::clone(ctx);
                    let phase = phase.clone();
                    let branch = branch_id.map(str::to_string);
                    let phase_index = index + offset;
                    join_set.spawn(async move {
                        let (result, record) = task_ctx
                            .run_phase(&phase, phase_index, number, branch.as_deref())
                            .await;
                        (offset, result, record)
                    });
                }
                let mut slots: Vec<Option<(PhaseResult<T>, PhaseExecution)>> =
                    Vec::with_capacity(group_size as usize);
                slots.resize_with(group_size as usize, || None);
                while let Some(joined) = join_set.join_next().await {
                    let (offset, result, record) = joined.expect("phase task never panics");
                    slots[offset] = Some((result, record));
                }
                for slot in slots {
                    let (result, record) = slot.expect("every phase in the group reports");
                    group_results.push(result);
                    group_records.push(record);
                }
            }

            // The deciding phase is the last of the group.
            let deciding_phase = &phases[group_end];
            let deciding_result = group_results
                .last()
                .expect("group has at least one phase")
                .clone();
            let concurrent_results = (group_size > 1).then(|| group_results.clone());

            // History is visible to the hook up to and including this group.
            let mut hook_history = history.clone();
            hook_history.extend(group_records.iter().cloned());

            let decision = ctx
                .decide(deciding_phase, &deciding_result, &hook_history, concurrent_results)
                .await;

            if let Some(last) = group_records.last_mut() {
                last.decision = Some(decision.label());
            }
            history.extend(group_records);
            phase_results.extend(group_results);

            match decision {
                Decision::Continue => index = group_end + 1,
                Decision::Jump { target } => {
                    match phases.iter().position(|p| p.id == target) {
                        Some(position) => {
                            tracing::debug!(
                                workflow = %ctx.workflow_id,
                                from = %deciding_phase.id,
                                to = %target,
                                "jumping"
                            );
                            index = position;
                        }
                        None => {
                            return ListOutcome::Terminated {
                                reason: format!("Jump target phase not found: {target}"),
                            };
                        }
                    }
                }
                Decision::Replay => {
                    let runs_so_far = *execution_counts.get(&deciding_phase.id).unwrap_or(&1);
                    if deciding_phase.allow_replay
                        && runs_so_far <= deciding_phase.max_replay_count
                    {
                        totals.replays += 1;
                        // index unchanged: the group runs again.
                    } else {
                        history.push(PhaseExecution {
                            phase_id: deciding_phase.id.clone(),
                            phase_index: group_end,
                            execution_number: runs_so_far,
                            success: false,
                            duration: Duration::ZERO,
                            decision: None,
                            skipped: true,
                            error: Some(REPLAY_EXHAUSTED_ERROR.to_string()),
                            timestamp: SystemTime::now(),
                        });
                        totals.skips += 1;
                        index = group_end + 1;
                    }
                }
                Decision::Skip { target } => {
                    if !deciding_phase.allow_skip {
                        tracing::warn!(
                            workflow = %ctx.workflow_id,
                            phase = %deciding_phase.id,
                            "skip requested but not allowed; continuing"
                        );
                        index = group_end + 1;
                    } else {
                        totals.skips += 1;
                        match target {
                            Some(target) => match phases.iter().position(|p| p.id == target) {
                                Some(position) => index = position,
                                None => {
                                    return ListOutcome::Terminated {
                                        reason: format!(
                                            "Skip target phase not found: {target}"
                                        ),
                                    };
                                }
                            },
                            None => index = group_end + 1,
                        }
                    }
                }
                Decision::Terminate { reason } => {
                    return ListOutcome::Terminated {
                        reason: reason
                            .unwrap_or_else(|| "Workflow terminated by decision hook".to_string()),
                    };
                }
            }
        }

        ListOutcome::Completed
    }

    /// One full branch run, including branch-level replays.
    async fn run_branch(
        ctx: &Arc<Self>,
        branch: &Branch<T>,
    ) -> (BranchResult<T>, Option<String>) {
        let started = Instant::now();
        let mut history = Vec::new();
        let mut phase_results = Vec::new();
        let mut replays = 0u32;

        loop {
            let mut totals = Totals::default();
            let outcome = Self::run_phase_list(
                ctx,
                &branch.phases,
                Some(&branch.id),
                &mut history,
                &mut phase_results,
                &mut totals,
            )
            .await;

            let (success, terminate_reason) = match outcome {
                ListOutcome::Completed => (all_last_executions_succeeded(&history), None),
                ListOutcome::Terminated { reason } => (false, Some(reason)),
            };

            let result = BranchResult {
                branch_id: branch.id.clone(),
                success,
                skipped: false,
                error: None,
                phase_results: phase_results.clone(),
                history: history.clone(),
                duration: started.elapsed(),
                replays,
            };

            if let Some(reason) = terminate_reason {
                return (result, Some(reason));
            }

            let Some(hook) = &branch.decision_hook else {
                return (result, None);
            };
            let input = BranchDecisionInput {
                branch_result: result.clone(),
                history: history.clone(),
                buffer: ctx.buffer.clone(),
            };
            match hook(input).await {
                Ok(BranchDecision::Continue) => return (result, None),
                Ok(BranchDecision::Replay) => {
                    if branch.allow_replay && replays < branch.max_replay_count {
                        replays += 1;
                        continue;
                    }
                    history.push(PhaseExecution {
                        phase_id: branch.id.clone(),
                        phase_index: 0,
                        execution_number: replays + 1,
                        success: false,
                        duration: Duration::ZERO,
                        decision: None,
                        skipped: true,
                        error: Some(REPLAY_EXHAUSTED_ERROR.to_string()),
                        timestamp: SystemTime::now(),
                    });
                    let mut result = result;
                    result.history = history.clone();
                    return (result, None);
                }
                Ok(BranchDecision::Terminate { reason }) => {
                    let reason = reason
                        .unwrap_or_else(|| "Workflow terminated by branch decision".to_string());
                    return (result, Some(reason));
                }
                Err(error) => {
                    tracing::warn!(
                        workflow = %ctx.workflow_id,
                        branch = %branch.id,
                        error = %error,
                        "branch decision hook failed; continuing"
                    );
                    return (result, None);
                }
            }
        }
    }

    async fn run_branches(
        ctx: &Arc<Self>,
        branches: &[Branch<T>],
        racing: bool,
        history: &mut Vec<PhaseExecution>,
        branch_results: &mut Vec<BranchResult<T>>,
        totals: &mut Totals,
    ) -> ListOutcome {
        if racing {
            return Self::race_branches(ctx, branches, history, branch_results).await;
        }

        let mut index = 0usize;
        while index < branches.len() {
            let group_end = if branches[index].concurrent_branch {
                let mut end = index;
                while end + 1 < branches.len() && branches[end + 1].concurrent_branch {
                    end += 1;
                }
                end
            } else {
                index
            };

            let mut outcomes: Vec<(BranchResult<T>, Option<String>)> = Vec::new();
            if group_end == index {
                outcomes.push(Self::run_branch(ctx, &branches[index]).await);
            } else {
                let mut join_set = JoinSet::new();
                for (offset, branch) in branches[index..=group_end].iter().enumerate() {
                    let task_ctx = Arc::clone(ctx);
                    let branch = branch.clone();
                    join_set.spawn(async move {
                        let outcome = Self::run_branch(&task_ctx, &branch).await;
                        (offset, outcome)
                    });
                }
                let mut slots: Vec<Option<(BranchResult<T>, Option<String>)>> =
                    Vec::with_capacity(group_end - index + 1);
                slots.resize_with(group_end - index + 1, || None);
                while let Some(joined) = join_set.join_next().await {
                    let (offset, outcome) = joined.expect("branch task never panics");
                    slots[offset] = Some(outcome);
                }
                outcomes.extend(slots.into_iter().map(|s| s.expect("branch reports")));
            }

            let mut terminate: Option<String> = None;
            for (result, reason) in outcomes {
                totals.replays += result.replays;
                history.extend(result.history.iter().cloned());
                branch_results.push(result);
                if terminate.is_none() {
                    terminate = reason;
                }
            }
            if let Some(reason) = terminate {
                return ListOutcome::Terminated { reason };
            }
            index = group_end + 1;
        }

        ListOutcome::Completed
    }

    /// All branches in parallel; first success wins, losers are cancelled.
    async fn race_branches(
        ctx: &Arc<Self>,
        branches: &[Branch<T>],
        history: &mut Vec<PhaseExecution>,
        branch_results: &mut Vec<BranchResult<T>>,
    ) -> ListOutcome {
        let race_token = CancelToken::new();
        let race_ctx = Arc::new(RunCtx {
            gateway: ctx.gateway.clone(),
            workflow_id: ctx.workflow_id.clone(),
            buffer: ctx.buffer.clone(),
            common_profile: ctx.common_profile.clone(),
            group_profiles: ctx.group_profiles.clone(),
            max_iterations: ctx.max_iterations,
            iterations: AtomicU32::new(ctx.iterations.load(Ordering::SeqCst)),
            token: race_token.clone(),
            deadline: ctx.deadline,
        });

        let mut join_set = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let task_ctx = Arc::clone(&race_ctx);
            let branch = branch.clone();
            join_set.spawn(async move {
                let outcome = Self::run_branch(&task_ctx, &branch).await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<BranchResult<T>>> = Vec::with_capacity(branches.len());
        slots.resize_with(branches.len(), || None);
        let mut winner: Option<usize> = None;
        let mut terminate: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            let (index, (result, reason)) = joined.expect("branch task never panics");
            if result.success && winner.is_none() {
                winner = Some(index);
                tracing::debug!(
                    workflow = %ctx.workflow_id,
                    winner = %result.branch_id,
                    "branch race decided; cancelling the rest"
                );
                race_token.cancel();
            }
            if terminate.is_none() {
                terminate = reason.filter(|r| r != "Cancelled");
            }
            slots[index] = Some(result);
        }

        ctx.iterations
            .store(race_ctx.iterations.load(Ordering::SeqCst), Ordering::SeqCst);

        for (index, slot) in slots.into_iter().enumerate() {
            let mut result = slot.expect("every branch reports");
            if Some(index) != winner && winner.is_some() {
                // Losers report a cancelled, skipped branch regardless of
                // how far they got; their history records become markers
                // so partial runs do not count against the workflow.
                result = BranchResult {
                    skipped: true,
                    success: false,
                    error: Some(OperationError::cancelled(format!(
                        "Cancelled: branch '{}' lost the race",
                        result.branch_id
                    ))),
                    history: result
                        .history
                        .into_iter()
                        .map(|mut record| {
                            record.skipped = true;
                            record.success = false;
                            record
                        })
                        .collect(),
                    ..result
                };
            }
            history.extend(result.history.iter().cloned());
            branch_results.push(result);
        }

        match terminate {
            Some(reason) => ListOutcome::Terminated { reason },
            None => ListOutcome::Completed,
        }
    }

    async fn run_graph(
        ctx: &Arc<Self>,
        graph: &WorkflowGraph<T>,
        history: &mut Vec<PhaseExecution>,
        phase_results: &mut Vec<PhaseResult<T>>,
        branch_results: &mut Vec<BranchResult<T>>,
        totals: &mut Totals,
    ) -> ListOutcome {
        let mut execution_counts: HashMap<String, u32> = HashMap::new();
        let mut current = graph.entry.clone();
        let mut last_success = true;

        loop {
            if ctx.token.is_cancelled() {
                return ListOutcome::Terminated {
                    reason: "Cancelled".to_string(),
                };
            }
            if ctx.deadline_passed() {
                return ListOutcome::Terminated {
                    reason: "Workflow timeout exceeded".to_string(),
                };
            }

            let node = graph
                .node(&current)
                .expect("graph validation guarantees node existence");

            let mut routed: Option<String> = None;
            match node {
                GraphNode::Phase(phase) => {
                    if !ctx.try_reserve(1) {
                        return ListOutcome::Terminated {
                            reason: LOOP_EXCEEDED_REASON.to_string(),
                        };
                    }
                    let number = bump(&mut execution_counts, &phase.id);
                    let (result, mut record) =
                        ctx.run_phase(phase, history.len(), number, None).await;
                    last_success = result.success;

                    let decision = ctx.decide(phase, &result, history, None).await;
                    record.decision = Some(decision.label());
                    history.push(record);
                    phase_results.push(result);

                    if let Decision::Terminate { reason } = decision {
                        return ListOutcome::Terminated {
                            reason: reason.unwrap_or_else(|| {
                                "Workflow terminated by decision hook".to_string()
                            }),
                        };
                    }
                }
                GraphNode::Conditional { id, chooser } => {
                    let input = ConditionalInput {
                        history: history.clone(),
                        buffer: ctx.buffer.clone(),
                        last_success,
                    };
                    match chooser(input).await {
                        Ok(target) => {
                            if graph.node(&target).is_some() {
                                routed = Some(target);
                            } else if let Some(edge) = graph.edges_from(id).find(|edge| {
                                matches!(&edge.condition, EdgeCondition::Custom(label) if *label == target)
                            }) {
                                routed = Some(edge.to.clone());
                            } else {
                                return ListOutcome::Terminated {
                                    reason: format!("Route target not found: {target}"),
                                };
                            }
                        }
                        Err(error) => {
                            tracing::warn!(
                                workflow = %ctx.workflow_id,
                                node = %id,
                                error = %error,
                                "conditional chooser failed"
                            );
                            return ListOutcome::Terminated {
                                reason: format!(
                                    "Conditional node '{id}' failed: {}",
                                    error.message
                                ),
                            };
                        }
                    }
                }
                GraphNode::ParallelGroup { id, children } => {
                    if !ctx.try_reserve(children.len() as u32) {
                        return ListOutcome::Terminated {
                            reason: LOOP_EXCEEDED_REASON.to_string(),
                        };
                    }
                    let mut join_set = JoinSet::new();
                    for (offset, child) in children.iter().enumerate() {
                        let Some(GraphNode::Phase(phase)) = graph.node(child) else {
                            unreachable!("validated: parallel children are phases");
                        };
                        let number = bump(&mut execution_counts, &phase.id);
                        let task_ctx = Arc::clone(ctx);
                        let phase = phase.clone();
                        let base_index = history.len();
                        join_set.spawn(async move {
                            let (result, record) = task_ctx
                                .run_phase(&phase, base_index + offset, number, None)
                                .await;
                            (offset, result, record)
                        });
                    }
                    let mut slots: Vec<Option<(PhaseResult<T>, PhaseExecution)>> =
                        Vec::with_capacity(children.len());
                    slots.resize_with(children.len(), || None);
                    while let Some(joined) = join_set.join_next().await {
                        let (offset, result, record) = joined.expect("phase task never panics");
                        slots[offset] = Some((result, record));
                    }
                    let mut group_success = true;
                    for slot in slots {
                        let (result, record) = slot.expect("every child reports");
                        group_success &= result.success;
                        history.push(record);
                        phase_results.push(result);
                    }
                    last_success = group_success;
                    tracing::debug!(
                        workflow = %ctx.workflow_id,
                        group = %id,
                        success = group_success,
                        "parallel group complete"
                    );
                }
                GraphNode::MergePoint { .. } => {
                    // Synchronisation marker; parallelism already joined.
                }
                GraphNode::Branch(branch) => {
                    let (result, terminate) = Self::run_branch(ctx, branch).await;
                    totals.replays += result.replays;
                    last_success = result.success;
                    history.extend(result.history.iter().cloned());
                    branch_results.push(result);
                    if let Some(reason) = terminate {
                        return ListOutcome::Terminated { reason };
                    }
                }
            }

            if let Some(target) = routed {
                current = target;
                continue;
            }

            if graph.is_exit(&current) {
                return ListOutcome::Completed;
            }

            let next = graph.edges_from(&current).find(|edge| match &edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => last_success,
                EdgeCondition::OnFailure => !last_success,
                EdgeCondition::Custom(_) => false,
            });
            match next {
                Some(edge) => current = edge.to.clone(),
                None => return ListOutcome::Completed,
            }
        }
    }
}

fn bump(counts: &mut HashMap<String, u32>, id: &str) -> u32 {
    let entry = counts.entry(id.to_string()).or_insert(0);
    *entry += 1;
    *entry
}

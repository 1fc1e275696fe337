//! Workflow engine: compose operations into phases, branches and DAGs.
//!
//! Phases run as gateway batches; a decision hook after each phase chooses
//! among `CONTINUE`, `JUMP`, `REPLAY`, `SKIP` and `TERMINATE`. Adjacent
//! phases marked concurrent run in parallel; branches run their own phase
//! lists, optionally in parallel or racing; graph workflows walk a
//! validated DAG of phases and control nodes. Execution history is
//! append-only and visible to every subsequent hook, and one shared buffer
//! threads through all hooks, surviving replays.
//!
//! # Example
//!
//! ```
//! use steadfast_workflow::{Decision, Engine, Phase, Workflow};
//! use steadfast_executor::Operation;
//! use steadfast_core::OperationError;
//!
//! # async fn example() {
//! let workflow = Workflow::linear(
//!     "etl",
//!     vec![
//!         Phase::new("extract")
//!             .operation(Operation::call("pull", |_| async { Ok(1u32) })),
//!         Phase::new("load")
//!             .operation(Operation::call("push", |_| async { Ok(2u32) })),
//!     ],
//! );
//!
//! let engine: Engine<u32> = Engine::default();
//! let result = engine.run(&workflow).await.unwrap();
//! assert!(result.success);
//! assert_eq!(result.history.len(), 2);
//! # }
//! ```

mod branch;
mod engine;
mod graph;
mod phase;

pub use branch::{
    Branch, BranchDecision, BranchDecisionHook, BranchDecisionInput, BranchResult,
};
pub use engine::{
    Engine, Workflow, WorkflowConfig, WorkflowDefinition, WorkflowResult, LOOP_EXCEEDED_REASON,
    REPLAY_EXHAUSTED_ERROR,
};
pub use graph::{
    ConditionalFn, ConditionalInput, EdgeCondition, GraphBuilder, GraphEdge, GraphNode,
    WorkflowGraph,
};
pub use phase::{
    Decision, DecisionHook, DecisionInput, ExecutionMode, Phase, PhaseExecution, PhaseResult,
};

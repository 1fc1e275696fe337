//! Backward jump, then continue: init → process → validate → process →
//! validate → finalize.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use steadfast_executor::Operation;
use steadfast_workflow::{Decision, Engine, Phase, Workflow};

fn phase(id: &str) -> Phase<u32> {
    Phase::new(id).operation(Operation::call(format!("{id}-op"), |_| async { Ok(0u32) }))
}

#[tokio::test]
async fn backward_jump_then_continue() {
    let validations = Arc::new(AtomicU32::new(0));
    let validations_clone = Arc::clone(&validations);

    let validate = phase("validate").on_decision(move |_input| {
        let validations = Arc::clone(&validations_clone);
        async move {
            if validations.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Decision::Jump {
                    target: "process".to_string(),
                })
            } else {
                Ok(Decision::Continue)
            }
        }
    });

    let workflow = Workflow::linear(
        "etl",
        vec![phase("init"), phase("process"), validate, phase("finalize")],
    );

    let engine: Engine<u32> = Engine::default();
    let result = engine.run(&workflow).await.unwrap();

    assert!(result.success);
    assert_eq!(result.history.len(), 6);
    assert_eq!(
        result
            .history
            .iter()
            .map(|record| record.phase_id.as_str())
            .collect::<Vec<_>>(),
        vec!["init", "process", "validate", "process", "validate", "finalize"]
    );

    let validate_runs = result.executions_of("validate");
    assert_eq!(validate_runs[0].execution_number, 1);
    assert_eq!(validate_runs[1].execution_number, 2);

    // The jump is visible in the history record that chose it.
    assert_eq!(validate_runs[0].decision.as_deref(), Some("jump:process"));
    assert_eq!(validate_runs[1].decision.as_deref(), Some("continue"));
}

#[tokio::test]
async fn terminated_workflows_have_no_successor_records() {
    let terminator = phase("gate").on_decision(|_| async {
        Ok(Decision::Terminate {
            reason: Some("quota exhausted".to_string()),
        })
    });
    let workflow = Workflow::linear("wf", vec![phase("first"), terminator, phase("unreached")]);

    let engine: Engine<u32> = Engine::default();
    let result = engine.run(&workflow).await.unwrap();

    assert!(result.terminated_early);
    assert_eq!(result.termination_reason.as_deref(), Some("quota exhausted"));
    let last = result.history.last().unwrap();
    assert_eq!(last.phase_id, "gate");
}

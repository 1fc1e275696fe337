//! Buffer transactions stay serialised under heavy interleaving.

use std::sync::Arc;
use std::time::Duration;
use steadfast::prelude::*;
use steadfast_buffer::StableBuffer;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn k_increments_from_zero_yield_k() {
    const K: u64 = 200;
    let buffer = Arc::new(StableBuffer::new("tally", serde_json::json!({ "x": 0 })));

    let mut handles = Vec::new();
    for _ in 0..K {
        let buffer = Arc::clone(&buffer);
        handles.push(tokio::spawn(async move {
            buffer
                .transaction(|mut state| async move {
                    let x = state["x"].as_u64().unwrap_or(0);
                    state["x"] = serde_json::json!(x + 1);
                    // Yield mid-transaction to invite interleaving.
                    tokio::task::yield_now().await;
                    Ok(state)
                })
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(buffer.read()["x"].as_u64(), Some(K));
    let metrics = buffer.metrics();
    assert_eq!(metrics.total_transactions, K);
    assert_eq!(metrics.committed, K);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_never_observe_partial_transactions() {
    let buffer = Arc::new(StableBuffer::new(
        "pair",
        serde_json::json!({ "a": 0, "b": 0 }),
    ));

    let writer = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            for _ in 0..50 {
                buffer
                    .transaction(|mut state| async move {
                        let next = state["a"].as_u64().unwrap() + 1;
                        state["a"] = serde_json::json!(next);
                        tokio::task::yield_now().await;
                        // Both fields always move together.
                        state["b"] = serde_json::json!(next);
                        Ok(state)
                    })
                    .await
                    .unwrap();
            }
        })
    };

    let reader = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            for _ in 0..200 {
                let state = buffer.read();
                assert_eq!(state["a"], state["b"], "read saw a half-applied transaction");
                tokio::time::sleep(Duration::from_micros(100)).await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
}

#[tokio::test]
async fn failed_transactions_roll_back_in_a_workflow() {
    let buffer: SharedBuffer = Arc::new(StableBuffer::new(
        "wf-state",
        serde_json::json!({ "committed": 0 }),
    ));

    let op = Operation::call("writer", |input| async move {
        let buffer = input.buffer.unwrap();
        buffer
            .transaction(|mut state| async move {
                state["committed"] = serde_json::json!(1);
                Ok(state)
            })
            .await?;
        // The second transaction fails and must not commit.
        let _ = buffer
            .transaction(|mut state| async move {
                state["committed"] = serde_json::json!(999);
                if state["committed"] == serde_json::json!(999) {
                    return Err(OperationError::validation("rejected by business rule"));
                }
                Ok(state)
            })
            .await;
        Ok(0u32)
    })
    .with_buffer(Arc::clone(&buffer));

    let result = Runner::new().execute(&op).await;
    assert!(result.success);
    assert_eq!(buffer.read()["committed"], serde_json::json!(1));
}

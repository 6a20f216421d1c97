//! Saga engine: forward execution, LIFO rollback, deterministic resume
//! and best-effort compensation flagging.

use std::sync::{Arc, Mutex};

use server_core::kernel::saga::{
    InMemorySagaStore, SagaAction, SagaActionStatus, SagaEngine, SagaRun, SagaStatus, SagaStep,
    SagaStore, StepOutcome,
};

/// Records the order of step/compensation invocations.
#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: &str) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry.to_string());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn ok_step(name: &'static str, log: &CallLog) -> SagaStep {
    let run_log = log.clone();
    let comp_log = log.clone();
    SagaStep::new(
        name,
        serde_json::json!({"step": name}),
        move |payload| {
            let log = run_log.clone();
            async move {
                log.push(&format!("run:{}", payload["step"].as_str().unwrap()));
                Ok(StepOutcome::new(
                    serde_json::json!({"done": true}),
                    serde_json::json!({"undo": payload["step"]}),
                ))
            }
        },
        move |payload| {
            let log = comp_log.clone();
            async move {
                log.push(&format!("undo:{}", payload["undo"].as_str().unwrap()));
                Ok(())
            }
        },
    )
}

fn failing_step(name: &'static str, log: &CallLog) -> SagaStep {
    let run_log = log.clone();
    SagaStep::new(
        name,
        serde_json::json!({"step": name}),
        move |_payload| {
            let log = run_log.clone();
            async move {
                log.push(&format!("run:{name}"));
                anyhow::bail!("step {name} refused")
            }
        },
        |_payload| async move { Ok(()) },
    )
}

#[tokio::test]
async fn all_steps_execute_in_order_on_success() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    let steps = vec![ok_step("reserve", &log), ok_step("bill", &log), ok_step("notify", &log)];
    let run = engine.run("provision", None, &steps).await.unwrap();

    assert_eq!(run.status, SagaStatus::Succeeded);
    assert_eq!(log.entries(), vec!["run:reserve", "run:bill", "run:notify"]);

    let actions = store.list_actions(run.id).await.unwrap();
    assert_eq!(actions.len(), 3);
    assert!(actions.iter().all(|a| a.status == SagaActionStatus::Executed));
}

#[tokio::test]
async fn failure_rolls_back_executed_steps_in_reverse() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    let steps = vec![
        ok_step("reserve", &log),
        ok_step("bill", &log),
        failing_step("notify", &log),
    ];
    let err = engine.run("provision", None, &steps).await.unwrap_err();
    assert!(err.to_string().contains("notify"));

    // Forward order, then compensation strictly LIFO.
    assert_eq!(
        log.entries(),
        vec!["run:reserve", "run:bill", "run:notify", "undo:bill", "undo:reserve"]
    );

    let run_id = store.runs().into_iter().next().unwrap().id;
    let actions = store.list_actions(run_id).await.unwrap();
    assert_eq!(actions[0].status, SagaActionStatus::Compensated);
    assert_eq!(actions[1].status, SagaActionStatus::Compensated);
    assert_eq!(actions[2].status, SagaActionStatus::Failed);

    let run = store.get_run(actions[0].saga_run_id).await.unwrap();
    assert_eq!(run.status, SagaStatus::Failed);
    assert!(run.error.unwrap().contains("notify"));
}

#[tokio::test]
async fn resume_skips_executed_steps() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    // A previous worker executed step 0 and died before step 1.
    let run = store
        .create_run(SagaRun::new("provision", None))
        .await
        .unwrap();
    let mut done = SagaAction::pending(run.id, 0, "reserve", serde_json::json!({"step": "reserve"}));
    done.status = SagaActionStatus::Executed;
    done.compensation_payload = Some(serde_json::json!({"undo": "reserve"}));
    store.record_action(done).await.unwrap();

    let steps = vec![ok_step("reserve", &log), ok_step("bill", &log)];
    let resumed = engine.resume(run.id, &steps).await.unwrap();

    assert_eq!(resumed.status, SagaStatus::Succeeded);
    // Step 0 never re-ran.
    assert_eq!(log.entries(), vec!["run:bill"]);
}

#[tokio::test]
async fn resume_finishes_an_interrupted_rollback() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    let run = store
        .create_run(SagaRun::new("provision", None))
        .await
        .unwrap();
    let mut executed =
        SagaAction::pending(run.id, 0, "reserve", serde_json::json!({"step": "reserve"}));
    executed.status = SagaActionStatus::Executed;
    executed.compensation_payload = Some(serde_json::json!({"undo": "reserve"}));
    store.record_action(executed).await.unwrap();
    store
        .set_run_status(run.id, SagaStatus::Compensating, Some("step 'bill' failed"))
        .await
        .unwrap();

    let steps = vec![ok_step("reserve", &log), failing_step("bill", &log)];
    let resumed = engine.resume(run.id, &steps).await.unwrap();

    assert_eq!(resumed.status, SagaStatus::Failed);
    assert_eq!(log.entries(), vec!["undo:reserve"]);
}

#[tokio::test]
async fn failed_compensation_is_flagged_and_the_saga_still_fails() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    let sticky = SagaStep::new(
        "reserve",
        serde_json::json!({"step": "reserve"}),
        |_payload| async move {
            Ok(StepOutcome::new(
                serde_json::json!({}),
                serde_json::json!({}),
            ))
        },
        |_payload| async move { anyhow::bail!("undo endpoint is down") },
    );
    let steps = vec![sticky, failing_step("bill", &log)];

    let err = engine.run("provision", None, &steps).await.unwrap_err();
    assert!(err.to_string().contains("bill"));

    let run_id = store.runs().into_iter().next().unwrap().id;
    let actions = store.list_actions(run_id).await.unwrap();

    // The un-undoable action stays executed, flagged for an operator.
    assert_eq!(actions[0].status, SagaActionStatus::Executed);
    assert!(actions[0].needs_attention);
    assert!(actions[0].error.as_ref().unwrap().contains("undo endpoint"));

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, SagaStatus::Failed);
}

#[tokio::test]
async fn resuming_a_terminal_saga_is_a_noop() {
    let store = Arc::new(InMemorySagaStore::new());
    let engine = SagaEngine::new(store.clone());
    let log = CallLog::default();

    let steps = vec![ok_step("reserve", &log)];
    let run = engine.run("provision", None, &steps).await.unwrap();
    assert_eq!(run.status, SagaStatus::Succeeded);

    let resumed = engine.resume(run.id, &steps).await.unwrap();
    assert_eq!(resumed.status, SagaStatus::Succeeded);
    // Nothing re-ran.
    assert_eq!(log.entries(), vec!["run:reserve"]);
}

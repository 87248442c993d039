//! End-to-end scenarios driving a full agent against scripted collaborators.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use troupe_kernel::agent::AgentState;
use troupe_kernel::message::{InboundMessage, SAY_KEY};
use troupe_kernel::services::{MessageBus, PersistenceService};
use troupe_kernel::step::{OutputRecord, StepStatus, verb};
use troupe_testing::{Scripted, TestHarness, test_config};

/// Poll until the agent reaches a terminal state, or fail the test.
async fn wait_terminal(agent: &troupe_runtime::Agent, timeout: Duration) -> AgentState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = agent.state().await;
        if state.is_terminal() {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent did not reach a terminal state in time (state: {state})"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_state(agent: &troupe_runtime::Agent, wanted: AgentState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while agent.state().await != wanted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never reached {wanted}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenario 1 — happy-path plan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_plan_produces_final_output() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([
                    {
                        "verb": "THINK",
                        "id": "think",
                        "inputs": {"prompt": {"literal": "list primes up to 10"}},
                        "outputs": {"answer": "the primes"}
                    },
                    {
                        "verb": "RETURN",
                        "inputs": {"answer": {"output": {"task": "think", "output": "answer"}}},
                        "outputs": {"answer": "final answer"}
                    }
                ]),
            )])],
        )
        .await;
    harness
        .reasoner
        .script(
            verb::THINK,
            vec![Scripted::ok(vec![OutputRecord::new(
                "answer",
                json!("2, 3, 5, 7"),
            )])],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("list primes up to 10").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );

    // Final output carries the primes.
    let output = agent.output().await.expect("agent output");
    let answer = output
        .outputs
        .iter()
        .find(|r| r.name == "answer")
        .expect("answer output");
    assert_eq!(answer.result, json!("2, 3, 5, 7"));

    // One work-product per completed step, no failure reflection.
    let steps = agent.steps().await;
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    assert!(completed >= 3, "expected the seeded plan to complete");
    assert_eq!(harness.persistence.work_product_count().await, completed);
    assert_eq!(harness.reasoner.failure_reflections().await, 0);

    // Completion invariant: every declared output has a result entry.
    for step in steps.iter().filter(|s| s.status == StepStatus::Completed) {
        for declared in step.outputs.keys() {
            assert!(
                step.result.iter().any(|r| &r.name == declared),
                "step {} missing declared output {declared}",
                step.verb
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario 2 — transient retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_with_backoff() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{
                    "verb": "CALL",
                    "inputs": {"url": {"literal": "https://example.test"}},
                    "outputs": {"result": "the response"}
                }]),
            )])],
        )
        .await;
    harness
        .capability
        .script(
            "CALL",
            vec![
                Scripted::err("request timed out"),
                Scripted::err("request timed out"),
                Scripted::ok(vec![OutputRecord::new("result", json!("ok"))]),
            ],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("call the service").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );

    let steps = agent.steps().await;
    let call = steps.iter().find(|s| s.verb == "CALL").expect("CALL step");
    assert_eq!(call.status, StepStatus::Completed);
    assert_eq!(call.retry_count, 2);
    assert_eq!(harness.capability.call_count("CALL").await, 3);
    assert_eq!(harness.reasoner.failure_reflections().await, 0);
}

// ---------------------------------------------------------------------------
// Scenario 3 — validation replan
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_failure_triggers_one_replan() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{"verb": "CALL", "outputs": {"result": "the response"}}]),
            )])],
        )
        .await;
    harness
        .capability
        .script(
            "CALL",
            vec![
                Scripted::err("missing required input 'url'"),
                Scripted::ok(vec![OutputRecord::new("result", json!("fixed"))]),
            ],
        )
        .await;
    harness
        .reasoner
        .script(
            troupe_testing::FAILURE_REFLECT,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{
                    "verb": "CALL",
                    "inputs": {"url": {"literal": "https://example.test"}},
                    "outputs": {"result": "the response"}
                }]),
            )])],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("call the service").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );

    assert_eq!(harness.reasoner.failure_reflections().await, 1);

    let steps = agent.steps().await;
    let failed_calls = steps
        .iter()
        .filter(|s| s.verb == "CALL" && s.status == StepStatus::Error)
        .count();
    let completed_calls = steps
        .iter()
        .filter(|s| s.verb == "CALL" && s.status == StepStatus::Completed)
        .count();
    assert_eq!(failed_calls, 1);
    assert_eq!(completed_calls, 1);

    // Exactly one failure event was recorded.
    let failures = harness
        .persistence
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e.kind, troupe_kernel::event::StepEventKind::Failed { .. }))
        .count();
    assert_eq!(failures, 1);
}

// ---------------------------------------------------------------------------
// Scenario 4 — infinite reflection loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_reflection_plans_terminate_the_agent() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{"verb": "CALL"}]),
            )])],
        )
        .await;
    // Every attempt fails the same way, and reflection proposes the same
    // plan every time.
    harness
        .capability
        .script("CALL", vec![Scripted::err("invalid input schema")])
        .await;
    harness
        .reasoner
        .script(
            troupe_testing::FAILURE_REFLECT,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{"verb": "CALL"}]),
            )])],
        )
        .await;

    // Watch the bus for the user-visible unrecoverable message.
    let says: Arc<tokio::sync::Mutex<Vec<serde_json::Value>>> = Arc::default();
    let mut bus_rx = harness.bus.subscribe();
    let collected = says.clone();
    tokio::spawn(async move {
        while let Ok(envelope) = bus_rx.recv().await {
            if envelope.routing_key == SAY_KEY {
                collected.lock().await.push(envelope.payload);
            }
        }
    });

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("doomed mission").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Error
    );

    // Three identical signatures were observed before giving up.
    assert_eq!(harness.reasoner.failure_reflections().await, 3);

    let says = says.lock().await;
    assert!(
        says.iter().any(|s| {
            s["category"] == json!("unrecoverable")
                && s["text"]
                    .as_str()
                    .is_some_and(|t| t.contains("infinite reflection loop"))
        }),
        "expected an infinite-reflection-loop message, got: {says:?}"
    );
}

// ---------------------------------------------------------------------------
// Scenario 5 — FOREACH with batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreach_batches_preserve_item_order() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{
                    "verb": "FOREACH",
                    "inputs": {
                        "array": {"literal": [1, 2, 3, 4, 5]},
                        "batch_size": {"literal": 2},
                        "steps": {"literal": [
                            {"verb": "ECHO", "inputs": {"item": {"output": {"task": 0, "output": "item"}}}}
                        ]}
                    }
                }]),
            )])],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("echo every item").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );

    let steps = agent.steps().await;
    let foreach = steps
        .iter()
        .find(|s| s.verb == verb::FOREACH)
        .expect("FOREACH step");
    assert_eq!(foreach.status, StepStatus::Completed);
    assert_eq!(
        foreach.output("execution_status").unwrap().result,
        json!("completed")
    );

    let echoes: Vec<&troupe_kernel::step::Step> =
        steps.iter().filter(|s| s.verb == "ECHO").collect();
    assert_eq!(echoes.len(), 5);
    assert!(echoes.iter().all(|s| s.status == StepStatus::Completed));
    // Every emitted step belongs to the FOREACH scope.
    assert!(echoes.iter().all(|s| s.scope_id == Some(foreach.id)));

    // Dispatch order preserves item order.
    let seen: Vec<i64> = harness
        .capability
        .calls
        .read()
        .await
        .iter()
        .filter(|c| c.verb == "ECHO")
        .filter_map(|c| c.inputs.get("item").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

// ---------------------------------------------------------------------------
// Scenario 6 — delegation to a role-specialised sibling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delegation_transfers_ownership_and_returns_the_result() {
    let harness = TestHarness::new();
    let mission = Uuid::new_v4();

    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{
                    "verb": "SUMMARIZE",
                    "inputs": {"text": {"literal": "a long report"}},
                    "outputs": {"summary": "the summary"},
                    "recommended_role": "critic"
                }]),
            )])],
        )
        .await;
    harness
        .capability
        .script(
            "SUMMARIZE",
            vec![Scripted::ok(vec![OutputRecord::new(
                "summary",
                json!("a fine summary"),
            )])],
        )
        .await;

    // The critic sibling runs first and registers itself.
    let critic = harness.agent(mission, "critic", test_config());
    let critic_runner = critic.clone();
    tokio::spawn(async move { critic_runner.run().await });
    wait_state(&critic, AgentState::Running, Duration::from_secs(2)).await;

    let executor = harness.agent(mission, "executor", test_config());
    executor.seed_goal("summarize the report").await;
    let executor_runner = executor.clone();
    tokio::spawn(async move { executor_runner.run().await });

    assert_eq!(
        wait_terminal(&executor, Duration::from_secs(5)).await,
        AgentState::Completed
    );

    // The delegator sees the step completed with one delegation record.
    let executor_steps = executor.steps().await;
    let mirror = executor_steps
        .iter()
        .find(|s| s.verb == "SUMMARIZE")
        .expect("delegated step mirror");
    assert_eq!(mirror.status, StepStatus::Completed);
    assert_eq!(mirror.delegation_history.len(), 1);
    assert_eq!(mirror.delegation_history[0].from_agent, executor.id());
    assert_eq!(mirror.delegation_history[0].to_agent, critic.id());
    assert_eq!(
        mirror.output("summary").unwrap().result,
        json!("a fine summary")
    );

    // The target executed it and owns it in the registry.
    let critic_steps = critic.steps().await;
    let accepted: Vec<_> = critic_steps
        .iter()
        .filter(|s| s.verb == "SUMMARIZE")
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].status, StepStatus::Completed);
    assert_eq!(accepted[0].current_owner, critic.id());
    let location = harness.directory.location(mirror.id).expect("step location");
    assert_eq!(location.owner_agent_id, critic.id());

    // The summarize call happened on the critic's side exactly once.
    assert_eq!(harness.capability.call_count("SUMMARIZE").await, 1);
}

// ---------------------------------------------------------------------------
// User input round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_input_needed_parks_and_resumes_on_answer() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{"verb": "CALL", "outputs": {"answer": "the answer"}}]),
            )])],
        )
        .await;
    harness
        .capability
        .script(
            "CALL",
            vec![Scripted::err("needs clarification from the user")],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("ask if unsure").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    // The step parks and a question reaches the gateway.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let request_id = loop {
        if let Some(q) = harness.gateway.questions.read().await.first() {
            break q.request_id;
        }
        assert!(tokio::time::Instant::now() < deadline, "no question asked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let steps = agent.steps().await;
    assert!(
        steps
            .iter()
            .any(|s| s.verb == "CALL" && s.status == StepStatus::Waiting)
    );

    // Answer arrives through the bus route registered by the harness.
    harness
        .bus
        .send(
            agent.id(),
            InboundMessage::UserInputResponse {
                request_id,
                response: json!("the user says yes"),
            },
        )
        .await
        .expect("bus route");

    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );
    let steps = agent.steps().await;
    let call = steps.iter().find(|s| s.verb == "CALL").unwrap();
    assert_eq!(call.status, StepStatus::Completed);
    assert_eq!(
        call.output("answer").unwrap().result,
        json!("the user says yes")
    );
}

// ---------------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_interrupts_and_resume_finishes() {
    let harness = TestHarness::new();
    harness
        .reasoner
        .script(
            verb::ACCOMPLISH,
            vec![Scripted::ok(vec![OutputRecord::plan(
                "plan",
                json!([{"verb": "SLOW", "outputs": {"done": "completion marker"}}]),
            )])],
        )
        .await;
    harness
        .capability
        .script(
            "SLOW",
            vec![
                Scripted::ok(vec![OutputRecord::new("done", json!(true))]).with_delay(400),
            ],
        )
        .await;

    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("slow work").await;
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    // Let the slow step start, then pause mid-flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.pause().await.expect("pause");
    assert_eq!(agent.state().await, AgentState::Paused);
    assert!(
        agent
            .steps()
            .await
            .iter()
            .all(|s| s.status != StepStatus::Completed || s.verb != "SLOW"),
        "slow step must not have completed while paused"
    );

    // A snapshot was persisted on pause.
    assert!(
        harness
            .persistence
            .load_snapshot(agent.id())
            .await
            .unwrap()
            .is_some()
    );

    agent.resume().await.expect("resume");
    assert_eq!(
        wait_terminal(&agent, Duration::from_secs(5)).await,
        AgentState::Completed
    );
    let steps = agent.steps().await;
    assert!(
        steps
            .iter()
            .any(|s| s.verb == "SLOW" && s.status == StepStatus::Completed)
    );
}

// ---------------------------------------------------------------------------
// Snapshot round trip (non-derived state restored)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_restores_all_step_fields() {
    let harness = TestHarness::new();
    let agent = harness.agent(Uuid::new_v4(), "executor", test_config());
    agent.seed_goal("round trip").await;
    agent
        .handle_message(InboundMessage::UserMessage {
            content: "hello agent".into(),
        })
        .await;

    agent.checkpoint().await.expect("checkpoint");
    let snapshot = harness
        .persistence
        .load_snapshot(agent.id())
        .await
        .unwrap()
        .expect("snapshot saved");

    let restored = troupe_runtime::Agent::from_snapshot(snapshot, harness.services());
    assert_eq!(restored.id(), agent.id());
    assert_eq!(restored.mission_id(), agent.mission_id());

    let original_steps = agent.steps().await;
    let restored_steps = restored.steps().await;
    assert_eq!(original_steps.len(), restored_steps.len());
    for (a, b) in original_steps.iter().zip(&restored_steps) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.verb, b.verb);
        assert_eq!(a.status, b.status);
        assert_eq!(a.input_refs.len(), b.input_refs.len());
        assert_eq!(a.dependencies, b.dependencies);
        assert_eq!(a.outputs, b.outputs);
    }
    assert_eq!(restored.conversation().await.len(), 1);
}

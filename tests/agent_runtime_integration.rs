use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use taskforge::domain::models::event::TaskStatus;
use taskforge::domain::models::task::TaskSpec;
use taskforge::domain::ports::llm_client::ScriptedLlm;
use taskforge::domain::ports::message_channel::BufferedChannel;
use taskforge::domain::ports::tool_registry::{ToolDescriptor, ToolOutcome};
use taskforge::infrastructure::InMemoryToolRegistry;
use taskforge::{AgentMessage, AgentResponse, AgentRuntime, AgentRuntimeBuilder, EngineConfig};

/// Registry whose tools append their invocation order to a shared list.
fn ordered_registry(order: Arc<Mutex<Vec<String>>>) -> Arc<InMemoryToolRegistry> {
    let registry = InMemoryToolRegistry::new();
    for name in ["compile", "unit-test", "package"] {
        let order = Arc::clone(&order);
        registry.register(
            ToolDescriptor::new(name).with_operations(["run"]),
            Arc::new(move |_operation, params| {
                let order = Arc::clone(&order);
                let name = params
                    .get("self")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                Box::pin(async move {
                    order.lock().unwrap().push(name.clone());
                    Ok(ToolOutcome::ok(json!({ "ran": name })))
                })
            }),
        );
    }
    Arc::new(registry)
}

fn runtime_with(
    registry: Arc<InMemoryToolRegistry>,
    channel: Arc<BufferedChannel>,
) -> Arc<AgentRuntime> {
    AgentRuntimeBuilder::new(EngineConfig::default())
        .llm(Arc::new(ScriptedLlm::new(["done"])))
        .tools(registry)
        .channel(channel)
        .build()
}

#[tokio::test]
async fn execute_bt_end_to_end() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let channel = Arc::new(BufferedChannel::new());
    let runtime = runtime_with(ordered_registry(Arc::clone(&order)), Arc::clone(&channel));

    let response = runtime
        .handle_message(AgentMessage::ExecuteBt {
            session_id: "s1".to_string(),
            bt_config: json!({
                "name": "pipeline",
                "steps": [
                    {"type": "chat", "message": "starting build", "output_variable": "intro"},
                    {"type": "state", "action": "update", "updates": {"phase": "build"}},
                    {"type": "tool", "tool": "compile", "operation": "run",
                     "params": {"self": "compile"}, "output_variable": "compile_result"}
                ]
            }),
            context: None,
        })
        .await;

    let outcome = match response {
        AgentResponse::BtExecutionResult(outcome) => outcome,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(outcome.success, "errors: {:?}", outcome.errors);
    assert_eq!(outcome.artifacts["intro"], json!("starting build"));
    assert_eq!(outcome.artifacts["compile_result"]["success"], json!(true));

    // The chat step went out through the message channel.
    assert_eq!(channel.messages().len(), 1);
    assert_eq!(channel.messages()[0].1, "starting build");

    // The workflow left a completed projection and an audit entry.
    let stats = runtime.log().get_stats();
    assert!(stats.total_events >= 4);
    assert!(runtime.audit().verify_audit_integrity().valid);
    assert_eq!(runtime.audit().stats().entries_by_type["bt_execution"], 1);
}

#[tokio::test]
async fn run_tasks_respects_dependency_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(Arc::clone(&order)), Arc::new(BufferedChannel::new()));

    let tasks = vec![
        TaskSpec {
            params: HashMap::from([("self".to_string(), json!("package"))]),
            ..TaskSpec::new("package")
                .with_tool("package")
                .with_dependencies(["unit-test"])
        },
        TaskSpec {
            params: HashMap::from([("self".to_string(), json!("compile"))]),
            ..TaskSpec::new("compile").with_tool("compile")
        },
        TaskSpec {
            params: HashMap::from([("self".to_string(), json!("unit-test"))]),
            ..TaskSpec::new("unit-test")
                .with_tool("unit-test")
                .with_dependencies(["compile"])
        },
    ];

    let (plan, outcomes) = runtime.run_tasks(tasks, false).await.unwrap();
    assert_eq!(plan.execution_order.len(), 3);
    assert!(outcomes.values().all(|o| o.success));

    let ran = order.lock().unwrap().clone();
    let pos = |name: &str| ran.iter().position(|r| r == name).unwrap();
    assert!(pos("compile") < pos("unit-test"));
    assert!(pos("unit-test") < pos("package"));

    // Strategy execution journaled completed projections per task.
    for task in ["compile", "unit-test", "package"] {
        assert_eq!(runtime.log().get_projection(task).status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn events_flow_into_history_manager() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(order), Arc::new(BufferedChannel::new()));

    runtime
        .handle_message(AgentMessage::ExecuteBt {
            session_id: "s1".to_string(),
            bt_config: json!({
                "steps": [{"type": "state", "action": "update", "updates": {"x": 1}}]
            }),
            context: None,
        })
        .await;

    // The bridge drains asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let histories = runtime.history().get_all_histories().await;
    assert!(!histories.is_empty());
    let total: usize = histories.values().map(Vec::len).sum();
    assert_eq!(total as u64, runtime.log().get_stats().total_events);
}

#[tokio::test]
async fn capabilities_query_lists_tools() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(order), Arc::new(BufferedChannel::new()));

    let response = runtime
        .handle_message(AgentMessage::Query {
            query: "tools".to_string(),
            query_type: Some("capabilities".to_string()),
            session_id: None,
        })
        .await;

    match response {
        AgentResponse::QueryResponse { data } => {
            let tools = data["tools"].as_array().unwrap();
            assert_eq!(tools.len(), 3);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn tool_request_is_audited_and_guarded() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(order), Arc::new(BufferedChannel::new()));

    let response = runtime
        .handle_message(AgentMessage::ToolRequest {
            tool: "compile".to_string(),
            operation: "run".to_string(),
            params: HashMap::from([("self".to_string(), json!("compile"))]),
            session_id: "s1".to_string(),
        })
        .await;

    match response {
        AgentResponse::ToolResponse { success, result, .. } => {
            assert!(success);
            assert_eq!(result["ran"], json!("compile"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let audit = runtime.audit();
    assert_eq!(audit.stats().entries_by_type["tool_invocation"], 1);
    assert!(audit.verify_audit_integrity().valid);
}

#[tokio::test]
async fn export_state_reflects_workflow_artifacts() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(order), Arc::new(BufferedChannel::new()));

    runtime
        .handle_message(AgentMessage::ExecuteBt {
            session_id: "s1".to_string(),
            bt_config: json!({
                "steps": [
                    {"type": "chat", "message": "hello", "output_variable": "greeting"}
                ]
            }),
            context: None,
        })
        .await;

    let response = runtime
        .handle_message(AgentMessage::ExportState {
            from: "operator".to_string(),
            session_id: Some("s1".to_string()),
        })
        .await;

    match response {
        AgentResponse::ExportedState { data } => {
            assert_eq!(data["state"]["artifacts"]["greeting"], json!("hello"));
            // The chat step recorded a transcript entry.
            assert!(!data["state"]["history"].as_array().unwrap().is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_acknowledges_and_audits() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let runtime = runtime_with(ordered_registry(order), Arc::new(BufferedChannel::new()));

    let response = runtime
        .handle_message(AgentMessage::Shutdown {
            from: "operator".to_string(),
        })
        .await;
    assert!(matches!(response, AgentResponse::ShutdownComplete { .. }));
    assert_eq!(runtime.audit().stats().entries_by_type["shutdown"], 1);
}

//! Dispatcher scenarios driven through the full orchestrator loop: command
//! safety, inspector rewrites, and thread lookup.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{sample_report, text_response, tool_response, MockSamplingClient, ScriptedAdapter, StringInspector};
use dumpscope::models::sampling::ContentBlock;
use dumpscope::services::ai::{AiOrchestrator, OrchestratorConfig};
use dumpscope::services::inspector::ManagedObjectInspector;
use dumpscope::utils::cancel::CancellationToken;

fn single_round_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_iterations: 1,
        ..Default::default()
    }
}

async fn run_one_round(
    calls: Vec<(&str, &str, serde_json::Value)>,
    with_inspector: bool,
) -> (
    dumpscope::models::ai::AiAnalysis,
    Arc<ScriptedAdapter>,
    Arc<MockSamplingClient>,
) {
    let client = Arc::new(MockSamplingClient::new(vec![
        tool_response(calls),
        text_response(r#"{"rootCause": "n/a", "confidence": "low", "reasoning": "done"}"#),
    ]));
    let adapter = ScriptedAdapter::lldb();
    let inspector =
        with_inspector.then(|| Arc::new(StringInspector) as Arc<dyn ManagedObjectInspector>);
    let analysis = AiOrchestrator::new(single_round_config())
        .run(
            &sample_report(),
            adapter.clone(),
            inspector,
            client.clone(),
            &CancellationToken::new(),
        )
        .await;
    (analysis, adapter, client)
}

fn tool_results(client: &MockSamplingClient) -> Vec<String> {
    client.requests.lock()[1]
        .messages
        .iter()
        .flat_map(|m| m.content.clone())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { content, .. } => Some(content),
            _ => None,
        })
        .collect()
}

/// E3: shell escapes never reach the debugger.
#[tokio::test]
async fn unsafe_commands_never_reach_the_debugger() {
    let (_, adapter, client) = run_one_round(
        vec![
            ("tu_1", "exec", json!({"command": ".shell whoami"})),
            ("tu_2", "exec", json!({"command": "; .shell whoami"})),
            ("tu_3", "exec", json!({"command": "platform shell whoami"})),
        ],
        false,
    )
    .await;

    assert_eq!(adapter.command_count(), 0);
    for result in tool_results(&client) {
        assert!(result.contains("Blocked unsafe"), "got: {result}");
    }
}

/// E4: `sos dumpobj` becomes a structured inspect when the inspector is open.
#[tokio::test]
async fn dumpobj_rewrite_uses_inspector() {
    let (analysis, adapter, client) = run_one_round(
        vec![("tu_1", "exec", json!({"command": "sos dumpobj 0x1234"}))],
        true,
    )
    .await;

    assert_eq!(adapter.command_count(), 0);
    let results = tool_results(&client);
    assert!(results[0].contains("System.String"), "got: {}", results[0]);

    // The original exec call stays on the trace next to the inspect.
    let records = analysis.commands_executed.unwrap();
    assert!(records
        .iter()
        .any(|r| r.tool == "exec" && r.output.contains("rewritten to inspect")));
    assert!(records.iter().any(|r| r.tool == "inspect"));
}

/// LLDB `sos !name2ee …` is normalized before the adapter sees it.
#[tokio::test]
async fn lldb_sos_bang_normalization() {
    let (_, adapter, _) = run_one_round(
        vec![(
            "tu_1",
            "exec",
            json!({"command": "sos !name2ee System.Private.CoreLib System.String"}),
        )],
        false,
    )
    .await;

    let commands = adapter.commands.lock();
    assert_eq!(
        commands.as_slice(),
        &["sos name2ee System.Private.CoreLib System.String".to_string()]
    );
}

/// E6: a hex OS thread id resolves to the report thread that owns it.
#[tokio::test]
async fn thread_lookup_by_hex_os_id() {
    let (_, _, client) = run_one_round(
        vec![("tu_1", "get_thread_stack", json!({"threadId": "0x10"}))],
        false,
    )
    .await;

    let results = tool_results(&client);
    let parsed: serde_json::Value = serde_json::from_str(&results[0]).unwrap();
    assert_eq!(parsed["threadId"], "1");
    assert!(parsed["frames"].is_array());
}

#[tokio::test]
async fn unknown_thread_and_unknown_tool() {
    let (_, _, client) = run_one_round(
        vec![
            ("tu_1", "get_thread_stack", json!({"threadId": "0xdead"})),
            ("tu_2", "not_a_tool", json!({})),
        ],
        false,
    )
    .await;

    let results = tool_results(&client);
    assert_eq!(results[0], "Thread not found");
    assert_eq!(results[1], "Unknown tool");
}

/// report_get slices the serialized report with limit and select applied.
#[tokio::test]
async fn report_get_slices_the_report() {
    let (_, _, client) = run_one_round(
        vec![(
            "tu_1",
            "report_get",
            json!({
                "path": "analysis.exception.stackTrace",
                "limit": 1,
                "select": ["module", "function"]
            }),
        )],
        false,
    )
    .await;

    let results = tool_results(&client);
    let parsed: serde_json::Value = serde_json::from_str(&results[0]).unwrap();
    assert_eq!(parsed, json!([{"module": "App", "function": "Foo.Bar()"}]));
}

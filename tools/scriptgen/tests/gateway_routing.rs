mod common;

use common::Harness;
use scriptgen::config::AppConfig;
use scriptgen::errors::ProxyError;
use scriptgen::jsonrpc::{
    RequestId, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR, REQUEST_TIMEOUT,
};
use scriptgen::runtime::{ProxyEvent, Timer};
use serde_json::{json, Value};

fn call(id: &str, tool: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": tool, "arguments": {}}
    })
}

fn forwarded_ids(h: &Harness) -> Vec<String> {
    h.forwarded()
        .iter()
        .filter_map(|value| value["id"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn requests_before_readiness_are_forwarded_in_submission_order() {
    let mut h = Harness::new();
    for id in ["1", "2", "3"] {
        h.send_json(call(id, "browser_snapshot"));
    }
    assert_eq!(h.launcher.launch_count(), 1);
    assert!(h.forwarded().is_empty());
    assert_eq!(h.gateway.queued_count(), 3);

    h.fire(Timer::FirstProbe);
    assert!(h.forwarded().is_empty(), "probe must not release the queue");
    let probe = h.last_probe_id().expect("probe written");
    h.child_says(json!({"jsonrpc": "2.0", "id": probe, "result": {}}));

    assert!(h.gateway.is_ready());
    assert_eq!(forwarded_ids(&h), vec!["1", "2", "3"]);
    assert_eq!(h.gateway.queued_count(), 0);
    assert_eq!(h.gateway.pending_count(), 3);
}

#[test]
fn probe_like_response_without_reserved_prefix_never_makes_ready() {
    let mut h = Harness::new();
    h.send_json(call("1", "browser_snapshot"));

    h.child_says(json!({"jsonrpc": "2.0", "id": "check_health_1", "result": {}}));
    h.child_says(json!({"jsonrpc": "2.0", "id": 99, "result": {}}));

    assert!(!h.gateway.is_ready());
    assert!(h.forwarded().is_empty());
    // Untracked responses still reach the client untouched.
    assert_eq!(h.replies().len(), 2);
}

#[test]
fn responses_in_reverse_order_reach_their_own_callers() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("a", "browser_click"));
    h.send_json(call("b", "browser_type"));

    h.child_says(json!({"jsonrpc": "2.0", "id": "b", "result": {"from": "b"}}));
    h.child_says(json!({"jsonrpc": "2.0", "id": "a", "result": {"from": "a"}}));

    let replies = h.replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["id"], "b");
    assert_eq!(replies[0]["result"]["from"], "b");
    assert_eq!(replies[1]["id"], "a");
    assert_eq!(replies[1]["result"]["from"], "a");
    assert!(h.gateway.is_idle());
}

#[test]
fn numeric_and_text_ids_are_correlated_independently() {
    let mut h = Harness::new();
    h.make_ready();
    h.send(r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"browser_click"}}"#);
    h.send(r#"{"jsonrpc":"2.0","id":"7","method":"tools/call","params":{"name":"browser_click"}}"#);
    assert_eq!(h.gateway.pending_count(), 2);

    h.child_says(json!({"jsonrpc": "2.0", "id": 7, "result": {"kind": "number"}}));
    let replies = h.take_replies();
    assert_eq!(replies[0]["id"], 7);
    assert_eq!(h.gateway.pending_count(), 1);
}

#[test]
fn tools_list_contains_the_local_tool_exactly_once() {
    let mut h = Harness::new();
    h.make_ready();
    for id in [1, 2] {
        h.send_json(json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"}));
        h.child_says(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [
                {"name": "browser_navigate"},
                {"name": "playwright_script_generator"}
            ]}
        }));
    }

    for reply in h.replies() {
        let tools = reply["result"]["tools"].as_array().expect("tools array");
        let local = tools
            .iter()
            .filter(|tool| tool["name"] == "playwright_script_generator")
            .count();
        assert_eq!(local, 1);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "browser_navigate");
        assert_eq!(
            tools[1]["description"],
            "Generate a replay script from the recorded browser actions"
        );
    }
}

#[test]
fn navigate_scenario_updates_page_url_only_after_success() {
    let mut h = Harness::new();
    h.send_json(json!({
        "jsonrpc": "2.0",
        "id": "1",
        "method": "tools/call",
        "params": {"name": "browser_navigate", "arguments": {"url": "https://example.com"}}
    }));
    assert_eq!(h.gateway.queued_count(), 1);
    assert!(h.forwarded().is_empty());

    h.child_says(json!({"jsonrpc": "2.0", "id": "health_check_123", "result": {}}));
    assert_eq!(forwarded_ids(&h), vec!["1"]);
    assert_eq!(h.gateway.current_page_url(), "");

    let response = r#"{"jsonrpc":"2.0","id":"1","result":{"content":[{"type":"text","text":"ok"}]}}"#;
    let generation = h.generation();
    h.gateway.handle_event(ProxyEvent::ChildStdout {
        generation,
        line: response.to_string(),
    });
    assert_eq!(h.gateway.current_page_url(), "https://example.com");
    assert_eq!(h.sink.lines(), vec![response.to_string()]);
}

#[test]
fn failed_navigation_keeps_previous_page_url() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "browser/navigate",
        "params": {"url": "https://broken.test"}
    }));
    h.child_says(json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -1, "message": "net::ERR"}}));
    assert_eq!(h.gateway.current_page_url(), "");
    assert_eq!(h.replies()[0]["error"]["message"], "net::ERR");
}

#[test]
fn malformed_line_gets_parse_error_with_null_id_and_never_starts_the_child() {
    let mut h = Harness::new();
    h.send("{\"jsonrpc\":\"2.0\",\"id\":1,");
    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], Value::Null);
    assert_eq!(replies[0]["error"]["code"], PARSE_ERROR);
    assert_eq!(h.launcher.launch_count(), 0);

    h.send("   ");
    assert_eq!(h.replies().len(), 1);
}

#[test]
fn notifications_are_forwarded_without_waiting_for_a_reply() {
    let mut h = Harness::new();
    h.make_ready();
    h.send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
    assert_eq!(h.forwarded().len(), 1);
    assert!(h.gateway.is_idle());
    assert!(!h.scheduler.armed().iter().any(|t| matches!(t, Timer::CallDeadline(_))));
}

#[test]
fn child_requests_and_notifications_reach_the_client() {
    let mut h = Harness::new();
    h.make_ready();
    h.child_says(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "roots/list"}));
    h.child_says(json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}));
    h.child_says(json!("not an object"));
    let replies = h.replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["method"], "roots/list");
    assert_eq!(replies[1]["method"], "notifications/progress");
}

#[test]
fn write_failure_restarts_the_child_and_retries_the_request() {
    let mut h = Harness::new();
    h.make_ready();
    h.launcher.fail_next_writes(1);
    h.send_json(call("r", "browser_click"));

    assert!(!h.gateway.is_ready());
    assert_eq!(h.launcher.launch_count(), 2);
    assert_eq!(h.launcher.kills(), vec![1]);
    assert_eq!(h.gateway.queued_count(), 1);
    assert!(h.replies().is_empty());

    h.fire(Timer::FirstProbe);
    let probe = h.last_probe_id().expect("probe for new child");
    h.child_says(json!({"jsonrpc": "2.0", "id": probe, "result": {}}));
    assert_eq!(h.forwarded().len(), 1);
    assert_eq!(
        h.launcher.writes_for(2).iter().filter(|l| l.contains("\"r\"")).count(),
        1
    );

    h.child_says(json!({"jsonrpc": "2.0", "id": "r", "result": {}}));
    assert_eq!(h.replies()[0]["id"], "r");
}

#[test]
fn write_retries_are_bounded_and_end_in_an_error_reply() {
    let mut config = AppConfig::default();
    config.service.max_write_retries = 1;
    let mut h = Harness::with_config(config);
    h.make_ready();

    h.launcher.fail_next_writes(1);
    h.send_json(call("doomed", "browser_click"));
    h.fire(Timer::FirstProbe);
    let probe = h.last_probe_id().expect("probe");
    h.launcher.fail_next_writes(1);
    h.child_says(json!({"jsonrpc": "2.0", "id": probe, "result": {}}));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "doomed");
    assert_eq!(replies[0]["error"]["code"], INTERNAL_ERROR);
    assert!(h.gateway.is_idle());
    assert!(!h.scheduler.is_armed(&Timer::CallDeadline(RequestId::from("doomed"))));
}

#[test]
fn orphaned_calls_fail_when_a_write_failure_resets_the_child() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("first", "browser_click"));
    h.launcher.fail_next_writes(1);
    h.send_json(call("second", "browser_click"));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "first");
    assert_eq!(replies[0]["error"]["code"], INTERNAL_ERROR);
    assert_eq!(h.gateway.queued_count(), 1);
}

#[test]
fn failed_respawn_after_a_write_error_answers_the_request_at_once() {
    let mut h = Harness::new();
    h.make_ready();
    h.launcher.fail_next_writes(1);
    h.launcher
        .push_launch_failure(ProxyError::Process("failed to spawn npx: not found".to_string()));
    h.send_json(call("r", "browser_click"));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "r");
    assert_eq!(replies[0]["error"]["code"], INTERNAL_ERROR);
    assert!(replies[0]["error"]["message"]
        .as_str()
        .expect("message")
        .contains("failed to spawn"));
    assert!(h.gateway.is_idle());
    assert!(!h.scheduler.is_armed(&Timer::CallDeadline(RequestId::from("r"))));
}

#[test]
fn queued_requests_fail_together_when_the_replacement_cannot_spawn() {
    let mut h = Harness::new();
    h.send_json(call("a", "browser_click"));
    h.send_json(call("b", "browser_snapshot"));
    h.fire(Timer::FirstProbe);
    let probe = h.last_probe_id().expect("probe");

    h.launcher.fail_next_writes(1);
    h.launcher
        .push_launch_failure(ProxyError::Process("failed to spawn npx: not found".to_string()));
    h.child_says(json!({"jsonrpc": "2.0", "id": probe, "result": {}}));

    let replies = h.replies();
    let ids = replies.iter().map(|r| r["id"].clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![json!("a"), json!("b")]);
    assert!(replies
        .iter()
        .all(|r| r["error"]["code"] == INTERNAL_ERROR));
    assert!(h.gateway.is_idle());
    assert!(!h.scheduler.is_armed(&Timer::CallDeadline(RequestId::from("b"))));
}

#[test]
fn request_ids_with_the_probe_prefix_are_rejected() {
    let mut h = Harness::new();
    h.send_json(call("health_check_mine", "browser_click"));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "health_check_mine");
    assert_eq!(replies[0]["error"]["code"], INVALID_REQUEST);
    assert!(replies[0]["error"]["message"]
        .as_str()
        .expect("message")
        .contains("reserved"));
    assert_eq!(h.launcher.launch_count(), 0);
    assert!(h.gateway.recorded_actions().is_empty());
}

#[test]
fn a_second_request_with_an_id_in_flight_is_rejected() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("dup", "browser_click"));
    h.send_json(call("dup", "browser_snapshot"));

    let rejected = h.take_replies();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["id"], "dup");
    assert_eq!(rejected[0]["error"]["code"], INVALID_REQUEST);
    assert_eq!(forwarded_ids(&h), vec!["dup"]);

    h.child_says(json!({"jsonrpc": "2.0", "id": "dup", "result": {"n": 1}}));
    let answered = h.take_replies();
    assert_eq!(answered.len(), 1);
    assert_eq!(answered[0]["result"]["n"], 1);

    h.send_json(call("dup", "browser_snapshot"));
    assert_eq!(forwarded_ids(&h), vec!["dup", "dup"]);
    assert!(h.replies().is_empty());
}

#[test]
fn a_duplicate_of_a_queued_request_is_rejected() {
    let mut h = Harness::new();
    h.send_json(call("q", "browser_click"));
    h.send_json(call("q", "browser_click"));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["error"]["code"], INVALID_REQUEST);
    assert_eq!(h.gateway.queued_count(), 1);
    assert_eq!(h.gateway.recorded_actions().len(), 1);
}

#[test]
fn exit_forgets_timed_out_ids_of_the_dead_child() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("slow", "browser_wait_for"));
    assert!(h.fire(Timer::CallDeadline(RequestId::from("slow"))));
    h.child_exits(Some(1));
    h.sink.take_lines();

    h.fire(Timer::Restart);
    h.fire(Timer::FirstProbe);
    let probe = h.last_probe_id().expect("probe");
    h.child_says(json!({"jsonrpc": "2.0", "id": probe, "result": {}}));
    h.child_says(json!({"jsonrpc": "2.0", "id": "slow", "result": {}}));

    let replies = h.replies();
    assert_eq!(replies.len(), 1, "a stray answer from a new child is relayed");
    assert_eq!(replies[0]["id"], "slow");
}

#[test]
fn pending_call_times_out_and_late_answer_is_dropped() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("slow", "browser_wait_for"));
    assert!(h.fire(Timer::CallDeadline(RequestId::from("slow"))));

    let replies = h.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["error"]["code"], REQUEST_TIMEOUT);
    assert_eq!(
        replies[0]["error"]["message"],
        ProxyError::Timeout(120_000).to_string()
    );
    assert!(h.gateway.is_idle());

    h.child_says(json!({"jsonrpc": "2.0", "id": "slow", "result": {}}));
    assert!(h.replies().is_empty());
}

#[test]
fn queued_call_times_out_and_is_never_forwarded() {
    let mut h = Harness::new();
    h.send_json(call("q", "browser_click"));
    assert!(h.fire(Timer::CallDeadline(RequestId::from("q"))));
    assert_eq!(h.replies()[0]["error"]["code"], REQUEST_TIMEOUT);

    h.child_says(json!({"jsonrpc": "2.0", "id": "health_check_1", "result": {}}));
    assert!(h.forwarded().is_empty());
}

#[test]
fn answered_call_disarms_its_deadline() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("quick", "browser_click"));
    assert!(h.scheduler.is_armed(&Timer::CallDeadline(RequestId::from("quick"))));
    h.child_says(json!({"jsonrpc": "2.0", "id": "quick", "result": {}}));
    assert!(!h.scheduler.is_armed(&Timer::CallDeadline(RequestId::from("quick"))));
}

#[test]
fn startup_timeout_is_reported_to_the_triggering_request_only() {
    let mut h = Harness::new();
    h.send_json(call("first", "browser_click"));
    h.send_json(call("second", "browser_click"));
    assert!(h.fire(Timer::StartupDeadline));

    let replies = h.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "first");
    assert_eq!(replies[0]["error"]["code"], INTERNAL_ERROR);
    assert!(replies[0]["error"]["message"]
        .as_str()
        .expect("message")
        .contains("did not become ready within 30000 ms"));
    assert_eq!(h.gateway.queued_count(), 1);

    h.child_says(json!({"jsonrpc": "2.0", "id": "health_check_9", "result": {}}));
    assert_eq!(forwarded_ids(&h), vec!["second"]);
}

#[test]
fn spawn_failure_is_reported_to_the_caller_and_nothing_is_queued() {
    let mut h = Harness::new();
    h.launcher
        .push_launch_failure(ProxyError::Process("failed to spawn npx: not found".to_string()));
    h.send_json(call("x", "browser_click"));

    let replies = h.replies();
    assert_eq!(replies[0]["id"], "x");
    assert_eq!(replies[0]["error"]["code"], INTERNAL_ERROR);
    assert!(replies[0]["error"]["message"]
        .as_str()
        .expect("message")
        .contains("failed to spawn"));
    assert_eq!(h.gateway.queued_count(), 0);
    assert!(h.gateway.recorded_actions().is_empty());

    h.send_json(call("y", "browser_click"));
    assert_eq!(h.launcher.launch_count(), 1);
    assert_eq!(h.gateway.queued_count(), 1);
}

#[test]
fn output_from_a_replaced_child_is_ignored() {
    let mut h = Harness::new();
    h.make_ready();
    h.send_json(call("old", "browser_click"));
    h.child_exits(Some(1));
    h.sink.take_lines();
    h.fire(Timer::Restart);
    assert_eq!(h.generation(), 2);

    h.gateway.handle_event(ProxyEvent::ChildStdout {
        generation: 1,
        line: r#"{"jsonrpc":"2.0","id":"health_check_1","result":{}}"#.to_string(),
    });
    assert!(!h.gateway.is_ready());
    assert!(h.replies().is_empty());
}

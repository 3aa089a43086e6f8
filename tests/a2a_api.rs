mod common;

use axum::http::StatusCode;
use bigquery_agent::agent::AGENT_NAME;
use bigquery_agent::server::{build_a2a_app, build_a2a_app_with_url};
use serde_json::{Value, json};

use common::{call_sql, runtime, say, send};

fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn user_message(text: &str) -> Value {
    json!({
        "message": {
            "role": "user",
            "parts": [{"kind": "text", "text": text}],
            "messageId": "msg-1",
            "kind": "message"
        }
    })
}

#[tokio::test]
async fn agent_card_names_the_agent() {
    let app = build_a2a_app(runtime(Vec::new()), 8001);

    let (status, card) = send(&app, "GET", "/.well-known/agent-card.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["name"], AGENT_NAME);
    assert_eq!(card["url"], "http://localhost:8001/");
    assert_eq!(card["protocolVersion"], "0.3.0");
    assert_eq!(card["defaultInputModes"], json!(["text/plain"]));
    let skills = card["skills"].as_array().expect("skills");
    assert!(skills.iter().any(|skill| skill["name"] == "list_table_ids"));
}

#[tokio::test]
async fn public_url_overrides_the_card_url() {
    let app = build_a2a_app_with_url(runtime(Vec::new()), "https://agents.example.com/bq/");
    let (_, card) = send(&app, "GET", "/.well-known/agent-card.json", None).await;
    assert_eq!(card["url"], "https://agents.example.com/bq/");
}

#[tokio::test]
async fn message_send_completes_with_an_artifact() {
    let app = build_a2a_app(
        runtime(vec![
            call_sql("c1", "SELECT COUNT(*) AS n FROM sales_ds.orders"),
            say("There are 19 orders."),
        ]),
        8080,
    );

    let request = rpc(1, "message/send", user_message("How many orders?"));
    let (status, body) = send(&app, "POST", "/", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);

    let task = &body["result"];
    assert_eq!(task["kind"], "task");
    assert_eq!(task["status"]["state"], "completed");
    assert_eq!(task["artifacts"][0]["parts"][0]["kind"], "text");
    assert_eq!(task["artifacts"][0]["parts"][0]["text"], "There are 19 orders.");
    assert_eq!(task["history"][0]["role"], "user");
    assert_eq!(task["history"][1]["role"], "agent");
    assert!(task["contextId"].as_str().is_some_and(|id| !id.is_empty()));

    let task_id = task["id"].clone();
    let request = rpc(2, "tasks/get", json!({"id": task_id}));
    let (_, fetched) = send(&app, "POST", "/", Some(request)).await;
    assert_eq!(fetched["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn unknown_methods_and_tasks_are_jsonrpc_errors() {
    let app = build_a2a_app(runtime(Vec::new()), 8080);

    let request = rpc(5, "tasks/resubscribe-everything", json!({}));
    let (_, body) = send(&app, "POST", "/", Some(request)).await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 5);

    let request = rpc(6, "tasks/get", json!({"id": "no-such-task"}));
    let (_, body) = send(&app, "POST", "/", Some(request)).await;
    assert_eq!(body["error"]["code"], -32001);

    let request = rpc(7, "tasks/cancel", json!({"id": "no-such-task"}));
    let (_, body) = send(&app, "POST", "/", Some(request)).await;
    assert_eq!(body["error"]["code"], -32001);
}

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use common::{ScriptedAsr, ScriptedLlm, TestServer, ToneTts, spawn_server};
use xiaozhi_server::ServerConfig;
use xiaozhi_server::session::Providers;

async fn server() -> TestServer {
    let providers = Providers {
        asr: ScriptedAsr::new(&[]),
        llm: ScriptedLlm::new(""),
        tts: ToneTts::new(0),
    };
    spawn_server(ServerConfig::default(), providers).await
}

async fn tool_names(server: &TestServer, device_id: &str) -> Vec<String> {
    let url = server.http_url(&format!("/xiaozhi/api/mcp/tools/{device_id}"));
    let tools: Vec<Value> = reqwest::get(url).await.unwrap().json().await.unwrap();
    tools
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

/// Answer the handshake and tool listing the way an external MCP server would.
fn reply_for(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let result = match request["method"].as_str()? {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "home-assistant", "version": "1"},
            "capabilities": {"tools": {}},
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "light_on",
                "description": "Turn on the living room light",
                "inputSchema": {"type": "object", "properties": {}},
            }]
        }),
        _ => json!({}),
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

#[tokio::test]
async fn test_ws_endpoint_tools_follow_socket_lifetime() {
    let server = server().await;
    let device_id = "AA:BB:CC:DD:EE:10";

    let (socket, _) = connect_async(server.ws_url(&format!("/xiaozhi/mcp/{device_id}")))
        .await
        .unwrap();
    let (mut sink, mut stream) = socket.split();
    let mcp_server = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            let Message::Text(text) = frame else { continue };
            let request: Value = serde_json::from_str(&text).unwrap();
            if let Some(reply) = reply_for(&request) {
                sink.send(Message::Text(reply.to_string().into())).await.unwrap();
            }
            if request["method"] == "tools/list" {
                return sink;
            }
        }
        panic!("endpoint closed before listing tools");
    });

    let mut sink = tokio::time::timeout(Duration::from_secs(5), mcp_server)
        .await
        .expect("handshake did not complete")
        .unwrap();

    let mut attached = false;
    for _ in 0..50 {
        if tool_names(&server, device_id).await.contains(&"light_on".to_string()) {
            attached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(attached, "device tool never appeared in the listing");
    assert!(tool_names(&server, device_id).await.contains(&"local_exit_chat".to_string()));

    sink.send(Message::Close(None)).await.unwrap();

    let mut detached = false;
    for _ in 0..50 {
        if !tool_names(&server, device_id).await.contains(&"light_on".to_string()) {
            detached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(detached, "device tool outlived its endpoint socket");
}

#[tokio::test]
async fn test_tools_are_scoped_per_device() {
    let server = server().await;

    let names = tool_names(&server, "AA:BB:CC:DD:EE:11").await;

    assert!(names.contains(&"local_exit_chat".to_string()));
    assert!(!names.contains(&"light_on".to_string()));
}

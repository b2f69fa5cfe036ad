use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use taskloom_agents::{
    ChatMessage, ChatRole, EventSink, LlmProvider, LlmRequest, OpenAiProvider, StreamAssembler,
    StreamChunk,
};
use taskloom_common::Error;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(deltas: &[&str]) -> String {
    let mut body = String::new();
    body.push_str("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
    for delta in deltas {
        let chunk = json!({ "choices": [{ "delta": { "content": delta } }] });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn request() -> LlmRequest {
    LlmRequest {
        model: "gpt-4o".to_string(),
        messages: vec![ChatMessage::new(ChatRole::User, "list the files")],
        system: Some("You can use tools.".to_string()),
        max_tokens: Some(256),
        temperature: None,
    }
}

#[tokio::test]
async fn streams_text_and_tool_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "gpt-4o", "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                "Sure, let me check. <tool name=\"list_",
                "files\"><path>.</pa",
                "th></tool> Done.",
            ]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let feed = provider.stream(&request()).await.unwrap();
    let assembler = StreamAssembler::new(Arc::new(EventSink::disabled()));
    let blocks = assembler
        .consume(feed, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].text, "Sure, let me check.");
    let invocation = blocks[1].invocation.as_ref().unwrap();
    assert_eq!(invocation.name, "list_files");
    assert_eq!(invocation.param("path"), Some("."));
    assert_eq!(blocks[2].text, "Done.");
    assert!(blocks.iter().all(|b| !b.partial));
}

#[tokio::test]
async fn feed_ends_with_complete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse(&["Hello", " there"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let chunks: Vec<StreamChunk> = provider.stream(&request()).await.unwrap().collect().await;
    assert_eq!(chunks.last(), Some(&StreamChunk::Complete));
    assert!(chunks.contains(&StreamChunk::Text {
        content: "Hello there".to_string(),
        partial: false,
    }));
}

#[tokio::test]
async fn unauthorized_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("bad".to_string(), Some(server.uri()));
    let err = provider.stream(&request()).await.err().unwrap();
    assert!(matches!(err, Error::Authentication(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn server_errors_carry_the_status_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(server.uri()));
    let err = provider.stream(&request()).await.err().unwrap();
    assert!(err.to_string().contains("status=503"));
}

#[tokio::test]
async fn health_check_hits_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(format!("{}/", server.uri())));
    assert!(provider.health_check().await.unwrap());

    let down = OpenAiProvider::new("test-key".to_string(), Some("http://127.0.0.1:9".to_string()));
    assert!(!down.health_check().await.unwrap());
}

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EmbeddingError, LlmError};
use crate::provider::{ChatRequest, ChatResponse, LlmClient};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Client for an OpenAI-compatible chat + embeddings API.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    /// `base_url` without a trailing slash, e.g. "https://api.openai.com".
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, "sending chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "chat API error");
            return Err(LlmError::from_status(status, text));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("response parse failed: {e}")))?;

        Ok(parse_response(api_resp))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "streaming chat API error");
            return Err(LlmError::from_status(status, text));
        }

        process_stream(resp, req.model.clone(), tx, cancel).await
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text_len = text.len();
        let body = serde_json::json!({ "model": model, "input": text });

        let resp = self
            .client
            .post(self.embeddings_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::transient(model, text_len, e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(if status == 429 || status >= 500 {
                EmbeddingError::transient(model, text_len, format!("API error {status}: {message}"))
            } else {
                EmbeddingError::permanent(model, text_len, format!("API error {status}: {message}"))
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::permanent(model, text_len, e.to_string()))?;

        let embedding: Vec<f32> = json["data"]
            .as_array()
            .and_then(|data| data.first())
            .and_then(|first| first["embedding"].as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| {
                EmbeddingError::permanent(model, text_len, "malformed embedding response")
            })?;

        if embedding.is_empty() {
            return Err(EmbeddingError::permanent(model, text_len, "empty embedding"));
        }
        Ok(embedding)
    }
}

fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];
    for m in &req.messages {
        messages.push(serde_json::json!({
            "role": m.role,
            "content": m.content,
        }));
    }

    serde_json::json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "stream": stream,
    })
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();
    let stop_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    ChatResponse {
        content,
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0),
        stop_reason,
    }
}

/// Parse the SSE byte stream and emit StreamEvents. `data: [DONE]` ends the
/// stream; cancellation closes the connection by dropping the response.
async fn process_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), LlmError> {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            c = byte_stream.next() => match c {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                    return Err(LlmError::Transient(e.to_string()));
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                // Dropping byte_stream closes the connection.
                return Err(LlmError::Cancelled);
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    break;
                }

                if let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) {
                    if let Some(usage) = &chunk_resp.usage {
                        tokens_in = usage.prompt_tokens;
                        tokens_out = usage.completion_tokens;
                    }

                    for choice in &chunk_resp.choices {
                        if let Some(reason) = &choice.finish_reason {
                            if !reason.is_empty() {
                                stop_reason = reason.clone();
                            }
                        }
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty()
                                && tx
                                    .send(StreamEvent::TextDelta {
                                        text: content.clone(),
                                    })
                                    .await
                                    .is_err()
                            {
                                // Receiver dropped; stop producing.
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
    Ok(())
}

// OpenAI-compatible API response types

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, Role};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: "You are a test.".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hello".to_string(),
            }],
            temperature: 0.7,
            max_tokens: 64,
            stream: false,
        }
    }

    #[test]
    fn body_prepends_system_message() {
        let body = build_request_body(&request(), false);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(body["temperature"], 0.7);
    }

    #[test]
    fn body_carries_stream_flag() {
        let body = build_request_body(&request(), true);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn parse_response_reads_usage_and_content() {
        let api: ApiResponse = serde_json::from_value(serde_json::json!({
            "model": "test-model",
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3},
        }))
        .expect("deserialize");
        let resp = parse_response(api);
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.tokens_in, 10);
        assert_eq!(resp.tokens_out, 3);
        assert_eq!(resp.stop_reason, "stop");
    }
}

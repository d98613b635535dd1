//! Streaming client for a llama.cpp-compatible completion server

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::debug;

/// Longest accepted line of the event stream
const MAX_LINE: usize = 1024 * 1024;

/// Inference errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Unexpected line in completion stream: {0}")]
    UnexpectedLine(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Stream error: {0}")]
    Lines(#[from] LinesCodecError),
}

/// Completion tokens as they arrive
pub type TokenStream = BoxStream<'static, Result<String, InferenceError>>;

/// A text completion backend
#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<TokenStream, InferenceError>;
}

/// One chat turn as posted to `/api/completions`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    pub role: String,
}

/// Flatten chat turns into an instruction prompt. User turns are wrapped in
/// `[INST]` markers; every other role is passed through as is.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        if message.role == "user" {
            prompt.push_str("[INST]");
            prompt.push_str(&message.content);
            prompt.push_str("[/INST]");
        } else {
            prompt.push_str(&message.content);
        }
    }
    prompt
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionToken {
    #[serde(default)]
    content: String,
}

/// Decode one line of the server-sent event stream.
///
/// Blank lines and the `[DONE]` sentinel carry no token.
pub fn decode_event_line(line: &str) -> Result<Option<String>, InferenceError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let data = line
        .strip_prefix("data: ")
        .ok_or_else(|| InferenceError::UnexpectedLine(line.to_string()))?;
    if data.trim() == "[DONE]" {
        return Ok(None);
    }
    let token: CompletionToken = serde_json::from_str(data)?;
    Ok(Some(token.content))
}

/// [`Inference`] over HTTP
pub struct LlamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl LlamaClient {
    pub fn new(base_url: &str, model: impl Into<String>, connect_timeout: Duration) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Inference for LlamaClient {
    async fn complete(&self, prompt: &str) -> Result<TokenStream, InferenceError> {
        let response = self
            .http
            .post(&self.url)
            .json(&CompletionRequest {
                prompt,
                model: &self.model,
                stream: true,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceError::Status {
                url: self.url.clone(),
                status: response.status(),
            });
        }
        debug!("Streaming completion from {}", self.url);

        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let lines = FramedRead::new(body, LinesCodec::new_with_max_length(MAX_LINE));
        let tokens = lines
            .map_err(InferenceError::from)
            .try_filter_map(|line| async move { decode_event_line(&line) });
        Ok(tokens.boxed())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::stream;

    /// Replays fixed answers, one per call, then repeats the last
    pub(crate) struct ScriptedInference {
        pub answers: parking_lot::Mutex<Vec<String>>,
        pub prompts: parking_lot::Mutex<Vec<String>>,
    }

    impl ScriptedInference {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: parking_lot::Mutex::new(answers.iter().rev().map(|a| a.to_string()).collect()),
                prompts: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Inference for ScriptedInference {
        async fn complete(&self, prompt: &str) -> Result<TokenStream, InferenceError> {
            self.prompts.lock().push(prompt.to_string());
            let answer = {
                let mut answers = self.answers.lock();
                if answers.len() > 1 {
                    answers.pop().unwrap_or_default()
                } else {
                    answers.last().cloned().unwrap_or_default()
                }
            };
            // split so callers see more than one token
            let tokens: Vec<Result<String, InferenceError>> = answer
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(stream::iter(tokens).boxed())
        }
    }

    #[test]
    fn test_render_prompt() {
        let messages = vec![
            ChatMessage {
                content: "is eth0 up?".into(),
                role: "user".into(),
            },
            ChatMessage {
                content: "yes".into(),
                role: "assistant".into(),
            },
        ];
        assert_eq!(render_prompt(&messages), "[INST]is eth0 up?[/INST]yes");
        assert_eq!(render_prompt(&[]), "");
    }

    #[test]
    fn test_decode_event_line() {
        assert_eq!(
            decode_event_line(r#"data: {"content":"HEAL","stop":false}"#).unwrap(),
            Some("HEAL".into())
        );
        assert_eq!(decode_event_line("").unwrap(), None);
        assert_eq!(decode_event_line("data: [DONE]").unwrap(), None);
        assert!(matches!(
            decode_event_line("event: ping"),
            Err(InferenceError::UnexpectedLine(_))
        ));
        assert!(decode_event_line("data: {").is_err());
    }

    #[tokio::test]
    async fn test_llama_client_streams_tokens() {
        async fn completions(Json(request): Json<serde_json::Value>) -> String {
            assert_eq!(request["stream"], true);
            assert_eq!(request["model"], "mixtral.gguf");
            "data: {\"content\":\"HEALTHY\"}\n\ndata: {\"content\":\" all good\",\"stop\":true}\n\n".to_string()
        }

        let app = Router::new().route("/completions", post(completions));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client =
            LlamaClient::new(&format!("http://{}/", addr), "mixtral.gguf", Duration::from_secs(5)).unwrap();
        let tokens: Vec<String> = client
            .complete("[INST]hi[/INST]")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, vec!["HEALTHY".to_string(), " all good".to_string()]);
    }

    #[tokio::test]
    async fn test_llama_client_bad_status() {
        let app = Router::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client =
            LlamaClient::new(&format!("http://{}", addr), "mixtral.gguf", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.complete("x").await,
            Err(InferenceError::Status { .. })
        ));
    }
}

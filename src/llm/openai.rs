//! OpenAI-compatible streaming client.
//!
//! Speaks the `/chat/completions` SSE wire with `stream: true` against
//! any base URL that implements it. Each `data:` line carries a JSON
//! chunk with a content delta; `data: [DONE]` is the end marker. SSE
//! keep-alive comments and field lines other than `data:` are tolerated,
//! which is as much mid-stream recovery as this collaborator attempts;
//! a malformed payload fails the turn.

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;

use crate::llm::{CancelToken, LlmClient, StreamError, TokenStream};
use crate::prompt::ComposedPrompt;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            // No overall timeout: a response stream is open-ended.
            .timeout(None::<Duration>)
            .build()
            .unwrap_or_default();
        OpenAiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Build a client from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    ///
    /// A missing key is tolerated at startup so the UI still comes up;
    /// the first turn then fails visibly instead.
    pub fn from_env(model: &str) -> Self {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
            warn!("OPENAI_API_KEY is not set; requests will be rejected");
            String::new()
        });
        OpenAiClient::new(&base_url, &api_key, model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, prompt: &ComposedPrompt) -> serde_json::Value {
        let mut messages = Vec::new();
        if !prompt.system.is_empty() {
            messages.push(json!({ "role": "system", "content": prompt.system }));
        }
        messages.push(json!({ "role": "user", "content": prompt.user }));
        json!({
            "model": self.model,
            "stream": true,
            "messages": messages,
        })
    }
}

impl LlmClient for OpenAiClient {
    fn open_stream(
        &self,
        prompt: &ComposedPrompt,
        cancel: CancelToken,
    ) -> Result<Box<dyn TokenStream>, StreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("opening response stream against {url}");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(StreamError::RateLimited);
        }
        if !status.is_success() {
            return Err(StreamError::Unavailable(format!(
                "{url} answered {status}"
            )));
        }

        Ok(Box::new(SseStream {
            reader: BufReader::new(Box::new(response)),
            cancel,
            done: false,
        }))
    }
}

/// One parsed SSE `data:` payload.
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Fragment(String),
    Done,
    /// Role announcements, finish_reason chunks, empty deltas.
    Ignore,
}

fn parse_data_line(data: &str) -> Result<SseEvent, StreamError> {
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    #[derive(Deserialize)]
    struct Chunk {
        #[serde(default)]
        choices: Vec<Choice>,
    }
    #[derive(Deserialize)]
    struct Choice {
        #[serde(default)]
        delta: Delta,
    }
    #[derive(Deserialize, Default)]
    struct Delta {
        content: Option<String>,
    }

    let chunk: Chunk = serde_json::from_str(data)
        .map_err(|e| StreamError::Malformed(format!("bad stream chunk: {e}")))?;
    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
    {
        Some(text) if !text.is_empty() => Ok(SseEvent::Fragment(text)),
        _ => Ok(SseEvent::Ignore),
    }
}

struct SseStream {
    reader: BufReader<Box<dyn Read + Send>>,
    cancel: CancelToken,
    done: bool,
}

impl TokenStream for SseStream {
    fn next_fragment(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                return Ok(None);
            }

            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|e| StreamError::Unavailable(format!("stream read failed: {e}")))?;
            if n == 0 {
                self.done = true;
                return Err(StreamError::Malformed(
                    "stream ended without end marker".to_string(),
                ));
            }

            let line = line.trim();
            // Keep-alives, comments and non-data fields carry no payload.
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            match parse_data_line(data.trim())? {
                SseEvent::Fragment(text) => return Ok(Some(text)),
                SseEvent::Done => {
                    self.done = true;
                    return Ok(None);
                }
                SseEvent::Ignore => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_done_marker() {
        assert_eq!(parse_data_line("[DONE]").unwrap(), SseEvent::Done);
    }

    #[test]
    fn test_parse_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(
            parse_data_line(data).unwrap(),
            SseEvent::Fragment("Hel".to_string())
        );
    }

    #[test]
    fn test_parse_role_chunk_ignored() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_data_line(data).unwrap(), SseEvent::Ignore);
    }

    #[test]
    fn test_parse_finish_chunk_ignored() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_data_line(data).unwrap(), SseEvent::Ignore);
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        assert!(matches!(
            parse_data_line("{not json"),
            Err(StreamError::Malformed(_))
        ));
    }

    #[test]
    fn test_sse_stream_over_buffered_bytes() {
        let wire = concat!(
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
            "\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n",
        );
        let mut stream = SseStream {
            reader: BufReader::new(Box::new(wire.as_bytes())),
            cancel: CancelToken::new(),
            done: false,
        };

        assert_eq!(stream.next_fragment().unwrap(), Some("Hel".to_string()));
        assert_eq!(stream.next_fragment().unwrap(), Some("lo".to_string()));
        assert_eq!(stream.next_fragment().unwrap(), None);
        // The end state is sticky.
        assert_eq!(stream.next_fragment().unwrap(), None);
    }

    #[test]
    fn test_sse_stream_eof_without_done_is_malformed() {
        let wire = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n";
        let mut stream = SseStream {
            reader: BufReader::new(Box::new(wire.as_bytes())),
            cancel: CancelToken::new(),
            done: false,
        };

        assert_eq!(stream.next_fragment().unwrap(), Some("hi".to_string()));
        assert!(matches!(
            stream.next_fragment(),
            Err(StreamError::Malformed(_))
        ));
    }

    #[test]
    fn test_cancelled_stream_reports_end() {
        let cancel = CancelToken::new();
        let mut stream = SseStream {
            reader: BufReader::new(Box::new(&b"data: [DONE]\n"[..])),
            cancel: cancel.clone(),
            done: false,
        };

        cancel.cancel();
        assert_eq!(stream.next_fragment().unwrap(), None);
    }

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiClient::new("http://localhost:9999/v1/", "key", "test-model");
        let prompt = ComposedPrompt {
            system: "be brief".to_string(),
            user: "hello".to_string(),
        };
        let body = client.request_body(&prompt);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn test_request_body_without_system_block() {
        let client = OpenAiClient::new("http://localhost:9999/v1", "key", "m");
        let prompt = ComposedPrompt {
            system: String::new(),
            user: "hi".to_string(),
        };
        let body = client.request_body(&prompt);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}

use super::*;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Ollama provider implementation (chat API)
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider with the given base URL and model
    pub fn new(base_url: String, model: String) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }

    fn build_request(&self, request: &GenerateRequest, stream: bool) -> OllamaChatRequest {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
            });
        }
        messages.extend(request.history.iter().map(|turn| OllamaMessage {
            role: match turn.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            }
            .to_string(),
            content: turn.content.clone(),
        }));

        let options = (request.max_tokens.is_some() || request.temperature.is_some()).then(|| {
            OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            }
        });

        OllamaChatRequest {
            model: request
                .model_override
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            messages,
            stream,
            options,
        }
    }

    async fn send(&self, body: &OllamaChatRequest, timeout: Duration) -> LlmResult<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        let response = tokio::time::timeout(timeout, self.client.post(&url).json(body).send())
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::ApiError(format!(
                "Ollama API returned status: {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

/// Models pulled into a local Ollama instance (`GET /api/tags`)
pub async fn list_local_models(base_url: &str) -> LlmResult<Vec<String>> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| LlmError::ApiError(e.to_string()))?;
    if !response.status().is_success() {
        return Err(LlmError::ApiError(format!(
            "Ollama API returned status: {}",
            response.status()
        )));
    }
    let tags: OllamaTags = response
        .json()
        .await
        .map_err(|e| LlmError::ParseError(e.to_string()))?;
    Ok(tags.models.into_iter().map(|m| m.name).collect())
}

/// Split an NDJSON byte stream into text chunks
fn ndjson_chunks<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buf: Vec<u8>,
        eof: bool,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        eof: false,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let item = match serde_json::from_str::<OllamaChatChunk>(line) {
                    Ok(chunk) if chunk.error.is_some() => {
                        state.done = true;
                        Err(LlmError::ApiError(chunk.error.unwrap_or_default()))
                    }
                    Ok(chunk) => {
                        state.done = chunk.done;
                        let text = chunk.message.map(|m| m.content).unwrap_or_default();
                        if text.is_empty() {
                            continue;
                        }
                        Ok(text)
                    }
                    Err(e) => {
                        state.done = true;
                        Err(LlmError::ParseError(e.to_string()))
                    }
                };
                return Some((item, state));
            }
            if state.eof {
                if state.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return None;
                }
                // Trailing line without a newline
                state.buf.push(b'\n');
                continue;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(LlmError::ApiError(e.to_string())), state));
                }
                None => state.eof = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse> {
        let start = Instant::now();
        let body = self.build_request(&request, false);
        let response = self.send(&body, request.timeout).await?;

        let chunk: OllamaChatChunk = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        if let Some(error) = chunk.error {
            return Err(LlmError::ApiError(error));
        }
        let text = chunk
            .message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::ParseError("No message in response".to_string()))?;

        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(GenerateResponse {
            text: text.trim().to_string(),
            metadata: ResponseMetadata {
                provider: "ollama".to_string(),
                model: body.model,
                tokens_used: chunk.eval_count,
                latency_ms,
            },
        })
    }

    async fn stream(&self, request: GenerateRequest) -> LlmResult<TextStream> {
        let body = self.build_request(&request, true);
        let response = self.send(&body, request.timeout).await?;
        tracing::debug!("Ollama stream opened for {}", body.model);
        Ok(ndjson_chunks(response.bytes_stream()))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

use crate::core::config::{Config, LlmConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    /// One request/response round trip. `json_mode` asks the provider for a
    /// structured-output response where the API supports it.
    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String>;
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "deepseek" => {
            let api_key = resolve_api_key(config, "DEEPSEEK_API_KEY")?;
            let base_url = config.base_url.as_deref().unwrap_or("https://api.deepseek.com/v1");
            Ok(Box::new(OpenAiCompatClient::new(&api_key, config, base_url)?))
        }
        "openai" => {
            let api_key = resolve_api_key(config, "OPENAI_API_KEY")?;
            let base_url = config.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
            Ok(Box::new(OpenAiCompatClient::new(&api_key, config, base_url)?))
        }
        "ollama" => {
            let base_url = config.base_url.as_deref().unwrap_or("http://127.0.0.1:11434");
            Ok(Box::new(OllamaClient::new(base_url, config)?))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    }
}

/// Credential resolution order: explicit config value, then a referenced key
/// file (format by extension), then the environment. Nothing resolving is a
/// construction failure that aborts the run.
fn resolve_api_key(config: &LlmConfig, env_var: &str) -> Result<String> {
    if let Some(key) = config.api_key.as_deref() {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    if let Some(path) = config.api_key_file.as_deref() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read api key file: {}", path))?;
        let key = if path.ends_with(".json") {
            let parsed: KeyFile = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse api key file: {}", path))?;
            parsed.api_key
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            let parsed: KeyFile = serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Failed to parse api key file: {}", path))?;
            parsed.api_key
        } else {
            content.trim().to_string()
        };
        if key.is_empty() {
            anyhow::bail!("Api key file {} holds an empty key", path);
        }
        return Ok(key);
    }

    if let Ok(key) = std::env::var(env_var) {
        if !key.is_empty() {
            return Ok(key);
        }
    }

    Err(anyhow!(
        "No API key found. Set llm.api_key, llm.api_key_file, or the {} environment variable.",
        env_var
    ))
}

#[derive(Deserialize)]
struct KeyFile {
    api_key: String,
}

/// Retry-wrapped handle the engines talk to. All suspension in the pipeline
/// happens inside `query`.
#[derive(Debug)]
pub struct Llm {
    client: Box<dyn LlmClient>,
    retry_count: usize,
    retry_delay: Duration,
}

impl Llm {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = create_llm(&config.llm)?;
        Ok(Self {
            client,
            retry_count: config.llm.retry_count.max(1),
            retry_delay: Duration::from_secs(config.llm.retry_delay_seconds),
        })
    }

    /// Wrap an existing transport; used by tests and by callers that build
    /// their own client.
    pub fn with_client(client: Box<dyn LlmClient>, retry_count: usize, retry_delay: Duration) -> Self {
        Self {
            client,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    /// Issue one request with bounded retries and exponential backoff. In
    /// json mode the response is checked for parseability and repaired once
    /// (fenced block, then outermost brace span); a response that still does
    /// not parse is returned as-is and fails at the caller's parse.
    pub async fn query(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let mut delay = self.retry_delay;
        for attempt in 1..=self.retry_count {
            match self.client.chat(system, user, json_mode).await {
                Ok(content) => {
                    if json_mode && serde_json::from_str::<serde_json::Value>(&content).is_err() {
                        warn!("Response is not valid JSON, attempting repair");
                        if let Some(repaired) = repair_json(&content) {
                            return Ok(repaired);
                        }
                        warn!("Could not repair JSON response, returning raw text");
                    }
                    return Ok(content);
                }
                Err(e) => {
                    warn!("LLM request failed (attempt {}/{}): {}", attempt, self.retry_count, e);
                    if attempt == self.retry_count {
                        return Err(e).with_context(|| {
                            format!("LLM request failed after {} attempts", self.retry_count)
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(anyhow!("LLM request failed after {} attempts", self.retry_count))
    }
}

/// Remove a markdown code fence wrapping the whole response, if any.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Pull a parseable JSON document out of a chatty response: a fenced block
/// first, then the outermost brace-delimited span.
pub fn repair_json(text: &str) -> Option<String> {
    let stripped = strip_code_blocks(text);
    if serde_json::from_str::<serde_json::Value>(&stripped).is_ok() {
        return Some(stripped);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let span = &text[start..=end];
    if serde_json::from_str::<serde_json::Value>(span).is_ok() {
        debug!("Recovered JSON from brace span");
        return Some(span.to_string());
    }
    None
}

// --- DeepSeek / OpenAI (chat-completions compatible) ---

#[derive(Debug)]
struct OpenAiCompatClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    fn new(api_key: &str, config: &LlmConfig, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_key: api_key.to_string(),
            model: config.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user.to_string() },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: json_mode.then(|| ResponseFormat { kind: "json_object".to_string() }),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("API error {}: {}", status, error_text));
        }

        let result: ChatResponse = resp.json().await?;
        if let Some(choice) = result.choices.first() {
            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
        }

        Err(anyhow!("Response empty or missing content"))
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user.to_string() },
            ],
            stream: false,
            format: json_mode.then(|| "json".to_string()),
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_repair_json_fenced_block() {
        let raw = "```json\n{\"characters\": []}\n```";
        assert_eq!(repair_json(raw).as_deref(), Some("{\"characters\": []}"));
    }

    #[test]
    fn test_repair_json_brace_span() {
        let raw = "好的，这是结果：{\"a\": 1} 希望对你有帮助";
        assert_eq!(repair_json(raw).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_repair_json_hopeless_input() {
        assert_eq!(repair_json("no json here at all"), None);
        assert_eq!(repair_json("{ not valid"), None);
    }

    #[test]
    fn test_chat_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "{\"characters\": []}"
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
        }"#;

        let result: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("{\"characters\": []}")
        );
    }

    #[test]
    fn test_chat_response_parsing_missing_content() {
        let json = r#"{"choices": [{"index": 0, "message": {"role": "assistant"}}]}"#;
        let result: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(result.choices[0].message.content.is_none());
    }

    #[test]
    fn test_ollama_response_parsing() {
        let json = r#"{"model": "llama3", "message": {"role": "assistant", "content": "hi"}}"#;
        let result: OllamaResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.message.content, "hi");
    }

    #[derive(Debug)]
    struct FlakyClient {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn chat(&self, _system: &str, _user: &str, _json_mode: bool) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(anyhow!("transient failure"))
            } else {
                Ok("{\"ok\": true}".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_query_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Llm::with_client(
            Box::new(FlakyClient { calls: calls.clone(), fail_first: 2 }),
            3,
            Duration::from_millis(0),
        );

        let out = llm.query("sys", "user", true).await.unwrap();
        assert_eq!(out, "{\"ok\": true}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_query_fails_after_retries_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Llm::with_client(
            Box::new(FlakyClient { calls: calls.clone(), fail_first: 10 }),
            2,
            Duration::from_millis(0),
        );

        assert!(llm.query("sys", "user", false).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_repairs_fenced_json() {
        #[derive(Debug)]
        struct FencedClient;

        #[async_trait]
        impl LlmClient for FencedClient {
            async fn chat(&self, _: &str, _: &str, _: bool) -> Result<String> {
                Ok("```json\n{\"a\": 1}\n```".to_string())
            }
        }

        let llm = Llm::with_client(Box::new(FencedClient), 1, Duration::from_millis(0));
        let out = llm.query("sys", "user", true).await.unwrap();
        assert_eq!(out, "{\"a\": 1}");
    }
}

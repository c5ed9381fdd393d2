//! Text-generation adapter.
//!
//! Builds the title/description/tags prompt, posts it to an OpenAI-compatible
//! `chat/completions` endpoint, and extracts the JSON object from the reply.

use std::time::Duration;

use async_trait::async_trait;
use enrichflow_shared::{EnrichmentSection, PipelineError, Result, TagSet};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{build_client, send_error, status_error};

/// Upper bound on generated tokens; the reply is a small JSON object.
const MAX_TOKENS: u32 = 500;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Input for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub content_type: String,
    pub description: Option<String>,
    pub tags: TagSet,
    /// A previously generated title, offered as a hint.
    pub title_hint: Option<String>,
}

impl GenerationRequest {
    /// Target description length, by content type.
    pub fn word_count_hint(&self) -> &'static str {
        if self.content_type.eq_ignore_ascii_case("post") {
            "10-15"
        } else {
            "15-20"
        }
    }

    pub fn prompt(&self) -> String {
        let tags = self.tags.to_vec().join(", ");
        let description = self.description.as_deref().unwrap_or("");
        let hint = match &self.title_hint {
            Some(title) => format!("Previous Title: {title}\n"),
            None => String::new(),
        };

        format!(
            "Content Type: {content_type}\n\
             My Draft: {description}\n\
             Current Tags: {tags}\n\
             {hint}\n\
             Help me refine this {content_type}. I need:\n\
             1. An attention-grabbing title (3-6 words). Intriguing, not clickbait.\n\
             2. A punchy description (around {words} words) in a conversational first-person voice.\n\
             3. Exactly 3 specific tags that help this content reach the right audience.\n\n\
             Return as JSON with keys: title, description, tags (array of 3 strings)",
            content_type = self.content_type,
            words = self.word_count_hint(),
        )
    }
}

/// A usable generation result: non-empty title and at least one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    pub title: String,
    pub description: Option<String>,
    pub tags: TagSet,
}

/// Adapter to an external text-generation service.
#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    /// One generation attempt, abandoned after `timeout`.
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedContent>;
}

/// Pull the generated fields out of a model reply.
///
/// The JSON object is taken from the first `{` to the last `}`; `tags` may be
/// a list or a comma-joined string. A reply without a title and tags is an
/// [`PipelineError::IncompleteResponse`], which the caller retries.
pub fn parse_generation(reply: &str) -> Result<GeneratedContent> {
    let (start, end) = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => {
            return Err(PipelineError::IncompleteResponse(
                "no JSON object in reply".into(),
            ));
        }
    };

    let value: serde_json::Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| PipelineError::IncompleteResponse(format!("invalid JSON in reply: {e}")))?;

    let title = value
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let description = value
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from);
    let tags = match value.get("tags") {
        Some(serde_json::Value::Array(items)) => items.iter().filter_map(|t| t.as_str()).collect(),
        Some(serde_json::Value::String(csv)) => TagSet::from_csv(csv),
        _ => TagSet::new(),
    };

    match (title.is_empty(), tags.is_empty()) {
        (false, false) => Ok(GeneratedContent {
            title,
            description,
            tags,
        }),
        (true, true) => Err(PipelineError::IncompleteResponse(
            "reply has neither title nor tags".into(),
        )),
        (true, false) => Err(PipelineError::IncompleteResponse("reply has no title".into())),
        (false, true) => Err(PipelineError::IncompleteResponse("reply has no tags".into())),
    }
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// [`EnrichmentClient`] over an OpenAI-compatible chat completions API.
pub struct OpenRouterClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// `endpoint` is the API base, e.g. `https://openrouter.ai/api/v1`.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_config(section: &EnrichmentSection, api_key: impl Into<String>) -> Result<Self> {
        Self::new(
            &section.endpoint,
            api_key,
            &section.model,
            Duration::from_secs(section.timeout_secs),
        )
    }
}

#[async_trait]
impl EnrichmentClient for OpenRouterClient {
    #[instrument(skip_all, fields(content_type = %request.content_type, model = %self.model))]
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedContent> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt(),
            }],
            max_tokens: MAX_TOKENS,
        };

        debug!("chat completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "enrichflow")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let text = response.text().await.map_err(|e| send_error(e, timeout))?;
        let chat: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| PipelineError::MalformedResponse(format!("chat completion body: {e}")))?;

        let reply = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        parse_generation(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrichflow_shared::FailureClass;

    fn request() -> GenerationRequest {
        GenerationRequest {
            content_type: "post".into(),
            description: Some("I shipped a new pipeline".into()),
            tags: TagSet::from_csv("data,airflow"),
            title_hint: None,
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "gen-1",
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })
    }

    async fn client_for(server: &wiremock::MockServer) -> OpenRouterClient {
        OpenRouterClient::new(server.uri(), "test-key", "test/model", Duration::from_secs(5))
            .expect("build client")
    }

    #[test]
    fn prompt_word_count_depends_on_type() {
        let post = request();
        assert!(post.prompt().contains("around 10-15 words"));
        assert!(post.prompt().contains("Current Tags: airflow, data"));

        let article = GenerationRequest {
            content_type: "article".into(),
            title_hint: Some("Old Title".into()),
            ..request()
        };
        assert!(article.prompt().contains("around 15-20 words"));
        assert!(article.prompt().contains("Previous Title: Old Title"));
    }

    #[test]
    fn parse_extracts_embedded_json() {
        let reply = "Sure! Here you go:\n{\"title\": \"Shipping Smarter\", \"description\": \"d\", \"tags\": [\"etl\", \"airflow\", \"etl\"]}\nEnjoy.";
        let generated = parse_generation(reply).expect("parse");
        assert_eq!(generated.title, "Shipping Smarter");
        assert_eq!(generated.tags.len(), 2);
    }

    #[test]
    fn parse_accepts_comma_joined_tags() {
        let generated =
            parse_generation(r#"{"title":"T","tags":"data-engineering, airflow,etl"}"#)
                .expect("parse");
        assert_eq!(generated.tags, TagSet::from_csv("data-engineering,airflow,etl"));
        assert!(generated.description.is_none());
    }

    #[test]
    fn parse_rejects_incomplete_replies() {
        for reply in [
            "I cannot help with that",
            r#"{"title": "", "tags": []}"#,
            r#"{"title": "Only Title"}"#,
            r#"{"tags": ["a"]}"#,
            "{not json}",
        ] {
            let err = parse_generation(reply).unwrap_err();
            assert!(
                matches!(err, PipelineError::IncompleteResponse(_)),
                "{reply}: {err}"
            );
            assert!(err.is_retriable());
        }
    }

    #[tokio::test]
    async fn generate_against_mock_server() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat/completions"))
            .and(wiremock::matchers::header("authorization", "Bearer test-key"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(completion(
                r#"{"title":"Shipping Smarter","description":"A new pipeline, shipped.","tags":["data-engineering","airflow","etl"]}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let generated = client_for(&server)
            .await
            .generate(&request(), Duration::from_secs(5))
            .await
            .expect("generate");
        assert_eq!(generated.title, "Shipping Smarter");
        assert_eq!(
            generated.tags,
            TagSet::from_csv("data-engineering,airflow,etl")
        );
    }

    #[tokio::test]
    async fn rate_limit_is_retriable_and_bad_request_is_terminal() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(400).set_body_string("bad model"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let first = client
            .generate(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(first, PipelineError::Http { status: 429, .. }));
        assert_eq!(first.failure_class(), FailureClass::Retriable);

        let second = client
            .generate(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(second, PipelineError::Http { status: 400, .. }));
        assert_eq!(second.failure_class(), FailureClass::Terminal);
    }

    #[tokio::test]
    async fn malformed_envelope_is_terminal() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .generate(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedResponse(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(completion(r#"{"title":"T","tags":["a"]}"#))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .generate(&request(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)), "{err}");
    }
}

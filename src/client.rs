use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::age::LengthHint;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::error::StoryError;
use crate::frames::FragmentStream;
use crate::normalize::{normalize, ResponseKind};
use crate::outline::ChapterOutlineEntry;
use crate::prime::{parse_prime_response, PrimeInfo};
use crate::session::{Scene, SessionContext};

pub const SEED_INFO: &str = "seedInfo";
pub const SEED_STORY: &str = "seedStory";
pub const EXPAND_CHAPTER: &str = "expandChapter";
pub const GEN_IMAGE: &str = "genImage";
pub const VOICEFORGE: &str = "voiceforge";
pub const EXPORT_STORY: &str = "exportStory";

pub const STREAM_ACCEPT: &str =
    "application/x-ndjson, text/event-stream;q=0.9, text/plain;q=0.8, */*;q=0.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRequest {
    pub title: String,
    pub premise: String,
    pub prompt: String,
    pub age_range: String,
    pub genre: String,
    pub chapters: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<String>,
    pub style: String,
    pub policy_hint: String,
}

/// Story state the backend needs to write the next chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterContext {
    pub title: String,
    pub premise: String,
    pub toc: String,
    pub prior_html: Vec<String>,
    pub age_range: String,
    pub length_hint: LengthHint,
    pub genre: String,
    pub keypoints: String,
    pub style: String,
    pub chapter_length: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRequest {
    pub context: ChapterContext,
    /// Zero-based position of the chapter in the outline.
    pub chapter_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub influence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_hint: Option<LengthHint>,
}

/// Everything needed to archive a finished story on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPackage {
    pub title: String,
    pub toc: String,
    pub chapters: Vec<ChapterOutlineEntry>,
    pub scenes: Vec<Scene>,
    pub cover_url: Option<String>,
    pub exported_at: chrono::DateTime<chrono::Utc>,
}

/// POSTs JSON to the workflow webhooks under one base URL.
///
/// Every body carries the `sessionId` of the client's [`SessionContext`].
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    base_url: Url,
    user: Option<String>,
    pass: Option<String>,
    blobs: BlobStore,
    session: SessionContext,
}

impl WebhookClient {
    pub fn new(config: &Config, blobs: BlobStore, session: SessionContext) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("build http client: {err}"))?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            blobs,
            session,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn set_session(&mut self, session: SessionContext) {
        self.session = session;
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn endpoint(&self, name: &str) -> Result<Url, StoryError> {
        self.base_url
            .join(name)
            .map_err(|err| StoryError::transport(None, &format!("invalid endpoint {name}: {err}")))
    }

    /// Adds `sessionId` to an object body. Other JSON values are wrapped.
    pub fn with_session(&self, body: Value) -> Value {
        let mut obj = match body {
            Value::Object(obj) => obj,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut obj = serde_json::Map::new();
                obj.insert("payload".to_owned(), other);
                obj
            }
        };
        obj.insert(
            "sessionId".to_owned(),
            Value::String(self.session.id().to_owned()),
        );
        Value::Object(obj)
    }

    async fn send(
        &self,
        name: &str,
        body: &Value,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, StoryError> {
        let url = self.endpoint(name)?;
        let mut request = self.http.post(url).json(&self.with_session(body.clone()));
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        tracing::debug!(endpoint = name, "POST");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(endpoint = name, status = status.as_u16(), "endpoint error");
            return Err(StoryError::transport(Some(status.as_u16()), &text));
        }
        Ok(response)
    }

    /// Response body text; an empty body is an error.
    pub async fn post_text(&self, name: &str, body: &Value) -> Result<String, StoryError> {
        let text = self.send(name, body, None).await?.text().await?;
        if text.is_empty() {
            return Err(StoryError::EmptyResponse);
        }
        Ok(text)
    }

    pub async fn prime(&self, prompt: &str) -> Result<PrimeInfo, StoryError> {
        let body = serde_json::json!({ "prompt": prompt });
        let text = self.post_text(SEED_INFO, &body).await?;
        Ok(parse_prime_response(&text))
    }

    /// Raw outline text; refusal detection and parsing are left to the caller.
    pub async fn seed_story(&self, request: &SeedRequest) -> Result<String, StoryError> {
        let text = self.post_text(SEED_STORY, &to_value(request)?).await?;
        normalize(&text, ResponseKind::Toc).into_result()
    }

    /// One-shot chapter HTML.
    pub async fn expand_chapter(&self, request: &ChapterRequest) -> Result<String, StoryError> {
        let text = self.post_text(EXPAND_CHAPTER, &to_value(request)?).await?;
        normalize(&text, ResponseKind::Html).into_result()
    }

    pub async fn expand_chapter_stream(
        &self,
        request: &ChapterRequest,
    ) -> Result<FragmentStream, StoryError> {
        let response = self
            .send(EXPAND_CHAPTER, &to_value(request)?, Some(STREAM_ACCEPT))
            .await?;
        Ok(FragmentStream::new(response))
    }

    /// Illustration URL, `data:` URI or `blob:` reference.
    pub async fn gen_image(&self, prompt: &str) -> Result<Option<String>, StoryError> {
        self.media(GEN_IMAGE, prompt, ResponseKind::ImageUrl).await
    }

    /// Narration URL, `data:` URI or `blob:` reference.
    pub async fn narrate(&self, text: &str) -> Result<Option<String>, StoryError> {
        self.media(VOICEFORGE, text, ResponseKind::AudioUrl).await
    }

    async fn media(
        &self,
        name: &str,
        prompt: &str,
        kind: ResponseKind,
    ) -> Result<Option<String>, StoryError> {
        let body = serde_json::json!({ "prompt": prompt });
        let response = self.send(name, &body, None).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if let Some(prefix) = kind.binary_media_prefix()
            && content_type.starts_with(prefix)
        {
            let mime = content_type
                .split(';')
                .next()
                .unwrap_or(prefix)
                .trim()
                .to_owned();
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(self.blobs.register(&mime, bytes.to_vec())));
        }

        let text = response.text().await?;
        Ok(normalize(&text, kind).into_option())
    }

    pub async fn export_story(&self, package: &ExportPackage) -> Result<(), StoryError> {
        self.send(EXPORT_STORY, &to_value(package)?, None).await?;
        Ok(())
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, StoryError> {
    serde_json::to_value(value).map_err(|err| StoryError::UnparseableResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> WebhookClient {
        let config = Config::new("http://localhost:5678/webhook").unwrap();
        WebhookClient::new(&config, BlobStore::new(), SessionContext::from_id("sid-1")).unwrap()
    }

    #[test]
    fn endpoints_join_under_base() {
        let client = client();
        assert_eq!(
            client.endpoint(EXPAND_CHAPTER).unwrap().as_str(),
            "http://localhost:5678/webhook/expandChapter"
        );
    }

    #[test]
    fn bodies_carry_session_id() {
        let client = client();
        let body = client.with_session(serde_json::json!({"prompt": "a fox"}));
        assert_eq!(body["prompt"], "a fox");
        assert_eq!(body["sessionId"], "sid-1");
        assert_eq!(client.with_session(Value::Null)["sessionId"], "sid-1");
    }

    #[test]
    fn chapter_request_serializes_camel_case() {
        let request = ChapterRequest {
            context: ChapterContext {
                title: "T".to_owned(),
                premise: "P".to_owned(),
                toc: "1. A".to_owned(),
                prior_html: vec!["<p>x</p>".to_owned()],
                age_range: "6-8".to_owned(),
                length_hint: crate::age::chapter_length_hint("6-8"),
                genre: "fantasy".to_owned(),
                keypoints: String::new(),
                style: "warm".to_owned(),
                chapter_length: "short".to_owned(),
            },
            chapter_index: 0,
            influence: None,
            length_hint: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["chapterIndex"], 0);
        assert_eq!(value["context"]["priorHtml"][0], "<p>x</p>");
        assert_eq!(value["context"]["lengthHint"]["range"][0], 500);
        assert!(value.get("influence").is_none());
    }
}

//! Video input validation and the boundary to the external analysis engine.
use std::time::Duration;

use axum::body::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::VideoType;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;
pub const DEFAULT_VIDEO_TYPES: [&str; 3] = ["video/mp4", "video/quicktime", "video/webm"];

/// Result reported by the analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub reasoning: String,
}

impl Verdict {
    /// Text recorded in the usage log for a successful analysis.
    pub fn summary(&self) -> String {
        format!("{} - {}", self.verdict, self.confidence)
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// A validated video ready for analysis.
#[derive(Debug, Clone)]
pub enum VideoInput {
    Upload(Upload),
    Remote { url: Url },
}

impl VideoInput {
    pub const fn video_type(&self) -> VideoType {
        match self {
            Self::Upload(_) => VideoType::Upload,
            Self::Remote { .. } => VideoType::Remote,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("maximum file size is {max} bytes, received {size}")]
    TooLarge { size: u64, max: u64 },
    #[error("unsupported video type '{0}'")]
    InvalidFileType(String),
    #[error("invalid video URL")]
    InvalidUrl,
    #[error("no video file or link provided")]
    NoInput,
}

impl ValidationError {
    /// Usage-log verdict for the rejected attempt.
    pub const fn audit_verdict(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "BLOCKED: File too large",
            Self::InvalidFileType(_) => "BLOCKED: Invalid file type",
            Self::InvalidUrl => "BLOCKED: Invalid video URL",
            Self::NoInput => "BLOCKED: No input",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputRules {
    pub max_upload_bytes: u64,
    pub allowed_types: Vec<String>,
}

impl Default for InputRules {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_types: DEFAULT_VIDEO_TYPES.iter().map(|kind| (*kind).to_owned()).collect(),
        }
    }
}

/// Raw form fields of an analysis request, before validation.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub upload: Option<Upload>,
    pub video_url: Option<String>,
}

impl Submission {
    fn has_upload(&self) -> bool {
        self.upload
            .as_ref()
            .is_some_and(|upload| !upload.bytes.is_empty())
    }

    fn link(&self) -> Option<&str> {
        self.video_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Kind of video the request claims to carry, for audit records.
    pub fn video_type(&self) -> VideoType {
        if !self.has_upload() && self.link().is_some() {
            VideoType::Remote
        } else {
            VideoType::Upload
        }
    }

    /// A non-empty file wins over a link.
    pub fn validate(self, rules: &InputRules) -> Result<VideoInput, ValidationError> {
        let has_upload = self.has_upload();
        let link = self.link().map(str::to_owned);
        if let Some(upload) = self.upload.filter(|_| has_upload) {
            let size = u64::try_from(upload.bytes.len()).unwrap_or(u64::MAX);
            if size > rules.max_upload_bytes {
                return Err(ValidationError::TooLarge {
                    size,
                    max: rules.max_upload_bytes,
                });
            }
            if !rules
                .allowed_types
                .iter()
                .any(|kind| kind.eq_ignore_ascii_case(&upload.content_type))
            {
                return Err(ValidationError::InvalidFileType(upload.content_type));
            }
            return Ok(VideoInput::Upload(upload));
        }

        let link = link.ok_or(ValidationError::NoInput)?;
        let url = Url::parse(&link).map_err(|_| ValidationError::InvalidUrl)?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ValidationError::InvalidUrl);
        }
        Ok(VideoInput::Remote { url })
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("analysis engine returned status {0}")]
    Status(u16),
    #[error("analysis response contained no verdict")]
    NoVerdict,
    #[error("analysis verdict is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl AnalysisError {
    /// Client-facing detail; never echoes what the engine sent back.
    pub fn public_detail(&self) -> &'static str {
        match self {
            Self::Transport(err) if err.is_timeout() => "analysis timed out",
            Self::Transport(_) | Self::Status(_) => "analysis service unavailable",
            Self::NoVerdict | Self::Malformed(_) => "analysis returned no verdict",
        }
    }
}

/// The external service that inspects gameplay footage.
pub trait AnalysisEngine: Send + Sync {
    fn analyze<'a>(&'a self, input: &'a VideoInput) -> BoxFuture<'a, Result<Verdict, AnalysisError>>;
}

/// Engine reached over HTTP.
///
/// Uploads are posted as raw bytes with their content type; links are posted
/// as `{"videoUrl": ...}`. The first JSON object in the response body is the
/// verdict, so engines may wrap it in prose.
#[derive(Debug, Clone)]
pub struct HttpAnalysisEngine {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpAnalysisEngine {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

impl AnalysisEngine for HttpAnalysisEngine {
    fn analyze<'a>(&'a self, input: &'a VideoInput) -> BoxFuture<'a, Result<Verdict, AnalysisError>> {
        async move {
            let request = match input {
                VideoInput::Upload(upload) => self
                    .client
                    .post(self.endpoint.clone())
                    .header(CONTENT_TYPE, upload.content_type.as_str())
                    .header("x-file-name", upload.file_name.as_str())
                    .body(upload.bytes.clone()),
                VideoInput::Remote { url } => self
                    .client
                    .post(self.endpoint.clone())
                    .json(&serde_json::json!({ "videoUrl": url.as_str() })),
            };
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(AnalysisError::Status(status.as_u16()));
            }
            let text = response.text().await?;
            debug!(chars = text.len(), "received analysis response");
            parse_verdict(&text)
        }
        .boxed()
    }
}

/// Spans from the first `{` to the last `}`.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_verdict(text: &str) -> Result<Verdict, AnalysisError> {
    let object = extract_json_object(text).ok_or(AnalysisError::NoVerdict)?;
    Ok(serde_json::from_str(object)?)
}

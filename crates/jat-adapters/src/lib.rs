//! External collaborator contracts + their shipped implementations.
//!
//! The reconciler core only ever sees the traits defined here: where the
//! emails come from, how drafts are extracted from them, and where the digest
//! goes are all swappable. The shipped implementations are an OpenAI-backed
//! extractor/researcher, a fixture-file mail source, and a report-directory
//! digest sink.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use jat_core::{ApplicationDraft, RawEmail};
use jat_storage::ResearchGenerator;

pub const CRATE_NAME: &str = "jat-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source of candidate notification emails, bounded to a recent window.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch_candidate_emails(&self) -> Result<Vec<RawEmail>, AdapterError>;
}

/// Turns one raw email into a candidate application draft.
#[async_trait]
pub trait RecordExtractor: Send + Sync {
    /// `None` means extraction failed for this email; the caller skips it and
    /// moves on.
    async fn extract_record(&self, email: &RawEmail) -> Option<ApplicationDraft>;
}

/// Rendered digest ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMessage {
    pub subject: String,
    pub html_body: String,
}

/// Delivery endpoint for the run digest. Fire-and-forget: a `false` return is
/// logged by the caller, never retried.
#[async_trait]
pub trait DigestSink: Send + Sync {
    async fn deliver(&self, digest: &DigestMessage) -> bool;
}

/// Extraction prompts cap the email body at this many characters.
const EXTRACTION_BODY_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    content: String,
}

/// Chat-completions client implementing both the extraction and the research
/// generation contracts.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { http, config })
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, AdapterError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
            max_tokens,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("sending chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Message(format!(
                "chat completion returned http {status}"
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .context("decoding chat completion response")?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AdapterError::Message("chat completion had no choices".to_string()))?;
        Ok(content.trim().to_string())
    }
}

/// Strips a surrounding markdown code fence (with or without a language tag)
/// from a model reply.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, then the closing fence.
    let rest = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => rest,
    };
    rest.trim().trim_end_matches("```").trim()
}

/// Parses a model extraction reply into a draft. Tolerates fenced JSON;
/// anything unparseable yields `None`.
pub fn parse_extraction_reply(reply: &str) -> Option<ApplicationDraft> {
    let json = strip_code_fence(reply);
    match serde_json::from_str::<ApplicationDraft>(json) {
        Ok(draft) => Some(draft),
        Err(err) => {
            error!(%err, "failed to parse extraction reply as JSON");
            None
        }
    }
}

fn extraction_prompt(body: &str) -> String {
    let truncated: String = body.chars().take(EXTRACTION_BODY_LIMIT).collect();
    format!(
        "Extract the following details from this job application confirmation email:\n\n\
         - Job Title\n\
         - Company Name\n\
         - Application Status (e.g. Submitted, Viewed, Interview)\n\
         - Date of Application\n\n\
         Return ONLY valid JSON in this format:\n\
         {{\n  \"title\": \"...\",\n  \"company\": \"...\",\n  \"status\": \"...\",\n  \"date\": \"...\"\n}}\n\n\
         Email content:\n\"\"\"\n{truncated}\n\"\"\"\n"
    )
}

fn research_prompt(company: &str) -> String {
    format!(
        "Provide a brief, factual summary of {company} as a company. Include:\n\
         - Core business/industry\n\
         - Company size and founded date (if known)\n\
         - Key products or services\n\
         - Notable company culture aspects\n\n\
         Keep it under 150 words. Be concise and factual.\n"
    )
}

#[async_trait]
impl RecordExtractor for OpenAiClient {
    async fn extract_record(&self, email: &RawEmail) -> Option<ApplicationDraft> {
        let reply = match self
            .chat(
                "You are a helpful assistant that extracts job application details from emails.",
                &extraction_prompt(&email.body),
                0.1,
                None,
            )
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!(subject = %email.subject, %err, "extraction request failed");
                return None;
            }
        };
        let draft = parse_extraction_reply(&reply)?;
        info!(subject = %email.subject, ?draft, "extracted application draft");
        Some(draft)
    }
}

#[async_trait]
impl ResearchGenerator for OpenAiClient {
    async fn generate(&self, company: &str) -> Option<String> {
        match self
            .chat(
                "You are a helpful assistant that provides concise company research for job applicants.",
                &research_prompt(company),
                0.7,
                Some(200),
            )
            .await
        {
            Ok(body) if !body.is_empty() => Some(body),
            Ok(_) => None,
            Err(err) => {
                error!(company, %err, "research generation request failed");
                None
            }
        }
    }
}

/// Mail source backed by a JSON mailbox file (an array of subject/body
/// objects, oldest first). Only the most recent `limit` entries are handed to
/// the pipeline. A missing mailbox file means an empty inbox, not a failure.
#[derive(Debug, Clone)]
pub struct FixtureMailSource {
    path: PathBuf,
    limit: usize,
}

impl FixtureMailSource {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl MailSource for FixtureMailSource {
    async fn fetch_candidate_emails(&self) -> Result<Vec<RawEmail>, AdapterError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "mailbox file not found");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("reading mailbox {}", self.path.display()))
                    .into())
            }
        };
        let mut emails: Vec<RawEmail> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing mailbox {}", self.path.display()))?;
        if emails.len() > self.limit {
            emails.drain(..emails.len() - self.limit);
        }
        info!(count = emails.len(), "fetched candidate emails");
        Ok(emails)
    }
}

/// Writes the rendered digest into a directory instead of mailing it. The
/// delivery contract is the same fire-and-forget boolean an SMTP sink would
/// return.
#[derive(Debug, Clone)]
pub struct FileDigestSink {
    dir: PathBuf,
}

impl FileDigestSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn digest_path(&self) -> PathBuf {
        self.dir.join("digest.html")
    }
}

#[async_trait]
impl DigestSink for FileDigestSink {
    async fn deliver(&self, digest: &DigestMessage) -> bool {
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            error!(dir = %self.dir.display(), %err, "failed to create digest directory");
            return false;
        }
        let path = self.digest_path();
        let content = format!(
            "<!-- subject: {} -->\n{}",
            digest.subject, digest.html_body
        );
        match tokio::fs::write(&path, content).await {
            Ok(()) => {
                info!(path = %path.display(), "digest written");
                true
            }
            Err(err) => {
                error!(path = %path.display(), %err, "failed to write digest");
                false
            }
        }
    }
}

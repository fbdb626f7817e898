//! Core domain model for the job application tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jat-core";

/// One persisted job application row.
///
/// `research` is `None` only for legacy rows written before the research
/// column existed; an application whose research generation failed carries
/// `Some(String::new())` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub title: String,
    pub company: String,
    pub status: String,
    pub date: String,
    pub research: Option<String>,
}

impl ApplicationRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.title, &self.company)
    }
}

/// Case-insensitive `(title, company)` identity used for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub title: String,
    pub company: String,
}

impl RecordKey {
    pub fn new(title: &str, company: &str) -> Self {
        Self {
            title: title.to_lowercase(),
            company: company.to_lowercase(),
        }
    }
}

/// Partially extracted application handed off by the extraction collaborator.
///
/// Fields are optional because extraction may omit any of them; validation of
/// required fields happens at reconcile time, not here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationDraft {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

impl ApplicationDraft {
    pub fn new(title: &str, company: &str, status: &str, date: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            company: Some(company.to_string()),
            status: Some(status.to_string()),
            date: Some(date.to_string()),
        }
    }

    /// Names of the required fields that are absent from this draft.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.title.is_none() {
            missing.push("title");
        }
        if self.company.is_none() {
            missing.push("company");
        }
        if self.status.is_none() {
            missing.push("status");
        }
        if self.date.is_none() {
            missing.push("date");
        }
        missing
    }
}

/// Raw email as handed over by the mail source collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEmail {
    pub subject: String,
    pub body: String,
}

/// One generated employer background note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchNote {
    pub company: String,
    pub body: String,
    pub generated_at: DateTime<Utc>,
}

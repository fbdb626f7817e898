//! Durable persistence for application records and research notes.
//!
//! The record store is a five-column CSV file with a fixed header row; the
//! research cache is one plain-text note file per employer. Both are written
//! by a single process at a time, so the only crash-safety mechanism needed
//! is the atomic temp-file-then-rename used by [`RecordStore::rewrite_all`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use jat_core::{ApplicationRecord, ResearchNote};

pub const CRATE_NAME: &str = "jat-storage";

/// Column order of the record store, also its literal header row.
pub const HEADER_FIELDS: [&str; 5] = ["title", "company", "status", "date", "research"];

const HEADER_ROW: &str = "title,company,status,date,research\n";

/// Returned by [`ResearchCache::get`] for a blank company name instead of
/// consulting the generator.
pub const NO_COMPANY_SENTINEL: &str = "No company name provided";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record {record} has {fields} fields, expected 4 or 5")]
    FieldCount { record: usize, fields: usize },
    #[error("record {record} is malformed: {reason}")]
    Malformed { record: usize, reason: String },
    #[error("unexpected header row {found:?}")]
    Header { found: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// Minimal RFC 4180: fields containing comma, double quote, CR or LF are
// quoted and inner quotes doubled; rows end with LF. The reader accepts CRLF
// terminators and quoted fields spanning lines, so stores written by earlier
// tooling still load.

fn encode_field(field: &str, out: &mut String) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    } else {
        out.push_str(field);
    }
}

fn encode_row(fields: &[&str]) -> String {
    let mut row = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            row.push(',');
        }
        encode_field(field, &mut row);
    }
    row.push('\n');
    row
}

fn record_row(record: &ApplicationRecord) -> String {
    encode_row(&[
        &record.title,
        &record.company,
        &record.status,
        &record.date,
        record.research.as_deref().unwrap_or(""),
    ])
}

/// Splits raw store content into records of raw fields. Any structural
/// problem fails the whole parse; callers never see partial results.
fn parse_rows(input: &str) -> Result<Vec<Vec<String>>, StoreError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut chars = input.chars().peekable();
    let mut in_quotes = false;
    let mut row_started = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                row_started = true;
            }
            '"' => {
                return Err(StoreError::Malformed {
                    record: rows.len(),
                    reason: "quote inside unquoted field".to_string(),
                });
            }
            ',' => {
                fields.push(std::mem::take(&mut field));
                row_started = true;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                // Blank lines are not rows.
                if row_started || !fields.is_empty() {
                    fields.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut fields));
                }
                row_started = false;
            }
            '\n' => {
                if row_started || !fields.is_empty() {
                    fields.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut fields));
                }
                row_started = false;
            }
            _ => {
                field.push(c);
                row_started = true;
            }
        }
    }

    if in_quotes {
        return Err(StoreError::Malformed {
            record: rows.len(),
            reason: "unterminated quoted field".to_string(),
        });
    }
    // Final row without a trailing newline.
    if row_started || !fields.is_empty() {
        fields.push(field);
        rows.push(fields);
    }
    Ok(rows)
}

fn row_to_record(row: Vec<String>, index: usize) -> Result<ApplicationRecord, StoreError> {
    let mut it = row.into_iter();
    match it.len() {
        5 => Ok(ApplicationRecord {
            title: it.next().unwrap_or_default(),
            company: it.next().unwrap_or_default(),
            status: it.next().unwrap_or_default(),
            date: it.next().unwrap_or_default(),
            research: it.next(),
        }),
        // Rows written before the research column existed.
        4 => Ok(ApplicationRecord {
            title: it.next().unwrap_or_default(),
            company: it.next().unwrap_or_default(),
            status: it.next().unwrap_or_default(),
            date: it.next().unwrap_or_default(),
            research: None,
        }),
        n => Err(StoreError::FieldCount {
            record: index,
            fields: n,
        }),
    }
}

/// CSV-backed store of every tracked application.
///
/// Append-only during normal runs; [`RecordStore::rewrite_all`] replaces the
/// whole file atomically and is reserved for deduplication compaction.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the backing file with its header row if absent. Idempotent.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        if fs::try_exists(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?
        {
            return Ok(());
        }
        fs::write(&self.path, HEADER_ROW)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        info!(path = %self.path.display(), "created application store");
        Ok(())
    }

    /// Appends one row. Duplicate detection is the caller's job.
    pub async fn append(&self, record: &ApplicationRecord) -> Result<(), StoreError> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(record_row(record).as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// Reads every record in file order.
    ///
    /// Invalid UTF-8 byte sequences are replaced rather than failing the
    /// read; a structurally malformed row fails the entire call.
    pub async fn list_all(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        let mut rows = parse_rows(&text)?.into_iter();

        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        if header != HEADER_FIELDS {
            return Err(StoreError::Header {
                found: header.join(","),
            });
        }

        rows.enumerate()
            .map(|(i, row)| row_to_record(row, i + 1))
            .collect()
    }

    /// Atomically replaces the whole store with header + `records` in order.
    pub async fn rewrite_all(&self, records: &[ApplicationRecord]) -> Result<(), StoreError> {
        let mut content = String::from(HEADER_ROW);
        for record in records {
            content.push_str(&record_row(record));
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

/// Collaborator that produces an employer background note.
#[async_trait]
pub trait ResearchGenerator: Send + Sync {
    /// Returns `None` when generation fails; the cache persists nothing in
    /// that case and the failure is not retried within the run.
    async fn generate(&self, company: &str) -> Option<String>;
}

/// File-presence-based cache of one note per employer.
///
/// A cached note is never refreshed, regardless of age: staleness is an
/// accepted tradeoff against regeneration cost.
#[derive(Debug, Clone)]
pub struct ResearchCache {
    root: PathBuf,
}

impl ResearchCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Note path for an employer; path separators in the name map to `_`.
    pub fn note_path(&self, company: &str) -> PathBuf {
        let safe: String = company
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{safe}.txt"))
    }

    /// Resolves the note body for `company`, generating and persisting one on
    /// first access.
    ///
    /// Never fails: i/o problems are logged and degrade to an empty body so a
    /// record save can still proceed without research.
    pub async fn get(&self, company: &str, generator: &dyn ResearchGenerator) -> String {
        if company.trim().is_empty() {
            warn!("blank company name, skipping research lookup");
            return NO_COMPANY_SENTINEL.to_string();
        }

        let path = self.note_path(company);
        match fs::read(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                return note_body(&text).trim().to_string();
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(path = %path.display(), %err, "failed to read cached research");
                return String::new();
            }
        }

        match generator.generate(company).await {
            Some(body) => {
                let note = ResearchNote {
                    company: company.to_string(),
                    body: body.clone(),
                    generated_at: Utc::now(),
                };
                if let Err(err) = self.write_note(&note).await {
                    error!(company, %err, "failed to persist research note");
                }
                body
            }
            None => {
                warn!(company, "research generation returned nothing");
                String::new()
            }
        }
    }

    /// Generates notes for every company in `companies` that has none yet.
    /// Returns the number of newly written notes; per-company failures are
    /// logged and skipped.
    pub async fn generate_missing<I, S>(&self, companies: I, generator: &dyn ResearchGenerator) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut generated = 0usize;
        for company in companies {
            let company = company.as_ref();
            if company.trim().is_empty() {
                continue;
            }
            let path = self.note_path(company);
            match fs::try_exists(&path).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    error!(company, %err, "failed to check research cache");
                    continue;
                }
            }
            let Some(body) = generator.generate(company).await else {
                warn!(company, "research generation failed");
                continue;
            };
            let note = ResearchNote {
                company: company.to_string(),
                body,
                generated_at: Utc::now(),
            };
            match self.write_note(&note).await {
                Ok(()) => {
                    info!(company, "generated research note");
                    generated += 1;
                }
                Err(err) => error!(company, %err, "failed to persist research note"),
            }
        }
        generated
    }

    async fn write_note(&self, note: &ResearchNote) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        let path = self.note_path(&note.company);
        let content = format!(
            "Company Research for {}\nDate Generated: {}\n\n{}",
            note.company,
            note.generated_at.format("%Y-%m-%d %H:%M:%S"),
            note.body
        );
        fs::write(&path, content)
            .await
            .map_err(|e| StoreError::io(&path, e))
    }
}

/// Body of a stored note: everything after the first blank line, which
/// terminates the two-line header. Later blank lines belong to the body.
fn note_body(text: &str) -> &str {
    let mut rest = text;
    let mut offset = 0;
    while let Some(idx) = rest.find('\n') {
        let line = &rest[..idx];
        if line.is_empty() || line == "\r" {
            return &text[offset + idx + 1..];
        }
        offset += idx + 1;
        rest = &rest[idx + 1..];
    }
    ""
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn record(title: &str, company: &str, status: &str, date: &str) -> ApplicationRecord {
        ApplicationRecord {
            title: title.to_string(),
            company: company.to_string(),
            status: status.to_string(),
            date: date.to_string(),
            research: Some(String::new()),
        }
    }

    struct CountingGenerator {
        calls: AtomicUsize,
        reply: Option<String>,
    }

    impl CountingGenerator {
        fn some(reply: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: Some(reply.to_string()),
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResearchGenerator for CountingGenerator {
        async fn generate(&self, _company: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    #[test]
    fn quoting_round_trips_awkward_fields() {
        let row = encode_row(&["a,b", "say \"hi\"", "line\nbreak", "plain"]);
        let parsed = parse_rows(&row).expect("parse");
        assert_eq!(parsed, vec![vec!["a,b", "say \"hi\"", "line\nbreak", "plain"]]);
    }

    #[test]
    fn blank_lines_are_not_rows() {
        let parsed = parse_rows("a,b\n\nc,d\n\n").expect("parse");
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn unterminated_quote_is_fatal() {
        let err = parse_rows("title,company\n\"oops,co\n").unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("applications.csv"));
        store.initialize().await.expect("first init");
        store
            .append(&record("Engineer", "Acme", "Submitted", "2024-01-01"))
            .await
            .expect("append");
        store.initialize().await.expect("second init");
        assert_eq!(store.list_all().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn append_then_list_preserves_fields() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("applications.csv"));
        store.initialize().await.expect("init");
        let rec = ApplicationRecord {
            title: "Data Engineer, Platform".to_string(),
            company: "Acme \"Labs\"".to_string(),
            status: "Submitted".to_string(),
            date: "2024-01-01".to_string(),
            research: Some("Line one.\nLine two.".to_string()),
        };
        store.append(&rec).await.expect("append");
        assert_eq!(store.list_all().await.expect("list"), vec![rec]);
    }

    #[tokio::test]
    async fn rewrite_of_listed_records_is_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("applications.csv"));
        store.initialize().await.expect("init");
        store
            .append(&record("Engineer", "Acme, Inc.", "Submitted", "2024-01-01"))
            .await
            .expect("append");
        store
            .append(&record("Analyst", "Globex", "Viewed", "2024-02-01"))
            .await
            .expect("append");

        let before = std::fs::read(store.path()).expect("read before");
        let all = store.list_all().await.expect("list");
        store.rewrite_all(&all).await.expect("rewrite");
        let after = std::fs::read(store.path()).expect("read after");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn malformed_row_fails_whole_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("applications.csv");
        std::fs::write(
            &path,
            "title,company,status,date,research\na,b,c,d,e\nonly,three,fields\n",
        )
        .expect("write");
        let err = RecordStore::new(&path).list_all().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::FieldCount {
                record: 2,
                fields: 3
            }
        ));
    }

    #[tokio::test]
    async fn legacy_four_column_rows_parse_without_research() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("applications.csv");
        std::fs::write(
            &path,
            "title,company,status,date,research\nEngineer,Acme,Submitted,2023-05-01\n",
        )
        .expect("write");
        let all = RecordStore::new(&path).list_all().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].research, None);
    }

    #[tokio::test]
    async fn cache_hit_never_calls_generator() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path());
        std::fs::write(
            cache.note_path("Acme"),
            "Company Research for Acme\nDate Generated: 2024-01-01 09:00:00\n\nAcme builds anvils.\n",
        )
        .expect("write note");

        let generator = CountingGenerator::some("should not be used");
        let body = cache.get("Acme", &generator).await;
        assert_eq!(body, "Acme builds anvils.");
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn cache_hit_keeps_crlf_paragraphs_in_body() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path());
        let generator = CountingGenerator::some("First paragraph.\r\n\r\nSecond paragraph.");

        let body = cache.get("Acme", &generator).await;
        assert_eq!(body, "First paragraph.\r\n\r\nSecond paragraph.");

        // The stored note round-trips intact too.
        let body = cache.get("Acme", &generator).await;
        assert_eq!(body, "First paragraph.\r\n\r\nSecond paragraph.");
        assert_eq!(generator.calls(), 1);
    }

    #[test]
    fn note_body_stops_at_first_blank_line() {
        assert_eq!(note_body("a\nb\n\nbody\n\nmore"), "body\n\nmore");
        assert_eq!(note_body("a\r\nb\r\n\r\nbody"), "body");
        assert_eq!(note_body("no separator"), "");
    }

    #[tokio::test]
    async fn cache_miss_generates_and_persists() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path().join("research"));
        let generator = CountingGenerator::some("Globex makes everything.");

        let body = cache.get("Globex", &generator).await;
        assert_eq!(body, "Globex makes everything.");
        assert_eq!(generator.calls(), 1);
        assert!(cache.note_path("Globex").exists());

        // Second lookup is served from disk.
        let body = cache.get("Globex", &generator).await;
        assert_eq!(body, "Globex makes everything.");
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn failed_generation_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path());
        let generator = CountingGenerator::failing();
        assert_eq!(cache.get("Initech", &generator).await, "");
        assert!(!cache.note_path("Initech").exists());
    }

    #[tokio::test]
    async fn blank_company_returns_sentinel_without_generation() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path());
        let generator = CountingGenerator::some("unused");
        assert_eq!(cache.get("   ", &generator).await, NO_COMPANY_SENTINEL);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn generate_missing_skips_blank_and_cached() {
        let dir = tempdir().expect("tempdir");
        let cache = ResearchCache::new(dir.path());
        let generator = CountingGenerator::some("note body");
        std::fs::write(
            cache.note_path("Cached Co"),
            "Company Research for Cached Co\nDate Generated: 2024-01-01 09:00:00\n\nold\n",
        )
        .expect("write note");

        let count = cache
            .generate_missing(["", "Cached Co", "Fresh Co", "Other/Name"], &generator)
            .await;
        assert_eq!(count, 2);
        assert_eq!(generator.calls(), 2);
        assert!(cache.note_path("Fresh Co").exists());
        assert!(dir.path().join("Other_Name.txt").exists());
    }

    #[test]
    fn note_path_substitutes_separators() {
        let cache = ResearchCache::new("/tmp/research");
        assert_eq!(
            cache.note_path("A/B\\C"),
            PathBuf::from("/tmp/research/A_B_C.txt")
        );
    }
}

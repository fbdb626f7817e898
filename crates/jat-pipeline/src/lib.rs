//! Reconciliation engine and batch-run orchestration.
//!
//! The reconciler is the only component that mutates the record store: it
//! validates extracted drafts, detects duplicates, resolves research through
//! the cache, and compacts the store. Everything around it (mail, extraction,
//! digest delivery) arrives through the collaborator traits in
//! `jat-adapters`, so per-item failures degrade instead of aborting a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use jat_adapters::{DigestMessage, DigestSink, MailSource, OpenAiClient, OpenAiConfig, RecordExtractor};
use jat_core::{ApplicationDraft, ApplicationRecord, RecordKey};
use jat_storage::{RecordStore, ResearchCache, ResearchGenerator, StoreError};

pub const CRATE_NAME: &str = "jat-pipeline";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub mailbox_file: PathBuf,
    pub recent_email_limit: usize,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub run_cron: String,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("JAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            mailbox_file: std::env::var("JAT_MAILBOX_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("mailbox.json")),
            recent_email_limit: std::env::var("JAT_RECENT_EMAIL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            http_timeout_secs: std::env::var("JAT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("JAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            run_cron: std::env::var("JAT_RUN_CRON").unwrap_or_else(|_| "0 0 9 * * *".to_string()),
            data_dir,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("job_applications.csv")
    }

    pub fn research_dir(&self) -> PathBuf {
        self.data_dir.join("company_research")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("draft is missing required fields: {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("company name is blank")]
    BlankCompany,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful `save_record` call. A duplicate is deliberately an
/// `Ok` value: re-saving an already-tracked application is a no-op success,
/// not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(ApplicationRecord),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    pub before: usize,
    pub after: usize,
    pub invalid_dropped: usize,
}

impl DedupSummary {
    pub fn duplicates_merged(&self) -> usize {
        self.before
            .saturating_sub(self.invalid_dropped)
            .saturating_sub(self.after)
    }
}

/// Merge/dedup engine binding the record store and the research cache.
///
/// Borrows both for the duration of a run and keeps no state between calls;
/// every duplicate decision re-reads the store.
pub struct Reconciler<'a> {
    store: &'a RecordStore,
    cache: &'a ResearchCache,
    research: &'a dyn ResearchGenerator,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a RecordStore,
        cache: &'a ResearchCache,
        research: &'a dyn ResearchGenerator,
    ) -> Self {
        Self {
            store,
            cache,
            research,
        }
    }

    /// Linear scan for an existing record with the same case-insensitive
    /// `(title, company)` pair. The store is mailbox-bounded, so no index.
    pub async fn is_duplicate(&self, title: &str, company: &str) -> Result<bool, StoreError> {
        let key = RecordKey::new(title, company);
        let existing = self.store.list_all().await?;
        Ok(existing.iter().any(|record| record.key() == key))
    }

    /// Validates a draft and appends it unless it is already tracked.
    ///
    /// The append is the only mutation and happens last, so a failure at any
    /// earlier step leaves the store untouched.
    pub async fn save_record(
        &self,
        draft: &ApplicationDraft,
    ) -> Result<SaveOutcome, ReconcileError> {
        let missing = draft.missing_fields();
        if !missing.is_empty() {
            return Err(ReconcileError::MissingFields(missing));
        }

        let title = draft.title.as_deref().unwrap_or_default();
        let company = draft.company.as_deref().unwrap_or_default();
        if company.trim().is_empty() {
            return Err(ReconcileError::BlankCompany);
        }

        if self.is_duplicate(title, company).await? {
            info!(title, company, "skipping duplicate application");
            return Ok(SaveOutcome::Duplicate);
        }

        let research = self.cache.get(company, self.research).await;
        let record = ApplicationRecord {
            title: title.to_string(),
            company: company.to_string(),
            status: draft.status.clone().unwrap_or_default(),
            date: draft.date.clone().unwrap_or_default(),
            research: Some(research),
        };
        self.store.append(&record).await?;
        info!(title, company, "saved application");
        Ok(SaveOutcome::Inserted(record))
    }

    /// Compacts the store to one record per `(title, company)` key.
    ///
    /// Blank-company rows are dropped. On a key collision the later record's
    /// values win while the earlier record's position is kept, so the
    /// most-recently-appended status survives in original store order.
    /// The store is rewritten once, at the end; a failure before that point
    /// leaves it byte-identical.
    pub async fn deduplicate_store(&self) -> Result<DedupSummary, ReconcileError> {
        let records = self.store.list_all().await?;
        let before = records.len();
        if records.is_empty() {
            info!("no applications found, nothing to deduplicate");
            return Ok(DedupSummary::default());
        }

        let mut survivors: Vec<ApplicationRecord> = Vec::new();
        let mut index: HashMap<RecordKey, usize> = HashMap::new();
        let mut invalid_dropped = 0usize;
        for record in records {
            if record.company.trim().is_empty() {
                warn!(title = %record.title, "dropping entry with blank company name");
                invalid_dropped += 1;
                continue;
            }
            match index.get(&record.key()) {
                Some(&slot) => survivors[slot] = record,
                None => {
                    index.insert(record.key(), survivors.len());
                    survivors.push(record);
                }
            }
        }

        // Legacy rows predate the research column; fill them in now.
        for record in &mut survivors {
            if record.research.is_none() {
                record.research = Some(self.cache.get(&record.company, self.research).await);
            }
        }

        self.store.rewrite_all(&survivors).await?;
        let summary = DedupSummary {
            before,
            after: survivors.len(),
            invalid_dropped,
        };
        info!(
            before = summary.before,
            after = summary.after,
            invalid = summary.invalid_dropped,
            "deduplication complete"
        );
        Ok(summary)
    }

    /// Ensures a research note exists for every employer in the store.
    /// Returns the number of newly generated notes.
    pub async fn generate_research_for_all_companies(&self) -> Result<usize, ReconcileError> {
        let records = self.store.list_all().await?;
        let companies: BTreeSet<String> =
            records.into_iter().map(|record| record.company).collect();
        info!(count = companies.len(), "checking research for unique companies");
        Ok(self.cache.generate_missing(&companies, self.research).await)
    }
}

const DATE_SENTINELS: [&str; 4] = ["not provided", "not specified", "not available", "n/a"];

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
];

/// Whether a free-text application date refers to today.
pub fn is_today(date_str: &str) -> bool {
    date_matches(date_str, Local::now().date_naive())
}

/// Dates are stored as whatever text the extractor produced, so matching
/// tries the known formats first and falls back to substring checks.
pub fn date_matches(date_str: &str, day: NaiveDate) -> bool {
    let date_str = date_str.trim();
    if date_str.is_empty() || DATE_SENTINELS.contains(&date_str.to_lowercase().as_str()) {
        return false;
    }

    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(date_str, format) {
            return parsed == day;
        }
    }

    let iso = day.format("%Y-%m-%d").to_string();
    let text = day.format("%B %d, %Y").to_string();
    if date_str.contains(&iso) || date_str.contains(&text) {
        return true;
    }

    let year = day.format("%Y").to_string();
    let month_name = day.format("%B").to_string();
    let month_day = format!("{} {}", month_name, day.format("%d"));
    if date_str.contains(&month_day) && date_str.contains(&year) {
        return true;
    }

    let month_num = day.format("%m").to_string();
    let day_num = day.format("%d").to_string();
    date_str.contains(&year)
        && (date_str.contains(&month_num) || date_str.contains(&month_name))
        && date_str.contains(&day_num)
}

/// Renders the daily digest as a self-contained HTML document.
pub fn render_digest(applications: &[ApplicationRecord], day: NaiveDate) -> DigestMessage {
    let subject = format!("Job Application Tracker - {}", day.format("%Y-%m-%d"));
    if applications.is_empty() {
        return DigestMessage {
            subject,
            html_body: "No new job applications tracked today.".to_string(),
        };
    }

    let mut html = format!(
        "<h2>Job Applications Summary for {}</h2>",
        day.format("%B %d, %Y")
    );
    html.push_str("<div style='font-family: Arial, sans-serif; padding: 15px;'>");
    html.push_str("<table style='width: 100%; border-collapse: collapse; margin-bottom: 20px;'>");
    html.push_str("<tr style='background-color: #f2f2f2;'>");
    for heading in ["Job Title", "Company", "Status", "Application Date"] {
        html.push_str(&format!(
            "<th style='padding: 10px; text-align: left; border: 1px solid #ddd;'>{heading}</th>"
        ));
    }
    html.push_str("</tr>");
    for app in applications {
        html.push_str("<tr style='border: 1px solid #ddd;'>");
        for cell in [&app.title, &app.company, &app.status, &app.date] {
            html.push_str(&format!(
                "<td style='padding: 10px; border: 1px solid #ddd;'>{cell}</td>"
            ));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");

    let companies: BTreeSet<&str> = applications.iter().map(|a| a.company.as_str()).collect();
    html.push_str(
        "<div style='background-color: #f9f9f9; padding: 15px; border-radius: 5px; margin-bottom: 20px;'>",
    );
    html.push_str("<h3>Daily Statistics</h3>");
    html.push_str(&format!(
        "<p>Total applications submitted today: <strong>{}</strong></p>",
        applications.len()
    ));
    html.push_str(&format!(
        "<p>Companies applied to: <strong>{}</strong></p>",
        companies.len()
    ));
    html.push_str("</div>");

    html.push_str("<h3>Company Research Highlights</h3>");
    html.push_str("<div style='margin-bottom: 20px;'>");
    for app in applications {
        let research = app.research.as_deref().unwrap_or("").trim();
        if research.len() > 10 {
            html.push_str(
                "<div style='background-color: #f0f7ff; padding: 15px; border-radius: 5px; margin-bottom: 10px;'>",
            );
            html.push_str(&format!("<h4>{}</h4>", app.company));
            html.push_str(&format!("<p>{}</p>", research.replace('\n', "<br>")));
            html.push_str("</div>");
        }
    }
    html.push_str("</div>");

    html.push_str("<div style='padding: 15px; border-left: 4px solid #4CAF50; margin-top: 20px;'>");
    html.push_str(
        "<p><i>Consistency is key in the job search process. Keep up the good work!</i></p>",
    );
    html.push_str("</div>");
    html.push_str("</div>");

    DigestMessage {
        subject,
        html_body: html,
    }
}

/// Appends one run's summary block to the append-only audit log.
pub async fn append_run_summary(
    logs_dir: &std::path::Path,
    saved: &[ApplicationRecord],
) -> Result<()> {
    fs::create_dir_all(logs_dir)
        .await
        .with_context(|| format!("creating {}", logs_dir.display()))?;

    let mut entry = format!(
        "\n{rule}\nJob Application Summary - {stamp}\n{rule}\n\n",
        rule = "=".repeat(80),
        stamp = Local::now().format("%Y-%m-%d %H:%M:%S"),
    );
    if saved.is_empty() {
        entry.push_str("No new job applications were processed.\n");
    } else {
        entry.push_str(&format!(
            "Found {} new job applications:\n\n",
            saved.len()
        ));
        for (i, app) in saved.iter().enumerate() {
            entry.push_str(&format!("Application {}:\n", i + 1));
            entry.push_str(&format!("  Position: {}\n", app.title));
            entry.push_str(&format!("  Company: {}\n", app.company));
            entry.push_str(&format!("  Status: {}\n", app.status));
            entry.push_str(&format!("  Date: {}\n", app.date));
            entry.push_str(&format!("{}\n", "-".repeat(50)));
        }
    }

    let path = logs_dir.join("run_summary.log");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, entry.as_bytes())
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_emails: usize,
    pub extracted_drafts: usize,
    pub saved_records: usize,
    pub duplicates_skipped: usize,
    pub invalid_drafts: usize,
    pub companies_researched: usize,
    pub dedup: DedupSummary,
    pub digest_delivered: bool,
}

/// One full batch run: compact the store, top up research, pull emails,
/// reconcile each, then deliver the digest and append the audit entry.
pub struct TrackerPipeline {
    config: TrackerConfig,
    store: RecordStore,
    cache: ResearchCache,
    mail: Box<dyn MailSource>,
    extractor: Box<dyn RecordExtractor>,
    research: Box<dyn ResearchGenerator>,
    sink: Box<dyn DigestSink>,
}

impl TrackerPipeline {
    /// Wires the shipped collaborators: OpenAI for extraction and research,
    /// the fixture mailbox file, and a date-stamped report directory sink.
    pub fn from_config(config: TrackerConfig) -> Result<Self> {
        let client = OpenAiClient::new(OpenAiConfig {
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            base_url: config.openai_base_url.clone(),
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
        })?;
        let mail = Box::new(jat_adapters::FixtureMailSource::new(
            config.mailbox_file.clone(),
            config.recent_email_limit,
        ));
        let sink = Box::new(jat_adapters::FileDigestSink::new(
            config
                .reports_dir()
                .join(Local::now().format("%Y-%m-%d").to_string()),
        ));
        Ok(Self::with_collaborators(
            config,
            mail,
            Box::new(client.clone()),
            Box::new(client),
            sink,
        ))
    }

    pub fn with_collaborators(
        config: TrackerConfig,
        mail: Box<dyn MailSource>,
        extractor: Box<dyn RecordExtractor>,
        research: Box<dyn ResearchGenerator>,
        sink: Box<dyn DigestSink>,
    ) -> Self {
        let store = RecordStore::new(config.store_path());
        let cache = ResearchCache::new(config.research_dir());
        Self {
            config,
            store,
            cache,
            mail,
            extractor,
            research,
            sink,
        }
    }

    /// Runs the whole batch once. Only a store that cannot even be
    /// initialized is fatal; every later stage degrades and the run
    /// continues.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting tracker run");

        self.store
            .initialize()
            .await
            .context("initializing record store")?;
        let reconciler = Reconciler::new(&self.store, &self.cache, self.research.as_ref());

        let dedup = match reconciler.deduplicate_store().await {
            Ok(summary) => summary,
            Err(err) => {
                error!(%err, "deduplication failed, continuing with store as-is");
                DedupSummary::default()
            }
        };

        let companies_researched = match reconciler.generate_research_for_all_companies().await {
            Ok(count) => count,
            Err(err) => {
                error!(%err, "batch research generation failed");
                0
            }
        };

        let emails = match self.mail.fetch_candidate_emails().await {
            Ok(emails) => emails,
            Err(err) => {
                error!(%err, "failed to fetch candidate emails");
                Vec::new()
            }
        };

        let mut saved: Vec<ApplicationRecord> = Vec::new();
        let mut extracted_drafts = 0usize;
        let mut duplicates_skipped = 0usize;
        let mut invalid_drafts = 0usize;
        for (i, email) in emails.iter().enumerate() {
            info!(n = i + 1, total = emails.len(), subject = %email.subject, "processing email");
            let Some(draft) = self.extractor.extract_record(email).await else {
                warn!(subject = %email.subject, "extraction failed, skipping email");
                continue;
            };
            extracted_drafts += 1;
            match reconciler.save_record(&draft).await {
                Ok(SaveOutcome::Inserted(record)) => saved.push(record),
                Ok(SaveOutcome::Duplicate) => duplicates_skipped += 1,
                Err(err @ (ReconcileError::MissingFields(_) | ReconcileError::BlankCompany)) => {
                    warn!(%err, "rejected invalid draft");
                    invalid_drafts += 1;
                }
                Err(err) => error!(%err, "failed to save application"),
            }
        }

        let mut digest_delivered = false;
        if !saved.is_empty() {
            let today = Local::now().date_naive();
            let todays: Vec<ApplicationRecord> = match self.store.list_all().await {
                Ok(all) => all
                    .into_iter()
                    .filter(|record| date_matches(&record.date, today))
                    .collect(),
                Err(err) => {
                    error!(%err, "failed to load store for digest window");
                    Vec::new()
                }
            };
            // Prefer today's window; fall back to what this run inserted.
            let to_summarize = if todays.is_empty() { &saved } else { &todays };
            let digest = render_digest(to_summarize, today);
            digest_delivered = self.sink.deliver(&digest).await;
            if !digest_delivered {
                warn!("digest delivery failed");
            }
        } else {
            info!("no new applications saved, skipping digest");
        }

        if let Err(err) = append_run_summary(&self.config.logs_dir(), &saved).await {
            error!(%err, "failed to append run summary");
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_emails: emails.len(),
            extracted_drafts,
            saved_records: saved.len(),
            duplicates_skipped,
            invalid_drafts,
            companies_researched,
            dedup,
            digest_delivered,
        };
        if let Err(err) = self.write_run_report(&summary).await {
            error!(%err, "failed to write run report");
        }
        info!(
            fetched = summary.fetched_emails,
            extracted = summary.extracted_drafts,
            saved = summary.saved_records,
            duplicates = summary.duplicates_skipped,
            researched = summary.companies_researched,
            "tracker run complete"
        );
        Ok(summary)
    }

    async fn write_run_report(&self, summary: &RunSummary) -> Result<()> {
        let dir = self
            .config
            .reports_dir()
            .join(Local::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Builds the configured pipeline and runs it once.
pub async fn run_tracker_once_from_env() -> Result<RunSummary> {
    let config = TrackerConfig::from_env();
    let pipeline = TrackerPipeline::from_config(config)?;
    pipeline.run_once().await
}

/// Optional daily schedule around [`run_tracker_once_from_env`].
pub async fn maybe_build_scheduler(config: &TrackerConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.run_cron.as_str(), |_uuid, _l| {
        Box::pin(async move {
            match run_tracker_once_from_env().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    saved = summary.saved_records,
                    "scheduled run complete"
                ),
                Err(err) => error!(%err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.run_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Markdown snapshot of the current store for the `report` CLI command.
pub async fn report_markdown(config: &TrackerConfig) -> Result<String> {
    let store = RecordStore::new(config.store_path());
    store.initialize().await?;
    let records = store.list_all().await?;

    let companies: BTreeSet<&str> = records.iter().map(|r| r.company.as_str()).collect();
    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        *status_counts.entry(record.status.clone()).or_default() += 1;
    }
    let today = Local::now().date_naive();
    let todays: Vec<&ApplicationRecord> = records
        .iter()
        .filter(|record| date_matches(&record.date, today))
        .collect();

    let mut lines = vec![
        "# Job Application Report".to_string(),
        String::new(),
        format!("- Tracked applications: {}", records.len()),
        format!("- Unique companies: {}", companies.len()),
        String::new(),
        "## By Status".to_string(),
    ];
    for (status, count) in &status_counts {
        lines.push(format!("- {status}: {count}"));
    }
    lines.push(String::new());
    lines.push("## Today".to_string());
    if todays.is_empty() {
        lines.push("- none".to_string());
    } else {
        for record in todays {
            lines.push(format!(
                "- {} at {} ({})",
                record.title, record.company, record.status
            ));
        }
    }
    Ok(lines.join("\n"))
}

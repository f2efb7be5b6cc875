//! JobBus CLI - Admin command-line interface for the job bus
//!
//! Enqueue, inspect and cancel jobs, read statistics, triage dead letters and
//! apply database migrations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};
use uuid::Uuid;

use jobbus_core::{
    bus::JobBus,
    config::{Config, DatabaseConfig},
    jobs::{DeadLetterEntry, EnqueueRequest, Job, JobEvent, JobFilter, JobId, JobRun, JobStatus, PgJobStore},
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "jobbus",
    version,
    about = "JobBus - durable job execution bus",
    long_about = "Admin CLI for enqueuing, inspecting and cancelling jobs, triaging dead letters and running migrations.",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "JOBBUS_CONFIG")]
    config: Option<String>,

    /// Database URL, overrides the configuration
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        /// Job type
        job_type: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Issuing system
        #[arg(short, long, default_value = "cli")]
        source: String,

        /// Priority (higher = sooner)
        #[arg(long, default_value = "0")]
        priority: i32,

        /// Maximum retry attempts
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Idempotency key; repeated keys return the existing job
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Show a job with its runs and events
    Get {
        /// Job ID
        job_id: JobId,
    },

    /// List jobs, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<JobStatusFilter>,

        /// Filter by job type
        #[arg(short = 't', long)]
        job_type: Option<String>,

        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Cancel a queued job
    Cancel {
        /// Job ID
        job_id: JobId,
    },

    /// Show bus statistics
    Stats {
        /// Time window (e.g., 1h, 24h, 7d)
        #[arg(short, long, default_value = "24h")]
        period: String,
    },

    /// List dead letters
    DeadLetters {
        /// Include resolved entries
        #[arg(short, long)]
        all: bool,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Mark a dead letter as resolved
    Resolve {
        /// Dead letter ID
        entry_id: Uuid,
    },

    /// Apply pending database migrations
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum JobStatusFilter {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatusFilter> for JobStatus {
    fn from(filter: JobStatusFilter) -> Self {
        match filter {
            JobStatusFilter::Queued => JobStatus::Queued,
            JobStatusFilter::Processing => JobStatus::Processing,
            JobStatusFilter::Completed => JobStatus::Completed,
            JobStatusFilter::Failed => JobStatus::Failed,
            JobStatusFilter::Cancelled => JobStatus::Cancelled,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Display Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Tabled)]
struct JobSummary {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Retries")]
    retries: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            job_type: job.job_type.clone(),
            source: job.source.clone(),
            status: format_status(job.status),
            priority: job.priority,
            retries: format!("{}/{}", job.retry_count, job.max_retries),
            created_at: job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct RunSummary {
    #[tabled(rename = "Run")]
    run_number: u32,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Worker")]
    worker_id: String,
    #[tabled(rename = "Duration (ms)")]
    duration_ms: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&JobRun> for RunSummary {
    fn from(run: &JobRun) -> Self {
        Self {
            run_number: run.run_number,
            status: run.status.to_string(),
            worker_id: run.worker_id.clone(),
            duration_ms: run.duration_ms.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
            error: run.error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct EventSummary {
    #[tabled(rename = "Seq")]
    seq: i64,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "At")]
    created_at: String,
}

impl From<&JobEvent> for EventSummary {
    fn from(event: &JobEvent) -> Self {
        Self {
            seq: event.seq,
            level: event.level.to_string(),
            message: event.message.clone(),
            created_at: event.created_at.format("%H:%M:%S%.3f").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct DeadLetterSummary {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Resolved")]
    resolved: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&DeadLetterEntry> for DeadLetterSummary {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            job_id: entry.job_id.to_string(),
            job_type: entry.job_type.clone(),
            attempts: entry.attempts,
            resolved: if entry.resolved { "yes".green().to_string() } else { "no".yellow().to_string() },
            error: entry.error.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color || matches!(format, OutputFormat::Json) {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    fn print_success(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "success", "message": message }));
            }
            _ => {
                println!("{} {}", "[OK]".green().bold(), message);
            }
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
            }
            _ => {
                eprintln!("{} {}", "[ERROR]".red().bold(), message);
            }
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        if self.is_json() {
            return self.print_json(&items);
        }
        if items.is_empty() {
            println!("{}", "No results found.".dimmed());
            return Ok(());
        }
        let table = Table::new(items)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string();
        println!("{}", table);
        Ok(())
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if !self.is_json() {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }

    fn print_key_value(&self, key: &str, value: &str) {
        if !self.is_json() {
            println!("  {}: {}", key.cyan(), value);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn connect(cli: &Cli) -> Result<PgJobStore> {
    let database = match (&cli.database_url, &cli.config) {
        (Some(url), _) => DatabaseConfig {
            url: url.clone(),
            max_connections: 2,
            min_connections: 1,
            acquire_timeout_secs: 5,
        },
        (None, Some(path)) => Config::from_file(path)?.database,
        (None, None) => Config::load().context("no --database-url and no usable configuration")?.database,
    };
    Ok(PgJobStore::connect(&database).await?)
}

async fn handle_command(cli: Cli, output: &OutputHelper) -> Result<()> {
    let store = connect(&cli).await?;
    if matches!(cli.command, Commands::Migrate) {
        store.migrate().await?;
        output.print_success("Migrations applied");
        return Ok(());
    }
    let bus = JobBus::new(Arc::new(store));

    match cli.command {
        Commands::Enqueue {
            job_type,
            payload,
            source,
            priority,
            max_retries,
            key,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut request = EnqueueRequest::new(source, job_type, payload)
                .with_priority(priority)
                .with_max_retries(max_retries);
            if let Some(key) = key {
                request = request.with_idempotency_key(key);
            }

            let outcome = bus.enqueue(request).await?;
            if output.is_json() {
                output.print_json(&serde_json::json!({
                    "job_id": outcome.job_id(),
                    "duplicate": outcome.is_duplicate(),
                }))?;
            } else if outcome.is_duplicate() {
                output.print_success(&format!("Job already exists: {}", outcome.job_id()));
            } else {
                output.print_success(&format!("Job enqueued: {}", outcome.job_id()));
            }
        }

        Commands::Get { job_id } => {
            let detail = bus.get(job_id).await?;
            if output.is_json() {
                return output.print_json(&detail);
            }

            let job = &detail.job;
            output.print_header(&format!("Job {}", job.id));
            output.print_key_value("Type", &job.job_type);
            output.print_key_value("Source", &job.source);
            output.print_key_value("Status", &format_status(job.status));
            output.print_key_value("Priority", &job.priority.to_string());
            output.print_key_value("Retries", &format!("{}/{}", job.retry_count, job.max_retries));
            output.print_key_value("Scheduled", &job.scheduled_at.to_rfc3339());
            if let Some(worker) = &job.worker_id {
                output.print_key_value("Worker", worker);
            }
            if let Some(error) = &job.error {
                output.print_key_value("Error", &error.red().to_string());
            }
            if let Some(result) = &job.result {
                output.print_key_value("Result", &result.to_string());
            }

            output.print_header("Runs");
            let runs: Vec<RunSummary> = detail.runs.iter().map(RunSummary::from).collect();
            output.print_table(&runs)?;

            output.print_header("Events");
            let events: Vec<EventSummary> = detail.events.iter().map(EventSummary::from).collect();
            output.print_table(&events)?;
        }

        Commands::List {
            status,
            job_type,
            source,
            limit,
        } => {
            let filter = JobFilter {
                source,
                job_type,
                status: status.map(JobStatus::from),
            };
            let jobs = bus.list(&filter, limit).await?;
            if output.is_json() {
                return output.print_json(&jobs);
            }
            let rows: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
            output.print_table(&rows)?;
        }

        Commands::Cancel { job_id } => {
            let job = bus.cancel(job_id).await?;
            if output.is_json() {
                return output.print_json(&job);
            }
            output.print_success(&format!("Job {} cancelled", job.id));
        }

        Commands::Stats { period } => {
            let hours = parse_period_hours(&period)?;
            let stats = bus.stats(hours).await?;
            if output.is_json() {
                return output.print_json(&stats);
            }

            output.print_header(&format!("Statistics (last {}h)", stats.window_hours));
            for status in JobStatus::ALL {
                output.print_key_value(&format_status(status), &stats.counts.get(status).to_string());
            }
            output.print_key_value("Dead letters", &stats.dead_letter_count.to_string());
            output.print_key_value("Avg duration (ms)", &format!("{:.1}", stats.avg_duration_ms));
            output.print_key_value("Success rate", &format!("{:.1}%", stats.success_rate));
        }

        Commands::DeadLetters { all, limit } => {
            let entries = bus.dead_letters(all, limit).await?;
            if output.is_json() {
                return output.print_json(&entries);
            }
            let rows: Vec<DeadLetterSummary> = entries.iter().map(DeadLetterSummary::from).collect();
            output.print_table(&rows)?;
        }

        Commands::Resolve { entry_id } => {
            let entry = bus.resolve_dead_letter(entry_id).await?;
            if output.is_json() {
                return output.print_json(&entry);
            }
            output.print_success(&format!("Dead letter {} resolved (job {})", entry.id, entry.job_id));
        }

        Commands::Migrate => {}
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Formatting Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn format_status(status: JobStatus) -> String {
    let label = status.as_str();
    match status {
        JobStatus::Queued => label.yellow().to_string(),
        JobStatus::Processing => label.blue().bold().to_string(),
        JobStatus::Completed => label.green().to_string(),
        JobStatus::Failed => label.red().to_string(),
        JobStatus::Cancelled => label.dimmed().to_string(),
    }
}

/// `"36h"` or `"7d"` to hours; a bare number is hours.
fn parse_period_hours(period: &str) -> Result<u32> {
    let period = period.trim();
    let (digits, multiplier) = match period.chars().last() {
        Some('h') => (&period[..period.len() - 1], 1),
        Some('d') => (&period[..period.len() - 1], 24),
        _ => (period, 1),
    };
    let value: u32 = digits
        .parse()
        .with_context(|| format!("invalid period '{}'", period))?;
    if value == 0 {
        bail!("period must be positive");
    }
    value
        .checked_mul(multiplier)
        .with_context(|| format!("period '{}' is too long", period))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Create output helper
    let output = OutputHelper::new(cli.format, cli.no_color);

    if let Err(e) = handle_command(cli, &output).await {
        output.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_hours() {
        assert_eq!(parse_period_hours("24h").unwrap(), 24);
        assert_eq!(parse_period_hours("7d").unwrap(), 168);
        assert_eq!(parse_period_hours(" 12 ").unwrap(), 12);
    }

    #[test]
    fn test_parse_period_rejects_bad_input() {
        assert!(parse_period_hours("0h").is_err());
        assert!(parse_period_hours("soon").is_err());
        assert!(parse_period_hours("d").is_err());
    }
}

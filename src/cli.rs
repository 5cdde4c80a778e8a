// Vidsift CLI binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use vidsift_lib::db::schema;
use vidsift_lib::jobs::Phase;
use vidsift_lib::pipeline::events::LogEventSink;
use vidsift_lib::pipeline::triggers::{TriggerConfig, TriggerType};
use vidsift_lib::{Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "vidsift")]
#[command(about = "Vidsift - process a video library and find duplicate scenes", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (defaults to $VIDSIFT_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, config file and database
    Init,

    /// Register video files (or directories of them) and queue their first phases
    Import {
        /// Files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run the pipeline
    Run {
        /// Stop once nothing is queued or running
        #[arg(long)]
        until_idle: bool,
        /// Stop after this many seconds
        #[arg(long)]
        for_secs: Option<u64>,
    },

    /// List items
    Items {
        /// Filter by processing status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "100")]
        limit: i64,
    },

    /// Show queued work and recent job history
    Jobs {
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Dead-letter queue
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// List duplicate groups
    Groups {
        /// unresolved, resolved or dismissed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "100")]
        limit: i64,
    },

    /// Keep one item of a group and trash the rest
    Resolve {
        group: i64,
        best: i64,
        /// Copy tags and actors from trashed members onto the kept item
        #[arg(long)]
        merge_metadata: bool,
    },

    /// Close a group without touching its items
    Dismiss { group: i64 },

    /// Trigger configuration
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Clear a phase and queue it again for an item
    Reprocess { item: i64, phase: String },

    /// Cancel a running job (by job id, see 'vidsift jobs')
    Cancel { job_id: String },

    /// Set a phase's worker count; a running pipeline applies it on its next poll
    Resize { phase: String, workers: usize },

    /// Permanently delete an item
    Delete { item: i64 },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List entries
    List {
        /// pending, retried or abandoned
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Requeue an entry
    Retry { id: i64 },
    /// Give up on an entry
    Abandon { id: i64 },
}

#[derive(Subcommand)]
enum TriggerAction {
    /// Show the trigger for every phase
    List,
    /// Set how a phase is triggered
    Set {
        phase: String,
        /// on_import, after_job, scheduled or manual
        trigger_type: String,
        /// Phase this one runs after (after_job)
        #[arg(long)]
        after: Option<String>,
        /// 5-field cron expression (scheduled)
        #[arg(long)]
        cron: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(config),
        Commands::Import { paths } => cmd_import(open(config)?, paths),
        Commands::Run { until_idle, for_secs } => cmd_run(open(config)?, until_idle, for_secs),
        Commands::Items { status, limit } => cmd_items(open(config)?, status, limit),
        Commands::Jobs { limit } => cmd_jobs(open(config)?, limit),
        Commands::Dlq { action } => cmd_dlq(open(config)?, action),
        Commands::Groups { status, limit } => cmd_groups(open(config)?, status, limit),
        Commands::Resolve { group, best, merge_metadata } => {
            open(config)?.resolve_group(group, best, merge_metadata)?;
            println!("Resolved group {} keeping item {}", group, best);
            Ok(())
        }
        Commands::Dismiss { group } => {
            open(config)?.dismiss_group(group)?;
            println!("Dismissed group {}", group);
            Ok(())
        }
        Commands::Trigger { action } => cmd_trigger(open(config)?, action),
        Commands::Reprocess { item, phase } => {
            let phase = Phase::parse(&phase)?;
            let admission = open(config)?.reprocess(item, phase)?;
            println!("Item {} {}: {:?}", item, phase, admission);
            Ok(())
        }
        Commands::Cancel { job_id } => {
            if open(config)?.cancel_job(&job_id)? {
                println!("Cancel requested for job {}", job_id);
            } else {
                println!("Job {} is not running", job_id);
            }
            Ok(())
        }
        Commands::Resize { phase, workers } => {
            let phase = Phase::parse(&phase)?;
            open(config)?.resize(phase, workers)?;
            println!("{} workers set to {}", phase, workers);
            Ok(())
        }
        Commands::Delete { item } => {
            if open(config)?.delete_item(item)? {
                println!("Deleted item {}", item);
            } else {
                println!("Item {} not found", item);
            }
            Ok(())
        }
    }
}

fn open(config: PipelineConfig) -> Result<Pipeline> {
    Ok(Pipeline::open(config, Arc::new(LogEventSink))?)
}

fn cmd_init(config: PipelineConfig) -> Result<()> {
    config.save()?;
    let pipeline = open(config)?;
    let data_dir = pipeline.config().data_dir.clone();

    println!("Initialized vidsift at {}", data_dir.display());
    println!("  config.json  - Pipeline settings");
    println!("  vidsift.db   - Items, queue, history, groups");
    println!("  index.db     - Fingerprint index");
    Ok(())
}

fn cmd_import(pipeline: Pipeline, paths: Vec<PathBuf>) -> Result<()> {
    let mut created = 0;
    let mut known = 0;
    for path in paths {
        for item in pipeline.import(&path)? {
            if item.created {
                created += 1;
            } else {
                known += 1;
            }
        }
    }
    println!("Imported {} new item(s), {} already known", created, known);
    Ok(())
}

fn cmd_run(mut pipeline: Pipeline, until_idle: bool, for_secs: Option<u64>) -> Result<()> {
    pipeline.start()?;
    let limit = for_secs.map(Duration::from_secs);

    if until_idle {
        let idle = pipeline.run_until_idle(limit.unwrap_or(Duration::MAX))?;
        if !idle {
            println!("Stopped before the queue drained");
        }
    } else {
        match limit {
            Some(d) => std::thread::sleep(d),
            // Runs until the process is killed; expired leases are reclaimed on the next run
            None => loop {
                std::thread::sleep(Duration::from_secs(3_600));
            },
        }
    }

    let drained = pipeline.shutdown();
    if !drained {
        println!("Some jobs were interrupted and will run again next time");
    }
    Ok(())
}

fn cmd_items(pipeline: Pipeline, status: Option<String>, limit: i64) -> Result<()> {
    let items = pipeline.db().with(|conn| schema::list_items(conn, status.as_deref(), limit))?;
    if items.is_empty() {
        println!("No items found. Use 'vidsift import <path>' to add videos.");
        return Ok(());
    }

    println!("{:>5}  {:>10}  {:>9}  {:>9}  {:>4}  {}", "ID", "Status", "Duration", "Res", "Done", "Title");
    println!("{}", "-".repeat(70));
    for item in items {
        let resolution = match (item.width, item.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "-".to_string(),
        };
        let done: String = Phase::ALL
            .iter()
            .map(|p| if item.phase_done(*p) { 'x' } else { '.' })
            .collect();
        let trashed = if item.trashed_at.is_some() { " [trash]" } else { "" };
        println!(
            "{:>5}  {:>10}  {:>9}  {:>9}  {:>4}  {}{}",
            item.id,
            item.processing_status,
            format_duration(item.duration_secs),
            resolution,
            done,
            item.title,
            trashed
        );
    }
    Ok(())
}

fn cmd_jobs(pipeline: Pipeline, limit: i64) -> Result<()> {
    let (queue, history) = pipeline.db().with(|conn| {
        Ok((schema::list_queue(conn, limit)?, schema::list_job_history(conn, None, limit)?))
    })?;

    println!("Queue ({} rows)", queue.len());
    for row in queue {
        let job = row.job_id.as_deref().unwrap_or("-");
        println!(
            "  #{:<5} item {:<6} {:<12} {:<8} attempts {}  not before {}  job {}",
            row.id, row.item_id, row.phase, row.status, row.attempts, row.not_before, job
        );
    }

    println!();
    println!("Recent history");
    for entry in history {
        let error = entry.error_message.as_deref().unwrap_or("");
        println!(
            "  {}  item {:<6} {:<12} {:<10} {}",
            entry.finished_at, entry.item_id, entry.phase, entry.status, error
        );
    }
    Ok(())
}

fn cmd_dlq(pipeline: Pipeline, action: DlqAction) -> Result<()> {
    match action {
        DlqAction::List { status, limit } => {
            let entries = pipeline
                .db()
                .with(|conn| schema::list_dead_letters(conn, status.as_deref(), limit))?;
            if entries.is_empty() {
                println!("Dead-letter queue is empty.");
            }
            for e in entries {
                println!(
                    "  #{:<5} item {:<6} {:<12} {:<9} {} x{}: {}",
                    e.id, e.item_id, e.phase, e.status, e.error_kind, e.attempts, e.error_message
                );
            }
        }
        DlqAction::Retry { id } => {
            let admission = pipeline.retry_dead_letter(id)?;
            println!("Dead letter {} requeued: {:?}", id, admission);
        }
        DlqAction::Abandon { id } => {
            pipeline.abandon_dead_letter(id)?;
            println!("Dead letter {} abandoned", id);
        }
    }
    Ok(())
}

fn cmd_groups(pipeline: Pipeline, status: Option<String>, limit: i64) -> Result<()> {
    let groups = pipeline.list_groups(status.as_deref(), limit)?;
    if groups.is_empty() {
        println!("No duplicate groups.");
        return Ok(());
    }
    for detail in groups {
        let g = &detail.group;
        println!("Group {} [{}] {} scene(s)", g.id, g.status, g.scene_count);
        for m in &detail.members {
            let best = if m.is_best { "*" } else { " " };
            println!("  {} item {:<6} {:<6} confidence {:.2}", best, m.item_id, m.match_type, m.confidence);
        }
    }
    Ok(())
}

fn cmd_trigger(pipeline: Pipeline, action: TriggerAction) -> Result<()> {
    match action {
        TriggerAction::List => {
            for t in pipeline.tracker().triggers()? {
                let detail = match (&t.after_phase, &t.cron_expr) {
                    (Some(after), _) => format!(" after {}", after),
                    (_, Some(cron)) => format!(" '{}'", cron),
                    _ => String::new(),
                };
                println!("  {:<12} {}{}", t.phase, t.trigger_type, detail);
            }
        }
        TriggerAction::Set { phase, trigger_type, after, cron } => {
            let config = TriggerConfig {
                phase: Phase::parse(&phase)?,
                trigger_type: TriggerType::parse(&trigger_type)?,
                after_phase: after.as_deref().map(Phase::parse).transpose()?,
                cron_expr: cron,
            };
            pipeline.tracker().update_trigger(config)?;
            println!("Trigger for {} updated", phase);
        }
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    if secs <= 0.0 {
        return "-".to_string();
    }
    let total = secs.round() as i64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

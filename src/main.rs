//! # ChatMind CLI (`chatmind`)
//!
//! ## Usage
//!
//! ```bash
//! chatmind --config ./config/chatmind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatmind run [STEPS]...` | Run the pipeline (all stages, or the named ones) |
//! | `chatmind status` | Committed state of every stage |
//! | `chatmind stages` | Stage list with dependencies and policies |
//!
//! ## Exit codes
//!
//! `0` success (including "nothing to do"), `1` a stage failed, `2` invalid
//! configuration or arguments, `130` interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use chatmind::config::{self, Config};
use chatmind::error::PipelineError;
use chatmind::layout::DataLayout;
use chatmind::orchestrator::{PipelineReport, RunRequest};
use chatmind::progress::ProgressMode;
use chatmind::stage::{CancelFlag, StageContext};
use chatmind::stages::{self, Services};
use chatmind::status;

const EXIT_STAGE_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// ChatMind: incremental knowledge graph builder for chat exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chatmind.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chatmind",
    about = "ChatMind: incremental knowledge graph builder for chat exports",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chatmind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline.
    ///
    /// Without STEPS every stage runs in declared order. Named steps run in
    /// dependency order whatever order they are given in.
    Run(RunArgs),

    /// Show committed state per stage.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List stages, their dependencies and recompute policies.
    Stages,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Stages to run (default: all).
    steps: Vec<String>,

    /// Reprocess every unit, ignoring what the ledgers record.
    #[arg(long, visible_alias = "force-reprocess")]
    force: bool,

    /// Report what would run without writing anything.
    #[arg(long)]
    check_only: bool,

    /// Delete ledgers, stamps and artifacts of the planned stages first.
    #[arg(long)]
    clear_state: bool,

    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,

    /// Progress output on stderr (default: human when stderr is a terminal).
    #[arg(long, value_enum)]
    progress: Option<ProgressArg>,

    #[arg(long)]
    skip_ingest: bool,
    #[arg(long)]
    skip_chunk: bool,
    #[arg(long)]
    skip_embed: bool,
    #[arg(long)]
    skip_cluster: bool,
    #[arg(long)]
    skip_tag: bool,
    #[arg(long)]
    skip_summarize_chats: bool,
    #[arg(long)]
    skip_summarize_clusters: bool,
    #[arg(long)]
    skip_position: bool,
    #[arg(long)]
    skip_similarity: bool,
    #[arg(long)]
    skip_load: bool,
}

impl RunArgs {
    fn skips(&self) -> Vec<String> {
        [
            (self.skip_ingest, stages::INGEST),
            (self.skip_chunk, stages::CHUNK),
            (self.skip_embed, stages::EMBED),
            (self.skip_cluster, stages::CLUSTER),
            (self.skip_tag, stages::TAG),
            (self.skip_summarize_chats, stages::SUMMARIZE_CHATS),
            (self.skip_summarize_clusters, stages::SUMMARIZE_CLUSTERS),
            (self.skip_position, stages::POSITION),
            (self.skip_similarity, stages::SIMILARITY),
            (self.skip_load, stages::LOAD),
        ]
        .into_iter()
        .filter(|(skip, _)| *skip)
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatmind=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    if let Commands::Stages = cli.command {
        print_stages();
        return ExitCode::SUCCESS;
    }

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Run(args) => run(&cfg, args).await,
        Commands::Status { json } => match status::run_status(&cfg, &stages::stage_specs(), json).await
        {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(EXIT_STAGE_FAILED)
            }
        },
        Commands::Stages => ExitCode::SUCCESS,
    }
}

async fn run(cfg: &Config, args: RunArgs) -> ExitCode {
    let services = match Services::from_config(cfg) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let pipeline = match stages::build_pipeline(cfg, &services) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after the current batch");
                cancel.cancel();
            }
        });
    }

    let progress = args
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let ctx = StageContext::new(DataLayout::new(&cfg.data.dir))
        .with_batch_size(cfg.pipeline.batch_size)
        .with_concurrency(cfg.pipeline.concurrency)
        .with_cancel(cancel)
        .with_progress(Arc::from(progress.reporter()));

    let request = RunRequest {
        skips: args.skips(),
        steps: args.steps,
        force: args.force,
        check_only: args.check_only,
        clear_state: args.clear_state,
    };

    match pipeline.run(&ctx, &request).await {
        Ok(report) => {
            print_report(&report, args.json);
            if report.interrupted {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(failure) => {
            print_report(&failure.report, args.json);
            eprintln!("Error: {}", failure);
            match (&failure.stage, &failure.error) {
                (None, PipelineError::UnknownStage { .. }) => ExitCode::from(EXIT_CONFIG),
                (_, PipelineError::Config(_)) => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::from(EXIT_STAGE_FAILED),
            }
        }
    }
}

fn print_report(report: &PipelineReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Error: could not serialize report: {}", e),
        }
        return;
    }

    let mode = if report.check_only {
        " (check only)"
    } else if report.force {
        " (forced)"
    } else {
        ""
    };
    println!("Pipeline run {}{}", report.run_id, mode);
    for s in &report.stages {
        let mut line = format!(
            "  {:<20} {:<16} processed {:>6}  skipped {:>6}  failed {:>4}  records {:>6}",
            s.stage,
            s.outcome.to_string(),
            if report.check_only { s.pending } else { s.processed },
            s.skipped,
            s.failed,
            s.records_written
        );
        if s.hash_errors > 0 {
            line.push_str(&format!("  hash errors {}", s.hash_errors));
        }
        if s.deduplicated > 0 {
            line.push_str(&format!("  deduplicated {}", s.deduplicated));
        }
        if s.uncommitted_bytes > 0 {
            line.push_str(&format!("  uncommitted {} B", s.uncommitted_bytes));
        }
        for (key, value) in &s.metrics {
            line.push_str(&format!("  {} {}", key.replace('_', " "), value));
        }
        println!("{}", line);
    }
    if report.is_noop() {
        println!("Nothing to do; every stage is up to date.");
    }
    if report.interrupted {
        println!("Interrupted; committed work is kept and the next run resumes.");
    }
    println!("Done in {} ms", report.duration_ms);
}

fn print_stages() {
    println!("{:<20} {:<26} DEPENDS ON", "STAGE", "POLICY");
    for spec in stages::stage_specs() {
        let deps = if spec.depends_on.is_empty() {
            "-".to_string()
        } else {
            spec.depends_on.join(", ")
        };
        println!("{:<20} {:<26} {}", spec.name, spec.policy.to_string(), deps);
    }
}

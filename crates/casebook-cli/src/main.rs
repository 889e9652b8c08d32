mod completion;
mod config;
mod import;

use anyhow::{bail, Context, Result};
use casebook_core::ReconciliationResult;
use casebook_engine::{CaseEngine, DriverState, ScanRequest};
use casebook_storage::CaseStore;
use clap::{Args, Parser, Subcommand};
use completion::ConfiguredCompletion;
use config::{config_path, database_path, load_config, CasebookConfig};
use import::{export_csv, import_csv, ImportMode};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "casebook")]
#[command(
    about = "Curate a case library: convert raw submissions and reconcile results",
    long_about = None
)]
struct Cli {
    /// Config file (default: $CASEBOOK_CONFIG_PATH, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file holding sheets and job state
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    /// Print summaries as JSON instead of status lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and the configured sheets
    Init,
    /// Load a CSV file into a sheet
    Import {
        #[arg(long)]
        sheet: String,
        file: PathBuf,
        /// Append below existing rows instead of replacing the sheet
        #[arg(long)]
        append: bool,
        /// Leading lines to drop when appending
        #[arg(long, default_value_t = 2)]
        skip_rows: usize,
    },
    /// Write a sheet out as CSV
    Export {
        #[arg(long)]
        sheet: String,
        file: PathBuf,
    },
    /// Re-resolve a sheet's header rows and print the field mapping
    Schema {
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Queue a conversion job
    Start(StartArgs),
    /// Process at most one queued row
    Tick,
    /// Tick until the job finishes or stops
    Run {
        #[arg(long)]
        max_ticks: Option<usize>,
    },
    /// Ask the running job to stop at the next tick
    Stop,
    /// Show the queue and the last finished job
    Status,
    /// Patch existing output rows from computed results
    Reconcile {
        /// JSON array of results; default reads the results sheet
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List primary keys that occur on more than one row
    Duplicates {
        #[arg(long)]
        sheet: Option<String>,
    },
}

#[derive(Args)]
#[group(multiple = false)]
struct StartArgs {
    /// Next N undone rows (default from config)
    #[arg(long)]
    next: Option<usize>,
    /// Every undone row
    #[arg(long)]
    all: bool,
    /// Explicit rows, ranges or keys, e.g. "5, 10-12, GI-7"
    #[arg(long)]
    rows: Option<String>,
}

impl StartArgs {
    fn request(&self, default_next: usize) -> ScanRequest {
        if self.all {
            ScanRequest::All
        } else if let Some(spec) = self.rows.as_deref() {
            ScanRequest::explicit(spec)
        } else {
            ScanRequest::NextN(self.next.unwrap_or(default_next))
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if let Ok(level) = env::var("CASEBOOK_LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report<T: Serialize>(json: bool, value: &T, line: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{line}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let path = config_path(cli.config.as_deref());
    let config = load_config(path.as_deref())?;
    let db_path = database_path(&config, cli.db.as_deref());
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = CaseStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    run(cli, config, &store, db_path)
}

fn run(cli: Cli, config: CasebookConfig, store: &CaseStore, db_path: PathBuf) -> Result<()> {
    let service = ConfiguredCompletion::from_config(&config.completion);
    let engine = CaseEngine::new(config.engine, service);
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            let settings = engine.config();
            for sheet in [
                &settings.input_sheet,
                &settings.output_sheet,
                &settings.reconcile.results_sheet,
            ] {
                if store.create_sheet(sheet)? {
                    info!(event = "sheet_created", sheet = %sheet);
                }
            }
            println!(
                "initialized {} (schema v{})",
                db_path.display(),
                store.schema_version()?
            );
        }
        Commands::Import {
            sheet,
            file,
            append,
            skip_rows,
        } => {
            let mode = if append {
                ImportMode::Append { skip_rows }
            } else {
                ImportMode::Replace
            };
            let rows = import_csv(store, &sheet, &file, mode)?;
            println!("imported {rows} row(s) into {sheet}");
        }
        Commands::Export { sheet, file } => {
            let rows = export_csv(store, &sheet, &file)?;
            println!("exported {rows} row(s) from {sheet} to {}", file.display());
        }
        Commands::Schema { sheet } => {
            let sheet = sheet.unwrap_or_else(|| engine.config().output_sheet.clone());
            let snapshot = engine.refresh_schema(store, store, &sheet)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!(
                    "{} v{} ({} fields, fingerprint {})",
                    snapshot.sheet,
                    snapshot.version,
                    snapshot.len(),
                    snapshot.fingerprint
                );
                for field in &snapshot.fields {
                    println!("  {:>4}  {}", field.column, field.logical_name);
                }
                for name in &snapshot.duplicate_names {
                    println!("  duplicate ignored: {name}");
                }
            }
        }
        Commands::Start(args) => {
            let request = args.request(engine.config().next_n);
            if !engine.service().is_configured() {
                bail!("no [completion] command configured; ticks would only record errors");
            }
            let summary = engine.start_job(store, store, &request)?;
            report(json, &summary, &summary.status_line)?;
            if !summary.unresolved.is_empty() && !json {
                println!("unresolved: {}", summary.unresolved.join(", "));
            }
        }
        Commands::Tick => {
            let summary = engine.tick(store, store)?;
            report(json, &summary, &summary.status_line)?;
        }
        Commands::Run { max_ticks } => {
            let mut ticks = 0usize;
            loop {
                let summary = engine.tick(store, store)?;
                if !json {
                    println!("{}", summary.status_line);
                }
                ticks += 1;
                if summary.state != DriverState::Running {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    }
                    break;
                }
                if max_ticks.is_some_and(|limit| ticks >= limit) {
                    info!(event = "run_tick_limit", ticks);
                    break;
                }
            }
        }
        Commands::Stop => {
            if engine.stop_job(store)? {
                println!("stop requested; the job ends at the next tick");
            } else {
                println!("no active job");
            }
        }
        Commands::Status => {
            let status = engine.queue_status(store)?;
            let line = match status.job_id.as_deref() {
                Some(job_id) => format!(
                    "{:?} job {job_id}: {} of {} remaining; {}{}",
                    status.state,
                    status.remaining,
                    status.total_queued,
                    status.counters,
                    if status.stop_requested { " (stop requested)" } else { "" }
                ),
                None => match status.last_finished.as_ref() {
                    Some(finished) => format!("idle; last: {}", finished.status_line()),
                    None => "idle".to_string(),
                },
            };
            report(json, &status, &line)?;
        }
        Commands::Reconcile { file } => {
            let report_value = match file {
                Some(file) => {
                    let raw = fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    let results: Vec<ReconciliationResult> = serde_json::from_str(&raw)
                        .with_context(|| format!("failed to parse {}", file.display()))?;
                    engine.apply_reconciliation(store, store, &results)?
                }
                None => engine.reconcile_from_sheet(store, store)?,
            };
            report(json, &report_value, &report_value.status_line())?;
            if !json && !report_value.not_found_keys.is_empty() {
                println!("not found: {}", report_value.not_found_keys.join(", "));
            }
        }
        Commands::Duplicates { sheet } => {
            let sheet = sheet.unwrap_or_else(|| engine.config().output_sheet.clone());
            let duplicates = engine.duplicate_report(store, store, &sheet)?;
            let line = if duplicates.is_empty() {
                format!("{sheet}: no duplicate keys")
            } else {
                duplicates
                    .iter()
                    .map(|dup| format!("{}: rows {:?}", dup.key, dup.rows))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            report(json, &duplicates, &line)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags_pick_one_selection_mode() {
        let cli = Cli::try_parse_from(["casebook", "start", "--rows", "3-5, GI-7"]).expect("parse");
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(
            args.request(25),
            ScanRequest::Explicit(vec!["3-5".to_string(), "GI-7".to_string()])
        );

        let cli = Cli::try_parse_from(["casebook", "start"]).expect("parse");
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.request(25), ScanRequest::NextN(25));

        assert!(Cli::try_parse_from(["casebook", "start", "--all", "--next", "3"]).is_err());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["casebook", "status", "--json", "--db", "x.db"])
            .expect("parse");
        assert!(cli.json);
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
    }
}

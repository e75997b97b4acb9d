//! Silicon Swarm CLI - file-driven build/verify/fix loop for hardware modules
//!
//! Usage:
//!   swarm init                          Create .swarm/ with a default config
//!   swarm intake <module> -d <text>     Hand a new task to the swarm
//!   swarm put <module> <file> -k <kind> Store an artifact version
//!   swarm harden <module>               Request physical hardening
//!   swarm run [--once]                  Run the dispatcher
//!   swarm status                        Show module states and the halt marker
//!   swarm corrections <module>          Show a module's correction records
//!   swarm resume                        Clear the halt marker
//!   swarm golden pss --module <m>       Store a golden PSS vector

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swarm_core::config::SWARM_DIR;
use swarm_core::{ArtifactKind, ChangeNote, SwarmConfig, ToolStage};
use swarm_orchestrator::{producer, Dispatcher, ModuleState, Registry, TickOutcome};
use swarm_store::{ArtifactStore, LogStore, Markers};
use swarm_tools::{GoldenVector, ToolRunner};

#[derive(Parser)]
#[command(name = "swarm")]
#[command(author, version, about = "File-driven build/verify/fix loop for hardware modules")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding .swarm/
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .swarm/ and write the default configuration
    Init {
        /// Overwrite an existing config.toml
        #[arg(long)]
        force: bool,
    },

    /// Hand a new task (module) to the swarm
    Intake {
        module: String,

        /// Free-text task description for the spec producer
        #[arg(short, long)]
        description: String,

        /// Modules this one instantiates
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<String>,
    },

    /// Store a new artifact version for a module
    Put {
        module: String,

        /// File holding the artifact body
        file: PathBuf,

        /// Artifact kind (spec, source, testbench, report, golden_vector)
        #[arg(short, long)]
        kind: ArtifactKind,

        /// Name to materialise the artifact under (defaults per kind)
        #[arg(long)]
        file_name: Option<String>,

        /// Tag the version as the fix for a correction record
        #[arg(long, value_name = "CORRECTION_ID")]
        fix: Option<String>,

        /// One-line change summary
        #[arg(long, default_value = "")]
        summary: String,

        /// Cost spent producing the artifact
        #[arg(long)]
        cost: Option<f64>,
    },

    /// Request physical hardening for a passed module
    Harden { module: String },

    /// Run the event dispatcher
    Run {
        /// Process what is pending, then exit
        #[arg(long)]
        once: bool,
    },

    /// Show module states and the halt marker
    Status,

    /// Show the correction records of a module
    Corrections {
        module: String,

        /// Only the most recent record
        #[arg(long)]
        last: bool,
    },

    /// Clear the global halt marker after corrective action
    Resume,

    /// Golden vector tools
    Golden {
        #[command(subcommand)]
        action: GoldenCommands,
    },
}

#[derive(Subcommand)]
enum GoldenCommands {
    /// Generate the LTE PSS golden vector
    Pss {
        /// Sector id N_ID_2 (0, 1 or 2)
        #[arg(long, default_value = "0")]
        n_id_2: u8,

        /// Signed sample width in bits
        #[arg(long, default_value = "16")]
        bits: u32,

        /// Store as the module's golden_vector artifact (prints JSON otherwise)
        #[arg(long)]
        module: Option<String>,
    },

    /// Judge captured simulation output against a module's golden vector
    Judge {
        module: String,

        /// File with `SAMPLE <i> <q>` lines
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let repo = cli.repo;
    match cli.command {
        Commands::Init { force } => cmd_init(&repo, force).await,
        Commands::Intake {
            module,
            description,
            depends_on,
        } => cmd_intake(&repo, &module, &description, &depends_on).await,
        Commands::Put {
            module,
            file,
            kind,
            file_name,
            fix,
            summary,
            cost,
        } => {
            let note = change_note(fix, summary, cost);
            cmd_put(&repo, &module, &file, kind, file_name, note).await
        }
        Commands::Harden { module } => cmd_harden(&repo, &module).await,
        Commands::Run { once } => cmd_run(&repo, once).await,
        Commands::Status => cmd_status(&repo).await,
        Commands::Corrections { module, last } => cmd_corrections(&repo, &module, last).await,
        Commands::Resume => cmd_resume(&repo).await,
        Commands::Golden { action } => cmd_golden(&repo, action).await,
    }
}

fn load_config(repo: &Path) -> Result<SwarmConfig> {
    SwarmConfig::load_or_default(repo)
        .with_context(|| format!("Failed to load {}", SwarmConfig::path(repo).display()))
}

async fn open_store(repo: &Path) -> Result<ArtifactStore> {
    ArtifactStore::open(repo)
        .await
        .with_context(|| format!("Failed to open store in {}", repo.display()))
}

fn change_note(fix: Option<String>, summary: String, cost: Option<f64>) -> Option<ChangeNote> {
    let note = match fix {
        Some(correction_id) => ChangeNote::fix(correction_id, summary),
        None if summary.is_empty() && cost.is_none() => return None,
        None => ChangeNote::draft(summary),
    };
    Some(match cost {
        Some(cost) => note.with_cost(cost),
        None => note,
    })
}

async fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    info!("Initializing Silicon Swarm in {}", repo.display());
    let config_path = SwarmConfig::path(repo);
    if config_path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", config_path.display());
    } else {
        SwarmConfig::write_default(repo)?;
    }

    let swarm_dir = repo.join(SWARM_DIR);
    for dir in ["inbox", "markers", "requests", "logs"] {
        tokio::fs::create_dir_all(swarm_dir.join(dir)).await?;
    }
    open_store(repo).await?;

    println!("Initialized Silicon Swarm in {}", repo.display());
    println!("Created:");
    println!("  {}/config.toml", SWARM_DIR);
    println!("  {}/inbox/      drop zone for producers", SWARM_DIR);
    println!("  {}/requests/   hand-off requests to producers", SWARM_DIR);
    println!("\nNext steps:");
    println!("  1. Point [tools.*] in config.toml at your lint/sim/PnR tools");
    println!("  2. swarm intake <module> -d \"<task>\"");
    println!("  3. swarm run");
    Ok(())
}

async fn cmd_intake(
    repo: &Path,
    module: &str,
    description: &str,
    depends_on: &[String],
) -> Result<()> {
    let store = open_store(repo).await?;
    let seq = store.intake(module, description, depends_on).await?;
    println!("Journaled intake of {} (seq {})", module, seq);
    Ok(())
}

async fn cmd_put(
    repo: &Path,
    module: &str,
    file: &Path,
    kind: ArtifactKind,
    file_name: Option<String>,
    note: Option<ChangeNote>,
) -> Result<()> {
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file_name.or_else(|| {
        (kind != ArtifactKind::GoldenVector)
            .then(|| file.file_name().map(|n| n.to_string_lossy().to_string()))
            .flatten()
    });

    let store = open_store(repo).await?;
    match store
        .put(module, kind, &content, file_name.as_deref(), note)
        .await?
    {
        Some(version) => println!(
            "Stored {} {} as {} ({} bytes)",
            module,
            kind,
            &version.id[..12],
            version.size
        ),
        None => println!("{} {} unchanged", module, kind),
    }
    Ok(())
}

async fn cmd_harden(repo: &Path, module: &str) -> Result<()> {
    let config = load_config(repo)?;
    if config.tools.get(ToolStage::Harden).is_none() {
        bail!("No [tools.harden] command configured");
    }
    let store = open_store(repo).await?;
    let seq = store.request_hardening(module).await?;
    println!("Requested hardening of {} (seq {})", module, seq);
    Ok(())
}

async fn cmd_run(repo: &Path, once: bool) -> Result<()> {
    let config = load_config(repo)?;
    let swarm_dir = repo.join(SWARM_DIR);
    let runner = Arc::new(ToolRunner::from_config(&config, LogStore::new(&swarm_dir)));
    let producer = producer::from_config(&swarm_dir, &config.producers);

    let mut dispatcher = Dispatcher::new(repo, config, runner, producer)
        .await
        .context("Failed to start dispatcher")?;

    if once {
        match dispatcher.run_until_idle().await? {
            TickOutcome::Halted(marker) => {
                println!("HALTED by {}: {}", marker.module, marker.reason);
                println!("Run 'swarm resume' after corrective action");
            }
            _ => println!("Idle at journal seq {}", dispatcher.cursor()),
        }
        return Ok(());
    }

    dispatcher
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn cmd_status(repo: &Path) -> Result<()> {
    let store = Arc::new(open_store(repo).await?);
    let registry = Registry::load(store.clone()).await?;
    let markers = Markers::new(store.root());

    println!("Silicon Swarm Status");
    println!("====================");
    match markers.halt().await? {
        Some(marker) => {
            println!("\nHALTED by {}: {}", marker.module, marker.reason);
            println!("  since {}", marker.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => println!("\nPipeline running"),
    }

    let records: Vec<_> = registry.iter().collect();
    println!("\nModules: {}", records.len());
    for record in &records {
        println!(
            "  {:<24} {:<12} attempts {:>2}  failed {:>2}  budget {:.1}/{:.1}{}",
            record.name,
            record.state.to_string(),
            record.attempts.len(),
            record.failed_attempts,
            record.budget.spent,
            record.budget.cap,
            record
                .last_correction
                .as_ref()
                .map(|c| format!("  last {}", c))
                .unwrap_or_default()
        );
    }

    for state in [ModuleState::Passed, ModuleState::Done, ModuleState::Halted] {
        let count = records.iter().filter(|r| r.state == state).count();
        if count > 0 {
            println!("{}: {}", state, count);
        }
    }
    Ok(())
}

async fn cmd_corrections(repo: &Path, module: &str, last: bool) -> Result<()> {
    let store = Arc::new(open_store(repo).await?);
    let registry = Registry::load(store).await?;
    let mut corrections = registry.corrections(module).await?;
    if corrections.is_empty() {
        println!("No correction records for {}", module);
        return Ok(());
    }
    if last {
        corrections = corrections.split_off(corrections.len() - 1);
    }
    for correction in corrections {
        println!("{}", correction.to_markdown());
    }
    Ok(())
}

async fn cmd_resume(repo: &Path) -> Result<()> {
    let markers = Markers::new(&repo.join(SWARM_DIR));
    match markers.clear_halt().await? {
        Some(marker) => {
            println!("Cleared halt raised by {}: {}", marker.module, marker.reason);
            if let Some(signature) = marker.signature {
                println!("  signature {}", signature);
            }
            println!("Module {} stays Halted; other modules resume on the next run", marker.module);
        }
        None => println!("Pipeline is not halted"),
    }
    Ok(())
}

async fn cmd_golden(repo: &Path, action: GoldenCommands) -> Result<()> {
    match action {
        GoldenCommands::Pss {
            n_id_2,
            bits,
            module,
        } => {
            let golden = GoldenVector::pss(n_id_2, bits)?;
            let json = serde_json::to_string_pretty(&golden)?;
            let Some(module) = module else {
                println!("{}", json);
                return Ok(());
            };

            let store = open_store(repo).await?;
            let note = ChangeNote::draft(golden.description.clone());
            match store
                .put(&module, ArtifactKind::GoldenVector, json.as_bytes(), None, Some(note))
                .await?
            {
                Some(version) => println!(
                    "Stored {} for {} as {}",
                    golden.description,
                    module,
                    &version.id[..12]
                ),
                None => println!("{} golden vector unchanged", module),
            }
        }
        GoldenCommands::Judge { module, output } => {
            let config = load_config(repo)?;
            let store = open_store(repo).await?;
            let version = store
                .current(&module, ArtifactKind::GoldenVector)
                .await?
                .with_context(|| format!("{} has no golden vector", module))?;
            let golden = GoldenVector::from_json(&store.read_to_string(&version).await?)?;
            let captured = tokio::fs::read_to_string(&output)
                .await
                .with_context(|| format!("Failed to read {}", output.display()))?;

            let limit = config.golden.evm_limit_pct;
            let verdict = golden.judge(&captured, limit);
            println!(
                "{}: {}",
                if verdict.passed { "PASS" } else { "FAIL" },
                verdict.describe(limit)
            );
            if !verdict.passed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

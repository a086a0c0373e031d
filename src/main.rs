use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use stressrs::{
    config,
    directory::{EmployeeDirectory, EmployeeRecord, FileDirectory},
    identity::{self, AccessPolicy, AdminList, Capability},
    media_store::{FsMediaStore, MediaStore},
    Engine, RunReport,
};

#[derive(Parser)]
#[command(name = "stressrs")]
#[command(version, about = "Video-based stress assessment from recorded sessions")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assess one individual from all of their stored videos
    Run {
        individual: String,
        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Assess several individuals in parallel
    Batch {
        #[arg(required = true)]
        individuals: Vec<String>,
    },
    /// Store a recorded video for an individual
    Upload {
        individual: String,
        file: PathBuf,
    },
    /// Inspect or seed employee records
    Employee {
        #[command(subcommand)]
        command: EmployeeCommands,
    },
    /// Open config file in editor
    Config,
}

#[derive(Subcommand)]
enum EmployeeCommands {
    /// Add or replace an employee record
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        department: String,
        #[arg(long)]
        email: String,
    },
    /// Show one employee record
    Show { id: String },
    /// List all employee records
    List,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let actor = identity::current_user_id()?;
    let policy = access_policy(cli.config.is_some(), &cfg)?;

    match cli.command {
        Commands::Run { individual, json } => {
            policy.authorize(&actor, Capability::RunInference)?;
            run(cfg, &individual, json)
        }
        Commands::Batch { individuals } => {
            policy.authorize(&actor, Capability::RunInference)?;
            batch(cfg, &individuals)
        }
        Commands::Upload { individual, file } => {
            policy.authorize(&actor, Capability::UploadMedia)?;
            upload(&cfg, &individual, &file)
        }
        Commands::Employee { command } => employee(&cfg, &policy, &actor, command),
        Commands::Config => open_config(cli.config),
    }
}

/// Admins always come from the installed config; `--config` may point
/// anywhere the caller can write.
fn access_policy(custom_config: bool, cfg: &config::Config) -> Result<AdminList> {
    if !custom_config {
        return Ok(AdminList::from_config(&cfg.access));
    }
    let installed = config::load_config(None).context("Failed to load installed config")?;
    Ok(AdminList::from_config(&installed.access))
}

fn run(cfg: config::Config, individual: &str, json: bool) -> Result<()> {
    let engine = Engine::from_config(cfg).context("Failed to initialize inference engine")?;
    let report = engine.run_inference(individual)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn batch(cfg: config::Config, individuals: &[String]) -> Result<()> {
    let engine = Engine::from_config(cfg).context("Failed to initialize inference engine")?;

    let mut failures = 0;
    for (id, result) in engine.run_batch(individuals) {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => {
                failures += 1;
                error!("{}: {}", id, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} run(s) failed", failures, individuals.len());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    info!(
        "✓ {}: {} (composite {:.2}%)",
        report.verdict.individual_id, report.verdict.level, report.composite.value
    );
    for video in &report.videos {
        info!(
            "  {} -> {:.2}% stressed over {} face(s)",
            video.video_id, video.stressed_percentage, video.faces
        );
    }
    if report.undecodable() > 0 {
        warn!("  {} video(s) could not be decoded", report.undecodable());
    }
    if report.without_faces() > 0 {
        warn!("  {} video(s) had no detectable faces", report.without_faces());
    }
}

fn upload(cfg: &config::Config, individual: &str, file: &std::path::Path) -> Result<()> {
    let blob = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let store = FsMediaStore::new(&cfg.storage.videos, &cfg.storage.extension);
    let segment = store
        .store(individual, &blob)
        .context("Failed to store video")?;

    info!(
        "✓ Stored {} as video #{} for {}",
        file.display(),
        segment.sequence_index,
        individual
    );
    Ok(())
}

fn employee(
    cfg: &config::Config,
    policy: &dyn AccessPolicy,
    actor: &str,
    command: EmployeeCommands,
) -> Result<()> {
    let directory = FileDirectory::new(&cfg.storage.directory);

    match command {
        EmployeeCommands::Add {
            id,
            name,
            department,
            email,
        } => {
            policy.authorize(actor, Capability::ManageEmployees)?;
            directory.put(EmployeeRecord::new(&id, &name, &department, &email))?;
            info!("✓ Saved employee {}", id);
        }
        EmployeeCommands::Show { id } => {
            let record = directory
                .get(&id)?
                .with_context(|| format!("No employee with id {}", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        EmployeeCommands::List => {
            for record in directory.list()? {
                let level = record
                    .stress_level
                    .map_or_else(|| "-".to_string(), |l| l.to_string());
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id, record.name, record.department, level
                );
            }
        }
    }
    Ok(())
}

fn open_config(path: Option<PathBuf>) -> Result<()> {
    let config_path = path.unwrap_or_else(|| config::CONFIG_PATH.to_path_buf());
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path.as_path()))
            .context("Failed to write default config")?;
    }
    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}

//! msync - offline-first sync for bookkeeping data through encrypted files.

use clap::{Parser, Subcommand};
use msync_device::{Config, DeviceError, SyncNode};
use msync_engine::{
    check_passphrase, generate_passphrase, passphrase::DEFAULT_WORD_COUNT, Conflict, EntityType,
    ExportOptions, ExportScope, Hlc, Resolution,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "msync")]
#[command(version)]
#[command(about = "Offline-first sync through encrypted .msync files", long_about = None)]
struct Cli {
    /// Bundle passphrase (defaults to MSYNC_PASSPHRASE)
    #[arg(long, short, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this device's identity
    Device,

    /// Show pending operations, open conflicts and the last sync
    Status,

    /// Create an entity
    Create {
        entity_type: EntityTypeArg,
        /// Field values as a JSON object
        #[arg(value_parser = parse_json)]
        payload: Value,
        /// Entity id (a new UUID if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Change fields of an entity
    Update {
        entity_type: EntityTypeArg,
        id: String,
        /// Changed fields as a JSON object; null clears a field
        #[arg(value_parser = parse_json)]
        changes: Value,
    },

    /// Delete an entity
    Delete { entity_type: EntityTypeArg, id: String },

    /// Archive an entity
    Archive { entity_type: EntityTypeArg, id: String },

    /// Take an entity out of the archive
    Unarchive { entity_type: EntityTypeArg, id: String },

    /// Mark a transaction as paid
    MarkPaid {
        transaction_id: String,
        /// Payment time (RFC 3339 or YYYY-MM-DD), now if omitted
        #[arg(long)]
        paid_at: Option<String>,
    },

    /// Show one entity, or list all entities of a type
    Show {
        entity_type: EntityTypeArg,
        id: Option<String>,
        /// Include deleted entities
        #[arg(long)]
        deleted: bool,
    },

    /// Write pending operations to an encrypted bundle
    Export {
        /// Directory to write the bundle to
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Include operations received from other devices
        #[arg(long)]
        all: bool,
        /// Only operations after this clock value
        #[arg(long)]
        since: Option<String>,
    },

    /// Show what importing a bundle would do
    Preview { file: PathBuf },

    /// Merge an encrypted bundle
    Import { file: PathBuf },

    /// List conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
    },

    /// Resolve a conflict
    Resolve {
        conflict_id: String,
        /// Pick a candidate by index
        #[arg(long, conflicts_with = "manual", required_unless_present = "manual")]
        candidate: Option<usize>,
        /// Enter a money state by hand, as a JSON object
        #[arg(long, value_parser = parse_json)]
        manual: Option<Value>,
    },

    /// Resolve every open conflict to its newest candidate
    ResolveAll,

    /// Show the money versions of a transaction
    Versions { transaction_id: String },

    /// Show export and import history
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Generate or check bundle passphrases
    #[command(subcommand)]
    Passphrase(PassphraseCommand),
}

#[derive(Subcommand)]
enum PassphraseCommand {
    /// Generate a random word passphrase
    Generate {
        #[arg(long, default_value_t = DEFAULT_WORD_COUNT)]
        words: usize,
    },
    /// Rate a passphrase
    Check {
        #[arg(value_name = "PASSPHRASE")]
        text: String,
    },
}

#[derive(Clone)]
struct EntityTypeArg(EntityType);

impl std::str::FromStr for EntityTypeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(EntityTypeArg).map_err(|e: msync_engine::Error| {
            let all = EntityType::all();
            let known: Vec<&str> = all.iter().map(|t| t.as_str()).collect();
            format!("{e} (expected one of: {})", known.join(", "))
        })
    }
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "msync_device=info,msync_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        if e.is_bad_passphrase() {
            eprintln!("Error: incorrect passphrase");
        } else if e.is_invalid_bundle() {
            eprintln!("Error: not a valid .msync bundle ({e})");
        } else {
            eprintln!("Error: {e}");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DeviceError> {
    let cli = Cli::parse();

    // Passphrase commands need no database.
    if let Commands::Passphrase(cmd) = &cli.command {
        run_passphrase(cmd)?;
        return Ok(());
    }

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let passphrase = cli.passphrase.clone().or_else(|| config.passphrase.clone());
    let node = SyncNode::open(&config).await?;

    match cli.command {
        Commands::Device => {
            let device = node.device().await;
            println!("id:      {}", device.id);
            println!("name:    {}", device.name);
            println!("created: {}", device.created_at);
        }
        Commands::Status => {
            let status = node.status().await?;
            println!("device:         {} ({})", status.device.name, status.device.id);
            println!("pending ops:    {}", status.pending_ops);
            println!("open conflicts: {}", status.open_conflicts);
            println!("total ops:      {}", status.total_ops);
            match status.last_sync {
                Some(entry) => println!("last sync:      {entry}"),
                None => println!("last sync:      never"),
            }
        }
        Commands::Create {
            entity_type,
            payload,
            id,
        } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let op = node.create(entity_type.0, &id, payload).await?;
            println!("created {} {} ({})", op.entity_type, op.entity_id, op.id);
        }
        Commands::Update {
            entity_type,
            id,
            changes,
        } => {
            let ops = node.update(entity_type.0, &id, changes).await?;
            if ops.is_empty() {
                println!("nothing changed");
            }
            for op in ops {
                println!(
                    "updated {} of {} {}",
                    op.field.as_deref().unwrap_or("?"),
                    op.entity_type,
                    op.entity_id
                );
            }
        }
        Commands::Delete { entity_type, id } => {
            node.delete(entity_type.0, &id).await?;
            println!("deleted {id}");
        }
        Commands::Archive { entity_type, id } => {
            node.archive(entity_type.0, &id).await?;
            println!("archived {id}");
        }
        Commands::Unarchive { entity_type, id } => {
            node.unarchive(entity_type.0, &id).await?;
            println!("unarchived {id}");
        }
        Commands::MarkPaid {
            transaction_id,
            paid_at,
        } => {
            node.mark_paid(&transaction_id, paid_at.as_deref()).await?;
            println!("marked {transaction_id} paid");
        }
        Commands::Show {
            entity_type,
            id,
            deleted,
        } => {
            let records = match id {
                Some(id) => node.get(&entity_type.0, &id).await.into_iter().collect(),
                None => node.list(&entity_type.0, deleted).await,
            };
            let json: Vec<Value> = records.iter().map(|r| r.to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Commands::Export { dir, all, since } => {
            let passphrase = require_passphrase(passphrase)?;
            let check = check_passphrase(&passphrase);
            if !check.valid {
                return Err(DeviceError::BadRequest(format!(
                    "passphrase is too weak: {}",
                    check.feedback.join("; ")
                )));
            }
            let since = since.map(|s| s.parse::<Hlc>()).transpose()?;
            let options = ExportOptions {
                since,
                scope: if all {
                    ExportScope::All
                } else {
                    ExportScope::Local
                },
            };
            let exported = node.export_bundle(&dir, &passphrase, &options).await?;
            println!(
                "exported {} operations to {}",
                exported.manifest.op_count,
                exported.path.display()
            );
        }
        Commands::Preview { file } => {
            let passphrase = require_passphrase(passphrase)?;
            let preview = node.preview_bundle(&file, &passphrase).await?;
            println!(
                "from:      {} ({})",
                preview.manifest.created_by_name, preview.manifest.created_by_device_id
            );
            println!("created:   {}", preview.manifest.created_at);
            println!("ops:       {}", preview.manifest.op_count);
            println!("new ops:   {}", preview.new_ops_count);
            if preview.undecodable_count > 0 {
                println!("unreadable: {}", preview.undecodable_count);
            }
            if preview.already_imported {
                println!("already imported");
            }
        }
        Commands::Import { file } => {
            let passphrase = require_passphrase(passphrase)?;
            let summary = node.import_bundle(&file, &passphrase).await?;
            if summary.already_imported {
                println!("bundle {} was already imported", summary.bundle_id);
            } else {
                println!(
                    "applied {} (superseded {}), skipped {}, conflicts {}",
                    summary.applied, summary.superseded, summary.skipped, summary.conflicts
                );
                for skipped in &summary.malformed {
                    println!(
                        "  skipped {}: {}",
                        skipped.op_id.as_deref().unwrap_or("?"),
                        skipped.reason
                    );
                }
            }
        }
        Commands::Conflicts { all } => {
            let conflicts = node.conflicts(all).await;
            if conflicts.is_empty() {
                println!("no conflicts");
            }
            for conflict in &conflicts {
                print_conflict(conflict);
            }
        }
        Commands::Resolve {
            conflict_id,
            candidate,
            manual,
        } => {
            let resolution = match (candidate, manual) {
                (Some(index), _) => Resolution::Candidate(index),
                (None, Some(value)) => Resolution::Manual(value),
                (None, None) => {
                    return Err(DeviceError::BadRequest(
                        "--candidate or --manual is required".into(),
                    ))
                }
            };
            node.resolve_conflict(&conflict_id, resolution).await?;
            println!("resolved {conflict_id}");
        }
        Commands::ResolveAll => {
            let ops = node.resolve_all_conflicts().await?;
            println!("resolved {} conflicts", ops.len());
        }
        Commands::Versions { transaction_id } => {
            let versions = node.money_versions(&transaction_id).await;
            if versions.is_empty() {
                println!("no money versions for {transaction_id}");
            }
            for version in versions {
                println!(
                    "v{} {} {} {} {}{}",
                    version.version,
                    version.hlc,
                    version.device_id,
                    version.snapshot.to_value(),
                    version.op_id,
                    if version.active { "  (active)" } else { "" }
                );
            }
        }
        Commands::History { limit } => {
            for entry in node.history(limit).await? {
                println!("{entry}");
            }
        }
        Commands::Passphrase(_) => {}
    }

    Ok(())
}

fn run_passphrase(cmd: &PassphraseCommand) -> Result<(), DeviceError> {
    match cmd {
        PassphraseCommand::Generate { words } => println!("{}", generate_passphrase(*words)),
        PassphraseCommand::Check { text } => {
            let check = check_passphrase(text);
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
    }
    Ok(())
}

fn require_passphrase(passphrase: Option<String>) -> Result<String, DeviceError> {
    passphrase.ok_or_else(|| {
        DeviceError::BadRequest("a passphrase is required (--passphrase or MSYNC_PASSPHRASE)".into())
    })
}

fn print_conflict(conflict: &Conflict) {
    let field = conflict.field.as_deref().unwrap_or("money");
    println!(
        "{} [{:?}] {} {} {} ({:?})",
        conflict.id,
        conflict.conflict_type,
        conflict.entity_type,
        conflict.entity_id,
        field,
        conflict.status
    );
    for (index, candidate) in conflict.candidates.iter().enumerate() {
        println!(
            "  [{index}] {} from {} at {}",
            candidate.value, candidate.device_id, candidate.hlc
        );
    }
}

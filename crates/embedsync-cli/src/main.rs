//! `embedsync`: run reconciliation and recovery operations against a world file

mod world;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use embedsync_core::{EmbedSync, ReconcileConfig};
use embedsync_model::{ContainerId, ProgressId};
use serde_json::Value;
use std::path::PathBuf;
use world::{World, WorldFile};

fn cli() -> Command {
    Command::new("embedsync")
        .version(embedsync_core::VERSION)
        .about("Embed reference reconciliation and recovery")
        .subcommand_required(true)
        .arg(
            Arg::new("world")
                .long("world")
                .short('w')
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("World file holding the storage dump and container pages"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_parser(value_parser!(PathBuf))
                .help("Reconciliation settings (TOML)"),
        )
        .arg(
            Arg::new("out")
                .long("out")
                .short('o')
                .value_parser(value_parser!(PathBuf))
                .help("Write the resulting world here"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("reconcile")
                .about("Run reconciliation and print the summary")
                .arg(
                    Arg::new("live")
                        .long("live")
                        .action(ArgAction::SetTrue)
                        .help("Apply quarantine and index edits instead of a dry run"),
                )
                .arg(
                    Arg::new("progress-id")
                        .long("progress-id")
                        .default_value("cli")
                        .help("Key of the progress record to write"),
                ),
        )
        .subcommand(
            Command::new("progress")
                .about("Show a progress record")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(
            Command::new("versions")
                .about("List snapshots of a storage key or consumer config")
                .arg(Arg::new("entity").required(true)),
        )
        .subcommand(
            Command::new("restore-version")
                .about("Restore a snapshot to its live key")
                .arg(Arg::new("version-id").required(true)),
        )
        .subcommand(
            Command::new("prune")
                .about("Delete snapshots past retention")
                .arg(
                    Arg::new("days")
                        .long("days")
                        .value_parser(value_parser!(u32))
                        .help("Retention in days; defaults to the configured value"),
                ),
        )
        .subcommand(Command::new("deleted").about("List quarantined instances"))
        .subcommand(
            Command::new("restore-deleted")
                .about("Restore a quarantined instance")
                .arg(Arg::new("consumer-id").required(true)),
        )
        .subcommand(
            Command::new("purge-pages")
                .about("Permanently delete every instance on the given pages")
                .arg(Arg::new("container-id").required(true).num_args(1..)),
        )
        .subcommand(Command::new("backups").about("List backups"))
        .subcommand(
            Command::new("restore-backup")
                .about("Rewrite every config captured by a backup")
                .arg(Arg::new("backup-id").required(true)),
        )
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<ReconcileConfig> {
    let Some(path) = matches.get_one::<PathBuf>("config") else {
        return Ok(ReconcileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    ReconcileConfig::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn arg<'a>(args: &'a ArgMatches, name: &str) -> &'a str {
    args.get_one::<String>(name).map_or("", String::as_str)
}

async fn dispatch(sync: &EmbedSync, matches: &ArgMatches) -> Result<Value> {
    let resolvers = sync.resolvers();
    let output = match matches.subcommand() {
        Some(("reconcile", args)) => {
            let progress_id = ProgressId::from(arg(args, "progress-id"));
            let job = if args.get_flag("live") {
                sync.queue().enqueue(progress_id, false).await?
            } else {
                sync.queue().enqueue_default(progress_id).await?
            };
            serde_json::to_value(job.join().await?)?
        }
        Some(("progress", args)) => {
            let progress = resolvers
                .get_check_progress(&ProgressId::from(arg(args, "id")))
                .await?;
            serde_json::to_value(progress)?
        }
        Some(("versions", args)) => {
            serde_json::to_value(resolvers.get_version_history(arg(args, "entity")).await?)?
        }
        Some(("restore-version", args)) => {
            serde_json::to_value(resolvers.restore_from_version(arg(args, "version-id")).await?)?
        }
        Some(("prune", args)) => {
            let days = args.get_one::<u32>("days").copied();
            serde_json::to_value(resolvers.prune_versions_now(days).await?)?
        }
        Some(("deleted", _)) => serde_json::to_value(resolvers.get_deleted_items().await?)?,
        Some(("restore-deleted", args)) => {
            serde_json::to_value(resolvers.restore_deleted_item(arg(args, "consumer-id")).await?)?
        }
        Some(("purge-pages", args)) => {
            let pages: Vec<ContainerId> = args
                .get_many::<String>("container-id")
                .into_iter()
                .flatten()
                .map(|id| ContainerId::from(id.as_str()))
                .collect();
            serde_json::to_value(resolvers.delete_orphaned_embeds_by_page(&pages).await?)?
        }
        Some(("backups", _)) => serde_json::to_value(resolvers.list_backups().await?)?,
        Some(("restore-backup", args)) => {
            let restored = resolvers.restore_backup(arg(args, "backup-id")).await?;
            serde_json::json!({ "restored": restored })
        }
        _ => anyhow::bail!("no subcommand given"),
    };

    // Restores leave a debounced invalidation behind; settle it before exit.
    let invalidated = resolvers.invalidation().flush().await?;
    if invalidated > 0 {
        tracing::debug!(invalidated, "flushed cache invalidation");
    }
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let config = load_config(&matches)?;
    let world_path = matches
        .get_one::<PathBuf>("world")
        .context("--world is required")?;
    let world = World::open(WorldFile::load(world_path)?, config);

    let output = dispatch(&world.sync, &matches).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if let Some(out) = matches.get_one::<PathBuf>("out") {
        world.dump().save(out)?;
        tracing::info!(path = %out.display(), "world written");
    }
    Ok(())
}

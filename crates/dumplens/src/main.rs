use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dumplens_core::config::{Config, CONFIG_FILE};
use dumplens_core::types::DumpIdentifier;
use dumplens_core::DumpLens;
use dumplens_report::{json, text, OutputFormat};

#[derive(Parser)]
#[command(name = "dumplens")]
#[command(about = "Analyze crash dumps, tag their stacks and cluster similar crashes")]
#[command(version)]
struct Cli {
    /// Config file path (defaults to .dumplens.toml in the current directory or an ancestor)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default .dumplens.toml configuration file
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },
    /// Discover and analyze the dumps of an extracted bundle
    Analyze {
        /// Path to the bundle directory
        path: PathBuf,
        /// Bundle id (defaults to the directory name)
        #[arg(long)]
        bundle_id: Option<String>,
    },
    /// List dumps and their analysis status
    Status {
        /// Show threads and tags of a single dump (bundle:dump)
        #[arg(long)]
        dump: Option<String>,
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
        /// Compact JSON output (single line)
        #[arg(long)]
        compact: bool,
    },
    /// Recompute similarity for one dump or all recent dumps
    Similarity {
        /// Dump to recompute (bundle:dump)
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        dump: Option<String>,
        /// Recompute every analyzed dump of the last `--days` days
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// Include dumps older than the similarity window
        #[arg(long)]
        force: bool,
    },
    /// Rebuild and print the crash clusters
    Clusters {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
        /// Compact JSON output (single line)
        #[arg(long)]
        compact: bool,
    },
    /// Delete every stored similarity relationship
    WipeRelationships,
    /// Keep recomputing clusters in the background until Ctrl-C
    Serve,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = tokio::runtime::Runtime::new()
        .context("failed to start tokio runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(2);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init { force } => cmd_init(force),
        Commands::Analyze { path, bundle_id } => {
            cmd_analyze(config_path, &path, bundle_id.as_deref()).await
        }
        Commands::Status {
            dump,
            format,
            compact,
        } => cmd_status(config_path, dump.as_deref(), &format, compact).await,
        Commands::Similarity {
            dump,
            all,
            days,
            force,
        } => cmd_similarity(config_path, dump.as_deref(), all, days, force).await,
        Commands::Clusters { format, compact } => cmd_clusters(config_path, &format, compact).await,
        Commands::WipeRelationships => cmd_wipe_relationships(config_path).await,
        Commands::Serve => cmd_serve(config_path).await,
    }
}

fn cmd_init(force: bool) -> Result<()> {
    let target = PathBuf::from(CONFIG_FILE);
    if target.exists() && !force {
        anyhow::bail!("{CONFIG_FILE} already exists. Use --force to overwrite.");
    }
    std::fs::write(&target, Config::default_toml())?;
    println!("Created {CONFIG_FILE} with default configuration.");
    Ok(())
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(p) => Config::load(p),
        None => {
            let cwd = std::env::current_dir().context("failed to resolve current directory")?;
            Ok(Config::load_or_default(&cwd))
        }
    }
}

fn open(config_path: Option<&Path>) -> Result<DumpLens> {
    let config = load_config(config_path)?;
    DumpLens::from_config(config)
}

async fn cmd_analyze(config_path: Option<&Path>, path: &Path, bundle_id: Option<&str>) -> Result<()> {
    let lens = open(config_path)?;
    let bundle_id = match bundle_id {
        Some(id) => id.to_string(),
        None => path
            .canonicalize()
            .with_context(|| format!("bundle directory '{}' does not exist", path.display()))?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("cannot derive a bundle id from the path, use --bundle-id")?,
    };

    let ids = lens.analyze_bundle(&bundle_id, path).await?;
    lens.wait_idle().await;
    let stats = lens.scheduler().stats();
    lens.shutdown().await?;

    println!("Analyzed {} dumps in bundle '{bundle_id}'.", ids.len());
    print!("{}", text::format_status(&lens.dumps().get_bundle(&bundle_id)));
    print!("{}", text::format_queue_stats(&stats));
    Ok(())
}

async fn cmd_status(
    config_path: Option<&Path>,
    dump: Option<&str>,
    format: &str,
    compact: bool,
) -> Result<()> {
    let format: OutputFormat = format.parse()?;
    let lens = open(config_path)?;

    let report = match dump {
        Some(raw) => {
            let id: DumpIdentifier = raw.parse()?;
            let info = lens
                .dumps()
                .get(&id)
                .with_context(|| format!("dump {id} not found"))?;
            let result = lens
                .dumps()
                .get_result(&id)?
                .with_context(|| format!("dump {id} has no analysis result"))?;
            match format {
                OutputFormat::Text => text::format_result(&info, &result),
                OutputFormat::Json => json::format_result(&info, &result, compact),
            }
        }
        None => {
            let dumps = lens.dumps().get_all();
            match format {
                OutputFormat::Text => text::format_status(&dumps),
                OutputFormat::Json => json::format_status(&dumps, compact),
            }
        }
    };
    lens.shutdown().await?;
    println!("{report}");
    Ok(())
}

async fn cmd_similarity(
    config_path: Option<&Path>,
    dump: Option<&str>,
    all: bool,
    days: i64,
    force: bool,
) -> Result<()> {
    let lens = open(config_path)?;
    let scheduled = match dump {
        Some(raw) if !all => {
            let id: DumpIdentifier = raw.parse()?;
            usize::from(lens.admin().trigger_similarity_analysis(&id)?)
        }
        _ => lens.admin().trigger_similarity_analysis_since(days, force)?,
    };
    lens.wait_idle().await;
    lens.shutdown().await?;
    println!("Scheduled {scheduled} similarity analyses.");
    Ok(())
}

async fn cmd_clusters(config_path: Option<&Path>, format: &str, compact: bool) -> Result<()> {
    let format: OutputFormat = format.parse()?;
    let lens = open(config_path)?;
    let snapshot = lens.admin().rebuild_cluster_heap();
    lens.shutdown().await?;
    let report = match format {
        OutputFormat::Text => text::format_clusters(&snapshot),
        OutputFormat::Json => json::format_clusters(&snapshot, compact),
    };
    println!("{report}");
    Ok(())
}

async fn cmd_wipe_relationships(config_path: Option<&Path>) -> Result<()> {
    let lens = open(config_path)?;
    lens.admin().wipe_all_relationships()?;
    lens.shutdown().await?;
    println!("Wiped all relationships.");
    Ok(())
}

async fn cmd_serve(config_path: Option<&Path>) -> Result<()> {
    let lens = open(config_path)?;
    lens.start_background()?;
    tracing::info!(
        interval = ?lens.config().similarity.cluster_interval(),
        "serving, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    lens.admin().clean_similarity_queue();
    lens.shutdown().await?;
    let snapshot = lens.clusters().current();
    print!("{}", text::format_clusters(&snapshot));
    Ok(())
}

// Taxon Resolver CLI
// resolve | trace | clear-cache | cache-stats

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taxon_resolver::cache::expand_paths;
use taxon_resolver::{
    trace_from_input, AttemptManager, CacheClient, GnverifierClient, ResolutionConfig, Resolver, VERSION,
};

const ATTEMPTS_FILE: &str = "attempts.json";

#[derive(Parser, Debug)]
#[command(name = "taxon-resolver", version)]
#[command(about = "Resolve raw taxonomic records against a name verifier")]
struct Cli {
    /// Log level for this crate (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "TAXON_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve every entry in a CSV file or directory
    Resolve(ResolveArgs),

    /// Show how one entry was grouped, planned and resolved
    Trace(TraceArgs),

    /// Remove cached entries, optionally only keys containing a pattern
    ClearCache(CacheArgs),

    /// Show cache size and entry counts
    CacheStats(CacheArgs),
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// CSV file or directory of CSV files
    #[arg(short, long)]
    input: PathBuf,

    /// Directory for resolved.csv, unsolved.csv and statistics
    #[arg(short, long)]
    output_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long, env = "TAXON_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Recompute grouping and planning even when cached
    #[arg(long)]
    refresh_cache: bool,

    /// Terms per verifier invocation
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TraceFormat {
    Text,
    Json,
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// Entry uuid to trace
    #[arg(long)]
    uuid: String,

    /// Input the entry was loaded from
    #[arg(short, long)]
    input: PathBuf,

    /// attempts.json from a previous `resolve` (defaults to <output-dir>/attempts.json)
    #[arg(long)]
    attempts: Option<PathBuf>,

    /// Output directory of a previous `resolve`
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    format: TraceFormat,

    #[arg(short, long, env = "TAXON_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CacheArgs {
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Use the namespace of a previous `resolve --input`
    #[arg(long)]
    input: Option<PathBuf>,

    /// Only keys containing this text (clear-cache)
    #[arg(long)]
    pattern: Option<String>,

    #[arg(short, long, env = "TAXON_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("taxon_resolver={},info", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Command::Resolve(args) => run_resolve(args),
        Command::Trace(args) => run_trace(args),
        Command::ClearCache(args) => run_clear_cache(args),
        Command::CacheStats(args) => run_cache_stats(args),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<ResolutionConfig> {
    let mut config = ResolutionConfig::load(path).context("Failed to load configuration")?;
    if let Some(dir) = cache_dir {
        config.cache.base_dir = dir;
    }
    Ok(config)
}

fn open_cache(config: &ResolutionConfig, input: Option<&Path>) -> CacheClient {
    let cache = CacheClient::new(&config.cache.base_dir);
    if let Some(input) = input {
        cache.configure_namespace("resolve", VERSION, &expand_paths(input));
    }
    cache
}

fn run_resolve(args: ResolveArgs) -> Result<()> {
    println!("🧬 Taxon Resolver v{}", VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut config = load_config(args.config.as_deref(), args.cache_dir)?;
    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }
    config.validate()?;

    // 1. Gateway (the only fatal external dependency)
    let gateway = GnverifierClient::new(&config.gateway, vec![config.primary_data_source])
        .context("Name verifier unavailable")?;

    // 2. Cache namespace for this input
    let cache = open_cache(&config, Some(&args.input));

    // 3. Resolve
    let run = Resolver::new(&config, &gateway)
        .with_cache(&cache, args.refresh_cache)
        .resolve_path(&args.input)?;

    // 4. Outputs + audit trail
    let files = run.write_outputs(&args.output_dir)?;
    let state_path = args.output_dir.join(ATTEMPTS_FILE);
    run.attempts.save_state(&state_path)?;
    info!("Saved {} attempts to {:?}", run.attempts.len(), state_path);

    let stats = run.statistics();
    println!("\n✓ Entries:        {}", stats.total_entries);
    println!("✓ Entry groups:   {}", stats.entry_groups);
    println!("✓ Query groups:   {}", stats.query_groups);
    println!("✓ Resolved:       {}", stats.resolved_entries);
    println!("✓ Unsolved:       {}", stats.unsolved_entries);
    if !run.skipped_files.is_empty() {
        println!("⚠ Skipped files:  {}", run.skipped_files.len());
    }
    println!("\n📂 {}", files.resolved.display());
    println!("📂 {}", files.unsolved.display());
    println!("📊 {}", files.stats.display());

    Ok(())
}

fn run_trace(args: TraceArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), None)?;

    let state_path = args
        .attempts
        .or_else(|| args.output_dir.map(|dir| dir.join(ATTEMPTS_FILE)));
    let attempts = match state_path {
        Some(path) => Some(AttemptManager::load_state(&path)?),
        None => None,
    };

    let trace = trace_from_input(
        &args.input,
        &args.uuid,
        config.primary_data_source,
        attempts.as_ref(),
    )?;

    match args.format {
        TraceFormat::Json => println!("{}", serde_json::to_string_pretty(&trace)?),
        TraceFormat::Text => print!("{}", trace.render_text()),
    }
    Ok(())
}

fn run_clear_cache(args: CacheArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.cache_dir)?;
    let cache = open_cache(&config, args.input.as_deref());

    let removed = cache.clear_cache(args.pattern.as_deref())?;
    println!("🗑️  Removed {} cache entries from {}", removed, cache.directory().display());
    Ok(())
}

fn run_cache_stats(args: CacheArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.cache_dir)?;
    let cache = open_cache(&config, args.input.as_deref());

    let stats = cache.cache_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

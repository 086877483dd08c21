// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rotor: secret rotation for a multi-protocol proxy deployment
//!
//! Each stage is its own invocation, run in order by the deployment
//! pipeline: `resolve`, `mutate`, `patch`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rotor::audit::AuditSink;
use rotor::secrets::OsSecretSource;
use rotor::{stages, Config, ResolvedPaths};

const DEFAULT_CONFIG: &str = "rotor.toml";

/// Rotor: per-deployment secret rotation
///
/// Generates fresh paths, passwords, keys and decoy domains for every managed
/// proxy inbound and carries them into the haproxy configuration.
#[derive(Parser, Debug)]
#[command(name = "rotor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path [default: rotor.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (nothing is written)
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Determine the public address and primary domain
    Resolve {
        /// Use this address instead of asking the lookup endpoint
        #[arg(long)]
        ip: Option<String>,
    },

    /// Rotate secrets in the service document
    #[command(alias = "rotate")]
    Mutate,

    /// Apply the latest change set to haproxy.cfg
    Patch {
        /// Write the result here instead of in place
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show resolved file locations
    Paths,

    /// Show the latest audit records
    History,

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    init_logging(&cli, &config);

    let paths = config.paths.resolve(|var| std::env::var(var).ok());

    match cli.command {
        Commands::Version => {
            println!("Rotor v{}", env!("CARGO_PKG_VERSION"));
            println!("Per-deployment secret rotation for proxy inbounds");
            Ok(())
        }

        Commands::Paths => show_paths(&paths),

        Commands::History => show_history(&paths),

        Commands::Resolve { ip } => run_resolve(&config, &paths, ip.as_deref(), cli.dry_run),

        Commands::Mutate => run_mutate(&config, &paths, cli.dry_run),

        Commands::Patch { out } => run_patch(&config, &paths, out.as_deref(), cli.dry_run),
    }
}

/// Explicit `--config` must exist; the default file is optional
fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let config = match explicit {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG))?,
        None => Config::default(),
    };
    Ok(config)
}

fn init_logging(cli: &Cli, config: &Config) {
    let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::from_default_env()
    } else if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new(&config.logging.level)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.debug);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn show_paths(paths: &ResolvedPaths) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(paths)?);
    Ok(())
}

fn show_history(paths: &ResolvedPaths) -> anyhow::Result<()> {
    if !paths.sqlite.exists() {
        println!("No audit store at {}", paths.sqlite.display());
        return Ok(());
    }

    let sink = AuditSink::open(&paths.sqlite)
        .with_context(|| format!("Failed to open audit store {}", paths.sqlite.display()))?;

    println!("Audit store: {}", paths.sqlite.display());
    println!("  Mutation runs: {}", sink.run_count()?);

    if let Some((ip, domain)) = sink.latest_server()? {
        println!("  Server: {} ({})", domain, ip);
    }
    if let Some(domains) = sink.latest_domains()? {
        println!("  Decoy domains: {}", domains.join(", "));
    }
    if let Some(key) = sink.latest_reality_key()? {
        println!("  Reality public key: {}", key);
    }
    if let Some(row) = sink.latest_paths()? {
        println!("  Recorded columns: {}", row.len());
    }
    Ok(())
}

fn run_resolve(config: &Config, paths: &ResolvedPaths, ip: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    let identity = stages::resolve(config, paths, ip, dry_run).context("Failed to resolve server identity")?;

    if dry_run {
        println!("[DRY RUN] {} -> {}", identity.ip, identity.domain);
    } else {
        println!("{} -> {}", identity.ip, identity.domain);
        println!("Wrote {}", paths.domain_txt.display());
    }
    Ok(())
}

fn run_mutate(config: &Config, paths: &ResolvedPaths, dry_run: bool) -> anyhow::Result<()> {
    let mut source = OsSecretSource::new(config.generator.token_length);
    let report = stages::mutate(config, paths, &mut source, &mut OsRng, dry_run)
        .with_context(|| format!("Failed to mutate {}", paths.server_json.display()))?;

    if dry_run {
        println!("[DRY RUN] Would rotate {} inbounds", report.applied.len());
    } else {
        println!("Rotated {} inbounds", report.applied.len());
    }

    println!();
    println!("Decoy domains:");
    println!("  Reality: {}", report.domains.reality());
    println!("  ShadowTLS: {}", report.domains.shadowtls());
    println!("  Hysteria: {}", report.domains.hysteria());

    println!();
    println!("Changed:");
    for tag in &report.applied {
        let recorded = if report.changes.get(tag).is_some() { "" } else { " (not recorded)" };
        println!("  - {}{}", tag, recorded);
    }

    if !report.untouched.is_empty() {
        println!();
        println!("Untouched: {}", report.untouched.join(", "));
    }

    if !dry_run {
        info!(entries = report.changes.len(), reality_key = report.reality_key, "Mutation complete");
        println!();
        println!("Change set: {}", paths.changes.display());
    }
    Ok(())
}

fn run_patch(config: &Config, paths: &ResolvedPaths, out: Option<&Path>, dry_run: bool) -> anyhow::Result<()> {
    let outcome = stages::patch(config, paths, out, dry_run)
        .with_context(|| format!("Failed to patch {}", paths.haproxy.display()))?;

    for note in &outcome.notes {
        println!("{}", note);
    }

    if dry_run {
        println!();
        println!("[DRY RUN] Patched text:");
        print!("{}", outcome.text);
    }
    Ok(())
}

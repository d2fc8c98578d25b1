//! ipset-guard CLI
//!
//! Resolve ipsets, test addresses, and evaluate block/allow list rules from
//! the command line.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ipset_guard::{is_root, Config, Guard};
use ipset_read::Channel;

/// ipset-guard - block/allow list checks against kernel ipsets
#[derive(Parser)]
#[command(name = "ipset-guard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ipset-guard.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve set names to kernel handles
    Resolve {
        /// Set names
        #[arg(required = true)]
        sets: Vec<String>,
    },

    /// Test addresses for membership in a set
    Test {
        /// Set name
        set: String,

        /// IPv4 addresses to test
        #[arg(required = true)]
        addrs: Vec<Ipv4Addr>,
    },

    /// Evaluate the configured rules for connecting peers
    Check {
        /// Server whose rule applies (default rule if omitted)
        #[arg(short, long)]
        server: Option<String>,

        /// Peer addresses
        #[arg(required = true)]
        addrs: Vec<IpAddr>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "ipset-guard.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Resolve { sets } => run_resolve(&sets),
        Commands::Test { set, addrs } => run_test(&set, &addrs),
        Commands::Check { server, addrs } => run_check(&cli.config, server.as_deref(), &addrs),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn check_privileges() {
    if !is_root() {
        warn!("ipset lookups need root (CAP_NET_ADMIN and CAP_NET_RAW); expect permission errors");
    }
}

fn run_resolve(sets: &[String]) -> Result<()> {
    check_privileges();

    let mut channel = Channel::new();
    let version = channel
        .initialize()
        .context("Failed to open ipset control channel")?;
    info!("ipset kernel protocol {}", version);

    for name in sets {
        let handle = channel
            .resolve(name)
            .with_context(|| format!("Failed to resolve ipset {:?}", name))?;
        println!("{}\t{}", name, handle.index());
    }

    Ok(())
}

fn run_test(set: &str, addrs: &[Ipv4Addr]) -> Result<()> {
    check_privileges();

    let mut channel = Channel::new();
    let handle = channel
        .resolve(set)
        .with_context(|| format!("Failed to resolve ipset {:?}", set))?;

    let mut failures = 0;
    for addr in addrs {
        match channel.test(handle, *addr) {
            Ok(membership) => println!("{}\t{}", addr, membership),
            Err(e) => {
                println!("{}\tfailed: {}", addr, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} membership tests failed", failures, addrs.len());
    }
    Ok(())
}

fn run_check(config_path: &Path, server: Option<&str>, addrs: &[IpAddr]) -> Result<()> {
    check_privileges();

    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let mut guard = Guard::configure(Channel::new(), &config)
        .context("Failed to configure ipset guard")?;

    for addr in addrs {
        let verdict = guard.check(server, *addr);
        println!("{}\t{}", addr, verdict);
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nCreate the referenced ipsets before running checks.");

    Ok(())
}

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tubesentry::auth::build_authenticator;
use tubesentry::clock::{Clock, SystemClock};
use tubesentry::config::LoggingConfig;
use tubesentry::feed::HttpFeedFetcher;
use tubesentry::health::CheckResult;
use tubesentry::notify::build_notifier;
use tubesentry::sync::{format_duration, open_ledger};
use tubesentry::youtube::YouTubeClient;
use tubesentry::{Config, HealthCheck, Ledger, RuleSet, RunContext, SyncOrchestrator};

#[derive(Parser)]
#[command(name = "tubesentry")]
#[command(about = "Quota-aware YouTube playlist synchronization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run one synchronization pass
    Run {
        /// Evaluate everything but change no playlist and write no records
        #[arg(long)]
        dry_run: bool,
    },

    /// List channel rules and why any of them are invalid
    Rules,

    /// Show historic run statistics and today's quota usage
    Stats,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, &LoggingConfig::default())?;
        return cmd_init(cli.config, force);
    }

    let config = load_config(cli.config);
    let logging = config.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
    init_logging(cli.verbose, &logging)?;
    let config = config?;
    info!("Starting tubesentry v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { .. } => Ok(ExitCode::SUCCESS),
        Commands::Run { dry_run } => cmd_run(&config, dry_run).await,
        Commands::Rules => cmd_rules(&config),
        Commands::Stats => cmd_stats(&config),
        Commands::Doctor => cmd_doctor(&config),
    }
}

/// Initialize logging from the config, `--verbose` and `RUST_LOG`
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        bail!("Configuration already exists at {:?}; use --force to overwrite", path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    Config::default().save(&path)?;

    println!("✅ tubesentry initialized");
    println!("   Config: {}", path.display());
    println!("   Next: add channel rules, save an OAuth token, then run 'tubesentry doctor'");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(config: &Config, dry_run: bool) -> Result<ExitCode> {
    let rules = RuleSet::from_config(&config.channels);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let notifier = build_notifier(&config.notifications)?;

    let ledger = match open_ledger(config.database_path(), notifier.as_ref()).await {
        Ok(ledger) => ledger,
        Err(err) => {
            eprintln!("❌ {}", err);
            return Ok(ExitCode::from(err.exit_code()));
        }
    };

    let auth = build_authenticator(&config.auth, Arc::clone(&clock))?;
    let ctx = RunContext {
        ledger,
        feed_fetcher: Arc::new(HttpFeedFetcher::new(&config.feed)?),
        api: Arc::new(YouTubeClient::new(&config.api, auth)?),
        notifier,
        clock,
    };

    let orchestrator = match SyncOrchestrator::new(config, rules, ctx, dry_run) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("❌ {}", err);
            return Ok(ExitCode::from(err.exit_code()));
        }
    };

    match orchestrator.run().await {
        Ok(summary) => {
            println!("{}", summary.render());
            Ok(ExitCode::SUCCESS)
        }
        Err(aborted) => {
            println!("{}", aborted.summary.render());
            eprintln!("❌ {}", aborted.error);
            Ok(ExitCode::from(aborted.exit_code()))
        }
    }
}

fn cmd_rules(config: &Config) -> Result<ExitCode> {
    let set = RuleSet::from_config(&config.channels);

    println!("Channel rules ({} valid, {} invalid):", set.rules.len(), set.rejected.len());
    for rule in &set.rules {
        let max = if rule.max_duration == u64::MAX {
            "∞".to_string()
        } else {
            rule.max_duration.to_string()
        };
        println!("  ✅ {} ({}) -> {}", rule.channel_name, rule.channel_id, rule.playlist_name);
        println!(
            "     title /{}/, duration {}..{}s, last {}h",
            rule.pattern_str(),
            rule.min_duration,
            max,
            rule.hours_limit
        );
    }
    for err in &set.rejected {
        println!("  ❌ {}", err);
    }

    if !config.cleanup.is_empty() {
        println!("Retention:");
        for policy in &config.cleanup {
            println!(
                "  🧹 {} older than {} days",
                policy.playlist_name.as_deref().unwrap_or(&policy.playlist_id),
                policy.max_age_days
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_stats(config: &Config) -> Result<ExitCode> {
    let ledger = Ledger::open_at(config.database_path())?;
    let now = Utc::now();

    println!("📊 tubesentry statistics");
    for period in ledger.stats_summary(now)? {
        println!(
            "  {:<6} {:>4} runs, +{} videos ({}), -{} videos ({}), {} quota units",
            period.label,
            period.runs,
            period.videos_added,
            format_duration(period.duration_added),
            period.videos_removed,
            format_duration(period.duration_removed),
            period.quota_used
        );
    }

    let today = ledger.quota_for(now.date_naive())?;
    println!(
        "Quota {}: {}/{} units used, {} saved, {} calls avoided",
        today.date, today.units_consumed, config.quota.daily_budget, today.units_saved, today.operations_avoided
    );

    Ok(ExitCode::SUCCESS)
}

fn cmd_doctor(config: &Config) -> Result<ExitCode> {
    let health = HealthCheck::run(config, Utc::now());
    print_health_report(&health);

    if health.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 tubesentry diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}

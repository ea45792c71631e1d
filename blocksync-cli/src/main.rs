use anyhow::{bail, Context, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use libblocksync::{
    sync, ActionKind, CreateOptions, Operation, RateLimitConfig, RetryConfig, SyncConfig,
    SyncOptions, SyncSummary, DEFAULT_DOMAINS_URL,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    num::NonZeroU32,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

const EXIT_DOMAIN_FAILURES: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Config {
    source_url: Option<String>,
    allow_removal: bool,
    allow_with_approval: bool,
    http: HttpConfig,
    retry: RetrySection,
    rate_limit: RateLimitSection,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct HttpConfig {
    timeout_secs: u64,
    page_size: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            page_size: 200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct RetrySection {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct RateLimitSection {
    default_limit: u32,
    fallback_window_secs: u64,
    requests_per_second: Option<u32>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            default_limit: defaults.default_limit,
            fallback_window_secs: defaults.fallback_window.as_secs(),
            requests_per_second: None,
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("blocksync").join("config.toml"))
}

/// An explicitly requested file must exist; the default location is optional.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

fn get_default_config_toml() -> String {
    format!(
        r#"# blocksync configuration
#
# Connection settings come from the environment (MASTODON_HOST,
# MASTODON_API_TOKEN); this file only tunes behaviour.

# Plaintext list of disposable domains, one per line
# source_url = "{DEFAULT_DOMAINS_URL}"

# Delete blocks that are no longer in the source list
allow_removal = false

# Create blocks that require approval instead of rejecting sign-ups
allow_with_approval = false

[http]
timeout_secs = 30
page_size = 200

[retry]
max_attempts = 3
initial_backoff_ms = 500
max_backoff_ms = 30000

[rate_limit]
# Assumed budget until the server reports X-RateLimit-* headers
default_limit = 300
fallback_window_secs = 300
# requests_per_second = 5
"#
    )
}

#[derive(Parser, Debug)]
#[command(name = "blocksync")]
#[command(about = "Sync disposable email domains into a Mastodon email domain blocklist", long_about = None)]
struct Args {
    /// Base URL of the Mastodon server
    #[arg(long, env = "MASTODON_HOST")]
    host: Option<String>,

    /// Admin API token with the admin:write:email_domain_blocks scope
    #[arg(long, env = "MASTODON_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Override the disposable domains list URL
    #[arg(long, env = "DISPOSABLE_DOMAINS_URL")]
    source_url: Option<String>,

    /// Compute and print the plan without changing anything
    #[arg(long, env = "DRY_RUN", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    dry_run: bool,

    /// Log every domain and name failed domains in the report
    #[arg(long, short = 'v', env = "VERBOSE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    verbose: bool,

    /// Delete blocks that are no longer in the source list
    #[arg(long, env = "ALLOW_REMOVAL", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    allow_removal: bool,

    /// Path to a TOML config file
    #[arg(long, env = "BLOCKSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Output results as NDJSON (one JSON object per domain, then the summary)
    #[arg(long, short = 'j')]
    ndjson: bool,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

fn build_sync_config(args: &Args, file: &Config) -> Result<SyncConfig> {
    let Some(host) = args.host.as_deref().filter(|h| !h.trim().is_empty()) else {
        bail!("MASTODON_HOST environment variable is required");
    };
    let Some(token) = args.token.as_deref().filter(|t| !t.trim().is_empty()) else {
        bail!("MASTODON_API_TOKEN environment variable is required");
    };

    let mut config = SyncConfig::new(host, token);
    if let Some(url) = args.source_url.as_ref().or(file.source_url.as_ref()) {
        config.source_url = url.clone();
    }
    config.options = SyncOptions {
        dry_run: args.dry_run,
        allow_removal: args.allow_removal || file.allow_removal,
        create: CreateOptions {
            allow_with_approval: file.allow_with_approval,
        },
    };
    config.timeout = Duration::from_secs(file.http.timeout_secs.max(1));
    config.page_size = file.http.page_size;
    config.retry = RetryConfig {
        max_attempts: file.retry.max_attempts,
        initial_backoff: Duration::from_millis(file.retry.initial_backoff_ms),
        max_backoff: Duration::from_millis(file.retry.max_backoff_ms),
    };
    config.rate_limit = RateLimitConfig {
        default_limit: file.rate_limit.default_limit.max(1),
        fallback_window: Duration::from_secs(file.rate_limit.fallback_window_secs),
        requests_per_second: file.rate_limit.requests_per_second.and_then(NonZeroU32::new),
    };
    Ok(config)
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", get_default_config_toml());
        return ExitCode::SUCCESS;
    }

    if args.write_default_config {
        return match write_default_config() {
            Ok(path) => {
                println!("Default config written to: {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(EXIT_FATAL)
            }
        };
    }

    init_logging(args.verbose);

    match run(&args) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_DOMAIN_FAILURES),
        Err(e) => {
            error!("Sync failed: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn write_default_config() -> Result<PathBuf> {
    let Some(path) = config_path() else {
        bail!("Could not determine config path");
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, get_default_config_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn run(args: &Args) -> Result<SyncSummary> {
    let file = load_config(args.config.as_deref())?;
    let config = build_sync_config(args, &file)?;
    tracing::debug!(?config, "Loaded configuration");

    let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let summary = rt.block_on(sync(&config))?;

    let mut stdout = io::stdout().lock();
    if args.ndjson {
        write_ndjson(&mut stdout, &summary)?;
    } else {
        write_report(&mut stdout, &summary, args.verbose)?;
    }
    stdout.flush()?;

    Ok(summary)
}

fn write_ndjson(out: &mut impl Write, summary: &SyncSummary) -> Result<()> {
    for action in &summary.actions {
        writeln!(out, "{}", serde_json::to_string(action)?)?;
    }
    writeln!(out, "{}", serde_json::to_string(summary)?)?;
    Ok(())
}

fn write_report(out: &mut impl Write, summary: &SyncSummary, verbose: bool) -> io::Result<()> {
    let (add_label, remove_label) = if summary.dry_run {
        ("Domains that would be added", "Domains that would be removed")
    } else {
        ("Domains added", "Domains removed")
    };

    if summary.dry_run {
        writeln!(out, "DRY RUN: no changes were made")?;
        for action in &summary.actions {
            let verb = match action.action {
                ActionKind::WouldAdd => "block",
                ActionKind::WouldRemove => "unblock",
                _ => continue,
            };
            writeln!(out, "  would {}: {}", verb, action.domain)?;
        }
    }

    writeln!(out, "Disposable domains in source: {}", summary.source_domains)?;
    writeln!(out, "Existing blocks: {}", summary.remote_entries)?;
    writeln!(out, "{}: {}", add_label, summary.added)?;
    writeln!(out, "Domains already blocked: {}", summary.already_blocked)?;
    writeln!(out, "{}: {}", remove_label, summary.removed)?;
    writeln!(out, "Source lines skipped: {}", summary.skipped)?;
    writeln!(out, "Domains failed to add: {}", summary.failed(Operation::Add))?;
    writeln!(out, "Domains failed to remove: {}", summary.failed(Operation::Remove))?;

    if verbose {
        for failure in &summary.errors {
            let verb = match failure.operation {
                Operation::Add => "add",
                Operation::Remove => "remove",
            };
            writeln!(out, "  failed to {} {}: {}", verb, failure.domain, failure.message)?;
        }
    }
    Ok(())
}

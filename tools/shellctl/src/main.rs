//! Operator CLI for the ShellKit request interceptor.
//!
//! Provides commands for:
//! - Validating a worker configuration
//! - Showing how a URL would be routed
//! - Warming a durable cache directory from the live network
//! - Inspecting the generations stored in a cache directory
//! - Publishing the current tunnel URL into the app manifest
//!
//! ## Usage
//!
//! ```bash
//! # Validate and show the resolved precache list
//! shellctl check worker.json
//!
//! # How would a navigation to this URL be handled?
//! shellctl classify worker.json https://abc.trycloudflare.com/orders --navigate
//!
//! # Install + activate into ./cache
//! shellctl warm worker.json --cache-dir ./cache
//!
//! # What is stored, and which entry would answer this URL?
//! shellctl inspect --cache-dir ./cache https://pages.example.io/app.js
//!
//! # Update manifest.json from tunnel.log and push it to GitHub
//! shellctl tunnel-link --publish --owner me --repo sales-pwa
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use shellkit_common::{init_logging, with_timeout, LogConfig, LogFormat};
use shellkit_net::{HttpFetcher, LoaderConfig, Request, RequestMode};
use shellkit_sw::{classify, CacheStorage, RequestKey, ServiceWorker, WorkerConfig};
use url::Url;

mod tunnel;

#[derive(Parser)]
#[command(name = "shellctl")]
#[command(about = "Operator CLI for the ShellKit request interceptor")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a worker configuration
    Check {
        /// Worker configuration (JSON)
        config: PathBuf,
    },

    /// Show the routing strategy for a URL
    Classify {
        /// Worker configuration (JSON)
        config: PathBuf,
        /// Request URL
        url: String,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
    },

    /// Install and activate into a durable cache directory
    Warm {
        /// Worker configuration (JSON)
        config: PathBuf,
        /// Cache directory
        #[arg(short, long, default_value = ".shellkit-cache")]
        cache_dir: PathBuf,
        /// Overall time limit in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// List the generations in a cache directory, or look up one URL
    Inspect {
        /// Cache directory
        #[arg(short, long, default_value = ".shellkit-cache")]
        cache_dir: PathBuf,
        /// URL to look up (GET) across all generations
        url: Option<String>,
    },

    /// Write the latest tunnel URL into manifest.json
    TunnelLink {
        /// Tunnel client log
        #[arg(long, default_value = "tunnel.log")]
        log: PathBuf,
        /// Local manifest to update
        #[arg(long, default_value = "manifest.json")]
        manifest: PathBuf,
        /// Also publish the manifest to GitHub
        #[arg(long)]
        publish: bool,
        /// Repository owner
        #[arg(long, required_if_eq("publish", "true"))]
        owner: Option<String>,
        /// Repository name
        #[arg(long, required_if_eq("publish", "true"))]
        repo: Option<String>,
        /// Path of the manifest inside the repository
        #[arg(long, default_value = "manifest.json")]
        repo_path: String,
        /// GitHub token (falls back to GITHUB_TOKEN, then the saved token)
        #[arg(long)]
        token: Option<String>,
        /// Save the token for later runs
        #[arg(long)]
        save_token: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(format))?;

    match cli.command {
        Commands::Check { config } => check(&config),
        Commands::Classify {
            config,
            url,
            navigate,
        } => classify_url(&config, &url, navigate),
        Commands::Warm {
            config,
            cache_dir,
            timeout_secs,
        } => warm(&config, cache_dir, Duration::from_secs(timeout_secs)).await,
        Commands::Inspect { cache_dir, url } => inspect(cache_dir, url.as_deref()).await,
        Commands::TunnelLink {
            log,
            manifest,
            publish,
            owner,
            repo,
            repo_path,
            token,
            save_token,
        } => {
            let target = match (publish, owner, repo) {
                (true, Some(owner), Some(repo)) => Some(tunnel::RepoFile {
                    owner,
                    repo,
                    path: repo_path,
                }),
                (true, _, _) => bail!("--publish needs --owner and --repo"),
                (false, _, _) => None,
            };
            tunnel_link(&log, &manifest, target, token, save_token).await
        }
    }
}

fn load(path: &Path) -> anyhow::Result<shellkit_sw::ResolvedConfig> {
    let config = WorkerConfig::from_json_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(config.resolve()?)
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;

    println!("Configuration OK");
    println!("  Canonical URL: {}", config.canonical_url);
    println!("  Scope:         {}", config.scope);
    println!("  Version:       {}", config.cache_version);
    println!("  API prefix:    {}", config.api_prefix);
    println!("  Install:       {:?}", config.install_policy);
    println!("  Cache on miss: {}", config.cache_on_miss);
    println!("  Precache ({}):", config.precache.len());
    for url in &config.precache {
        println!("    {url}");
    }
    Ok(())
}

fn classify_url(path: &Path, url: &str, navigate: bool) -> anyhow::Result<()> {
    let config = load(path)?;
    let url = Url::parse(url).with_context(|| format!("parsing {url}"))?;

    let mut request = Request::get(url);
    if navigate {
        request = request.mode(RequestMode::Navigate);
    }

    let rule = classify(&config, &request);
    println!("{:?} ({:?})", rule.strategy(), rule);
    Ok(())
}

async fn warm(path: &Path, cache_dir: PathBuf, timeout: Duration) -> anyhow::Result<()> {
    let config = load(path)?;
    let storage = Arc::new(CacheStorage::open_dir(&cache_dir).await?);
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);

    let (worker, _events) = ServiceWorker::new(config, storage.clone(), fetcher);
    let (installed, activated) = with_timeout(timeout, || worker.start()).await??;

    println!("Installed {} into {}", installed.version, cache_dir.display());
    println!("  Cached:  {}", installed.cached.len());
    for (url, reason) in &installed.skipped {
        println!("  Skipped: {url} ({reason})");
    }
    for name in &activated.deleted {
        println!("  Deleted stale generation: {name}");
    }
    for (name, reason) in &activated.failed {
        println!("  Could not delete {name}: {reason}");
    }
    println!("Generations: {:?}", storage.keys().await);
    Ok(())
}

async fn inspect(cache_dir: PathBuf, url: Option<&str>) -> anyhow::Result<()> {
    if !cache_dir.is_dir() {
        bail!("{} is not a cache directory", cache_dir.display());
    }
    let storage = CacheStorage::open_dir(&cache_dir).await?;

    let Some(url) = url else {
        for name in storage.keys().await {
            let cache = storage.open(&name).await?;
            println!("{name} ({} entries)", cache.len().await);
            for key in cache.keys().await {
                println!("  {} {}", key.method, key.url);
            }
        }
        return Ok(());
    };

    let url = Url::parse(url).with_context(|| format!("parsing {url}"))?;
    match storage.match_request(&RequestKey::get(&url)).await {
        Some(entry) => {
            println!("{} {}", entry.status, entry.url);
            for (name, value) in &entry.headers {
                println!("  {name}: {value}");
            }
            println!("  {} bytes, cached at {} ms", entry.body.len(), entry.cached_at);
        }
        None => {
            println!("Not cached: {url}");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn tunnel_link(
    log: &Path,
    manifest: &Path,
    target: Option<tunnel::RepoFile>,
    token: Option<String>,
    save_token: bool,
) -> anyhow::Result<()> {
    let url = match tunnel::tunnel_url_from_log(log) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Start the tunnel with:");
            eprintln!(
                "  cloudflared tunnel --url http://localhost:3000 > {} 2>&1 &",
                log.display()
            );
            std::process::exit(1);
        }
    };
    println!("Tunnel URL: {url}");

    let content = tunnel::update_manifest(manifest, &url)?;
    println!("Updated {}", manifest.display());

    let Some(target) = target else {
        return Ok(());
    };

    let saved = tunnel::token_path()?;
    let token = tunnel::resolve_token(token, &saved)?;
    if save_token {
        tunnel::save_token(&saved, &token)?;
    }

    let client = reqwest::Client::new();
    let message = format!("Update app_url to {url}");
    tunnel::publish(&client, &target, &content, &message, &token).await?;
    println!(
        "Published {} to {}/{}",
        target.path, target.owner, target.repo
    );
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taxora_core::{
    ChatMessage, DispatchOptions, DispatchResult, UserRole, build_system_prompt,
};
use taxora_gateway::GatewayServer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod registry;

use config::TaxoraConfig;

#[derive(Parser)]
#[command(name = "taxora")]
#[command(version)]
#[command(about = "Taxora - AI finance assistant with multi-provider routing")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat gateway until Ctrl+C
    Serve,

    /// Send a one-shot question through the provider router
    Ask {
        /// The message to send
        message: String,

        /// Backend id to use instead of the active one
        #[arg(short, long)]
        provider: Option<String>,

        /// Fail instead of falling back to another backend
        #[arg(long)]
        no_fallback: bool,

        /// Name used in the system prompt
        #[arg(long, default_value = "there")]
        name: String,

        /// student, professional or general
        #[arg(long, default_value = "general")]
        role: String,
    },

    /// List backends and their availability
    Providers {
        /// Send a short test conversation to every available backend
        #[arg(long)]
        test: bool,
    },

    /// Initialize config directory and default config
    Init,

    /// Show current configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::Ask {
            message,
            provider,
            no_fallback,
            name,
            role,
        } => cmd_ask(&cli.config, &message, provider, no_fallback, &name, &role).await,
        Commands::Providers { test } => cmd_providers(&cli.config, test).await,
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Taxora initialized at {}", config_dir.display());
    println!(
        "Export your provider keys (GEMINI_API_KEY, OPENAI_API_KEY, ...) or edit {}.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TaxoraConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

async fn cmd_serve(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = TaxoraConfig::load(config_path)?;
    info!("Starting Taxora gateway...");

    let router = Arc::new(registry::bootstrap(&cfg).await);

    let addr: SocketAddr = format!("{}:{}", cfg.gateway.bind, cfg.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                cfg.gateway.bind, cfg.gateway.port
            )
        })?;
    if cfg.gateway.auth_token.is_empty() && !addr.ip().is_loopback() {
        warn!(
            "Gateway is bound to {} without an auth token; anyone who can reach it can chat and switch providers",
            addr
        );
    }

    let server = GatewayServer::new(addr, router, cfg.gateway.auth_token.clone())
        .with_max_message_chars(cfg.gateway.max_message_chars)
        .with_history_window(cfg.gateway.history_window)
        .with_chat_timeout(cfg.gateway.chat_timeout_secs.map(Duration::from_secs));

    let cancel = CancellationToken::new();
    let mut server_task = server.spawn(cancel.clone());
    println!("Taxora gateway listening on http://{}", addr);

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
            server_task.await??;
        }
        result = &mut server_task => {
            result??;
        }
    }

    println!("Taxora stopped.");
    Ok(())
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    message: &str,
    provider: Option<String>,
    no_fallback: bool,
    name: &str,
    role: &str,
) -> Result<()> {
    let message = message.trim();
    if message.is_empty() {
        anyhow::bail!("Message cannot be empty");
    }

    let cfg = TaxoraConfig::load(config_path)?;
    let router = registry::bootstrap(&cfg).await;

    let conversation = [
        ChatMessage::system(build_system_prompt(name, UserRole::parse(role))),
        ChatMessage::user(message),
    ];

    let mut options = DispatchOptions::new();
    if let Some(id) = provider {
        options = options.with_backend(id);
    }
    if no_fallback {
        options = options.without_fallback();
    }

    let result = router.dispatch(&conversation, options).await;
    println!("{}", result.text);
    eprintln!("{}", provenance(&result));

    if !result.success {
        anyhow::bail!("No backend produced an answer");
    }
    Ok(())
}

async fn cmd_providers(config_path: &Option<PathBuf>, test: bool) -> Result<()> {
    let cfg = TaxoraConfig::load(config_path)?;
    let router = registry::bootstrap(&cfg).await;
    let status = router.list_status().await;

    println!(
        "Active: {}   Switching: {}   Fallback: {}",
        status.active_id,
        if status.switching_enabled { "on" } else { "off" },
        status.fallback_id.as_deref().unwrap_or("none")
    );
    println!();
    println!("  {:<12} {:<18} {:<15} {}", "ID", "NAME", "STATUS", "MODEL");
    for backend in &status.backends {
        let marker = if backend.is_active { "*" } else { " " };
        let d = &backend.descriptor;
        println!(
            "{} {:<12} {:<18} {:<15} {}",
            marker, d.id, d.display_name, d.availability, backend.model
        );
        if let Some(detail) = &d.detail {
            println!("  {:<12} {}", "", detail);
        }
        if let Some(limits) = &backend.rate_limit {
            println!(
                "  {:<12} {}/{} this minute, {}/{} today",
                "",
                limits.requests_last_minute,
                limits.minute_limit,
                limits.requests_today,
                limits.daily_limit
            );
        }
    }
    println!();
    println!(
        "{} of {} backends available",
        status.available_count,
        status.backends.len()
    );

    if test {
        println!();
        println!("Testing available backends...");
        for report in router.probe_all().await {
            let verdict = if report.working { "ok" } else { "FAILED" };
            match report.response_length {
                Some(len) => println!(
                    "  {:<12} {:<7} {} ({} chars)",
                    report.id, verdict, report.message, len
                ),
                None => println!("  {:<12} {:<7} {}", report.id, verdict, report.message),
            }
        }
    }

    Ok(())
}

/// One line describing which backend answered and why
fn provenance(result: &DispatchResult) -> String {
    let reason = serde_json::to_value(result.fallback_reason)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let failure = result
        .failure
        .and_then(|f| serde_json::to_value(f).ok())
        .and_then(|v| v.as_str().map(str::to_string));

    match (result.success, result.fallback_used, failure) {
        (true, false, _) => format!("[answered by {}]", result.backend_used),
        (true, true, _) => format!(
            "[answered by {} after fallback from {} ({})]",
            result.backend_used, result.requested_backend, reason
        ),
        (false, _, Some(failure)) => format!(
            "[no answer from {}: {}]",
            result.requested_backend, failure
        ),
        (false, _, None) => format!("[no answer from {}]", result.requested_backend),
    }
}

mod config;

use crate::config::ThinkgateConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thinkgate_agent::{Dispatcher, LlmProvider, RecursiveThinkingEngine};
use thinkgate_core::{init_tracing, LogFormat};
use thinkgate_gateway::{AppState, GatewayServer};
use thinkgate_security::{ApiKeyManager, AuditLog, RateLimiter, Scope};
use tracing::{info, warn};

/// Limiter buckets idle for this long are dropped.
const LIMITER_IDLE: Duration = Duration::from_secs(600);
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(
    name = "thinkgate",
    version,
    about = "Thinkgate: resilient multi-provider LLM gateway with recursive thinking"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "thinkgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Print the provider chain in dispatch order
    Providers,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Issue a key; the secret is printed once
    Create {
        #[arg(long)]
        name: String,
        /// Repeat for several scopes (chat, admin, status)
        #[arg(long = "scope", required = true)]
        scopes: Vec<Scope>,
        /// Expire the key after this many days
        #[arg(long)]
        ttl_days: Option<u32>,
    },
    /// List key records, oldest first
    List,
    /// Revoke a key by id
    Revoke { key_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let format = match cli.command {
        Commands::Serve { .. } => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    init_tracing(format, "info");

    let config = ThinkgateConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(config, host, port).await?;
        }
        Commands::Keys { action } => keys(&config, action).await?,
        Commands::Providers => providers(&config),
    }

    Ok(())
}

async fn serve(config: ThinkgateConfig, host: String, port: u16) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let audit = Arc::new(AuditLog::new(config.audit_dir()));
    let keys = Arc::new(
        ApiKeyManager::init(config.keystore())
            .await?
            .with_audit(audit.clone()),
    );
    if keys.active_count() == 0 {
        warn!("No active API keys; create one with `thinkgate keys create --name <n> --scope chat`");
    }

    let dispatcher = Arc::new(Dispatcher::from_model_config(
        &config.model,
        config.resilience.clone(),
        config.features,
    ));
    for provider in &dispatcher.snapshot().providers {
        let d = provider.descriptor();
        if d.kind != LlmProvider::Mock && d.credential.resolve().is_none() {
            warn!(provider = %d.id, "No API key configured; calls to this provider will fail");
        }
    }
    info!(
        providers = dispatcher.snapshot().providers.len(),
        parallel_thinking = config.features.parallel_thinking,
        adaptive_optimization = config.features.adaptive_optimization,
        prompt_compression = config.features.prompt_compression,
        "Dispatcher ready"
    );

    let engine = Arc::new(RecursiveThinkingEngine::new(dispatcher, config.thinking.clone()));
    let limiter = Arc::new(RateLimiter::new(
        config.security.max_burst,
        config.security.max_requests_per_second,
    ));

    let housekeeping = {
        let keys = keys.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_EVERY);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.cleanup(LIMITER_IDLE).await;
                if let Err(e) = keys.flush().await {
                    warn!(error = %e, "Periodic key snapshot failed");
                }
            }
        })
    };

    let state = Arc::new(AppState::new(engine, keys.clone(), limiter, audit));
    let app = GatewayServer::build(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Thinkgate gateway listening on {addr}");
    GatewayServer::serve(listener, app, shutdown_signal()).await?;

    housekeeping.abort();
    keys.shutdown().await?;
    info!("Key store flushed, shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining requests");
}

async fn keys(config: &ThinkgateConfig, action: KeyAction) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let keys = ApiKeyManager::init(config.keystore()).await?;

    match action {
        KeyAction::Create {
            name,
            scopes,
            ttl_days,
        } => {
            let ttl = ttl_days.map(|d| chrono::Duration::days(i64::from(d)));
            let issued = keys.create(name, scopes, ttl)?;
            println!("Created key {}", issued.record.key_id);
            println!("  name:    {}", issued.record.name);
            println!("  scopes:  {}", scope_list(&issued.record.scopes));
            if let Some(expires) = issued.record.expires_at {
                println!("  expires: {}", expires.to_rfc3339());
            }
            println!("\nSecret (shown once, store it now):\n  {}", issued.secret);
        }
        KeyAction::List => {
            let records = keys.list();
            if records.is_empty() {
                println!("No API keys. Create one with `thinkgate keys create`.");
            }
            for record in &records {
                let status = if record.is_revoked() {
                    "revoked"
                } else if record.is_active() {
                    "active"
                } else {
                    "expired"
                };
                println!(
                    "{}  {:<20} {:<8} [{}] created {}",
                    record.key_id,
                    record.name,
                    status,
                    scope_list(&record.scopes),
                    record.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        KeyAction::Revoke { key_id } => {
            let record = keys.revoke(&key_id)?;
            println!("Revoked key {} ({})", record.key_id, record.name);
        }
    }

    keys.shutdown().await?;
    Ok(())
}

fn providers(config: &ThinkgateConfig) {
    let dispatcher =
        Dispatcher::from_model_config(&config.model, config.resilience.clone(), config.features);
    let snapshot = dispatcher.snapshot();

    println!("Providers in dispatch order:");
    for (rank, provider) in snapshot.providers.iter().enumerate() {
        let d = provider.descriptor();
        let key = if d.credential.resolve().is_some() {
            "key set"
        } else {
            "no key"
        };
        println!(
            "  {}. {:<40} {:<10} timeout {}ms, {}",
            rank + 1,
            d.id,
            d.kind,
            d.timeout.as_millis(),
            key
        );
    }
    println!(
        "\nHedge: {} (delay {}ms), retries: {} attempt(s), breaker threshold: {}",
        if config.resilience.hedge.enabled { "on" } else { "off" },
        config.resilience.hedge.delay_ms,
        config.resilience.retry.max_attempts,
        config.resilience.breaker.failure_threshold
    );
}

fn scope_list<'a>(scopes: impl IntoIterator<Item = &'a Scope>) -> String {
    scopes
        .into_iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

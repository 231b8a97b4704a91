use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tether_core::provider::Provider;
use tether_engine::session::SessionConfig;
use tether_llm::{OpenAiConfig, OpenAiProvider, UnconfiguredProvider};
use tether_server::{AgentServer, ServerConfig};
use tether_store::{MemoryStore, SessionStore, SqliteStore};
use tether_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "tether", about = "Server-authoritative bidirectional agent runtime")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9292)]
    port: u16,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the SQLite session database. Omit for in-memory sessions.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Provider model name.
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// System prompt for fresh sessions.
    #[arg(long)]
    system_prompt: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = match args.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("unknown log level '{}', falling back to info", args.log_level);
            tracing::Level::INFO
        }
    };
    tether_telemetry::init_telemetry(TelemetryConfig {
        log_level,
        ..Default::default()
    });
    tracing::info!(port = args.port, log_level = %args.log_level, "starting tether server");

    let store: Arc<dyn SessionStore> = match &args.db_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => {
                tracing::info!(path = %path.display(), "using sqlite session store");
                Arc::new(store)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open session database");
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("using in-memory session store");
            Arc::new(MemoryStore::new())
        }
    };

    let provider: Arc<dyn Provider> = match std::env::var("OPENAI_API_KEY") {
        Ok(api_key) if !api_key.is_empty() => {
            let mut config = OpenAiConfig::new(api_key, &args.model);
            if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
                config = config.with_base_url(base_url);
            }
            tracing::info!(model = %args.model, "provider configured");
            Arc::new(OpenAiProvider::new(config))
        }
        _ => {
            tracing::warn!("OPENAI_API_KEY not set — agent prompts will fail with an auth error");
            Arc::new(UnconfiguredProvider)
        }
    };

    let mut session = SessionConfig::default();
    if let Some(prompt) = args.system_prompt {
        session.system_prompt = prompt;
    }
    let config = ServerConfig {
        port: args.port,
        session,
        ..Default::default()
    };

    let server = Arc::new(AgentServer::new(config, provider, store));
    let handle = match server.start().await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    tracing::info!(port = handle.port, "tether server ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    handle.shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(10), handle.drain())
        .await
        .is_err()
    {
        tracing::warn!("server drain timed out after 10s");
    }

    tracing::info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    }
}

use std::sync::Arc;

use clap::Parser;
use third_eye_core::provider::ProviderClient;
use third_eye_core::{Persistence, ThirdEyeConfig};
use third_eye_server::http::{build_router, AppState};
use third_eye_server::subsystems::reclaim;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "third-eye.toml")]
    config: String,

    /// Check database and provider health, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match ThirdEyeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let pool = match third_eye_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let persistence = Persistence::new(pool);

    // Provider credentials are optional at boot: without them routing
    // fails with E_LLM_ERROR while deterministic Eyes keep working.
    let provider_key = std::env::var("THIRD_EYE_PROVIDER_API_KEY")
        .or_else(|_| std::env::var("GROQ_API_KEY"))
        .ok();
    if provider_key.is_none() {
        tracing::warn!("no provider API key configured; routing will be degraded");
    }
    let provider = Arc::new(ProviderClient::new(&config.provider, provider_key)?);

    if args.health {
        match persistence.health_check().await {
            Ok(v) => println!("database ok: {}", v),
            Err(e) => {
                println!("database check failed: {}", e);
                std::process::exit(1);
            }
        }
        if provider.health().await {
            println!("provider ok");
        } else {
            println!("provider unreachable (routing degraded)");
        }
        return Ok(());
    }

    let server_secret = match std::env::var("THIRD_EYE_SECRET") {
        Ok(secret) => secret,
        Err(_) => {
            tracing::warn!(
                "THIRD_EYE_SECRET not set; generating an ephemeral secret \
                 (admin sessions will not survive restarts)"
            );
            third_eye_core::keys::generate_api_key()
        }
    };

    let state = AppState::new(config.clone(), persistence.clone(), provider, &server_secret);

    // Bootstrap consumer key for first contact, from the environment.
    if let Ok(raw) = std::env::var("THIRD_EYE_BOOTSTRAP_API_KEY") {
        let record = third_eye_core::models::ApiKeyRecord {
            id: "key_bootstrap".to_string(),
            hashed_secret: state.auth.hash(&raw),
            role: third_eye_core::models::ROLE_CONSUMER.to_string(),
            tenant: None,
            display_name: Some("bootstrap".to_string()),
            limits: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            expires_at: None,
            revoked_at: None,
        };
        state.auth.register_key(record).await;
        tracing::info!("bootstrap API key registered");
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = signal_tx.send(());
    });

    // Reclamation loop: sessions, admin sessions, bus topics.
    tokio::spawn(reclaim::run_reclamation_loop(
        state.sessions.clone(),
        state.auth.clone(),
        state.bus.clone(),
        persistence,
        config.sessions.cleanup_interval_seconds,
        shutdown_tx.subscribe(),
    ));

    let addr = format!("{}:{}", config.service.host, config.service.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Third Eye listening on http://{}", addr);

    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

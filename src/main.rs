//! KernelSanders - Entry Point
//!
//! Runs the webhook/web server until SIGINT or SIGTERM.

use anyhow::Context;
use kernelsanders::{web, App, Config};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("KernelSanders v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: kernelsanders");
        println!();
        println!("Environment variables:");
        println!("  TELEGRAM_TOKEN             Telegram bot token (required)");
        println!("  TELEGRAM_API_URL           Telegram API base override");
        println!("  BOT_USERNAME               Bot username for mentions and /cmd@bot");
        println!("  OPENAI_KEY                 LLM API key (required)");
        println!("  OPENAI_ENDPOINT            LLM API base URL (default: https://api.openai.com/v1)");
        println!("  OPENAI_MODEL               Model (default: gpt-4o-mini)");
        println!("  OPENAI_TIMEOUT_SECS        LLM request timeout (default: 180)");
        println!("  BASE_URL                   Public base URL for links (default: http://localhost:8080)");
        println!("  PORT                       Listen address or port (default: 0.0.0.0:8080)");
        println!("  NO_LIMIT_USERS             Comma-separated user ids exempt from rate limiting");
        println!("  STORAGE_BACKEND            redis, fs or memory (default: fs)");
        println!("  REDIS_URL                  Redis URL (default: redis://127.0.0.1/)");
        println!("  STORAGE_DIR                Directory for the fs backend (default: ./data)");
        println!("  RETENTION_SECS             Response and file lifetime (default: 14400)");
        println!("  CONVERSATION_TTL_SECS      Conversation inactivity window (default: 1800)");
        println!("  CONVERSATION_MAX_MESSAGES  Stored turns per conversation (default: 50)");
        println!("  RATE_LIMIT_MAX             Messages per window (default: 10)");
        println!("  RATE_LIMIT_WINDOW_SECS     Rate window (default: 600)");
        println!("  SWEEP_INTERVAL_SECS        Expiry sweep interval (default: 600)");
        println!("  LOG_REQUESTS               Trace HTTP requests (default: true)");
        println!("  LOG_FORMAT                 'json' for JSON logs");
        println!("  RUST_LOG                   trace, debug, info, warn or error (default: info)");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("KernelSanders v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    config.validate()?;
    let listen_addr = config.listen_addr.clone();

    let app = Arc::new(App::from_config(config).await?);
    app.load_state().await?;
    app.start_sweepers();

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Webhook and response pages available at {}", app.config().base_url);

    let router = web::build_router(web::WebState::new(app.clone()));
    let served = web::serve(listener, router, web::shutdown_signal()).await;

    app.shutdown().await;
    served?;
    Ok(())
}

use std::sync::Arc;

use maildesk::capability::llm::{LlmConfig, LlmExtractor};
use maildesk::config::PipelineConfig;
use maildesk::dashboard::{DashboardState, dashboard_routes};
use maildesk::dispatch::{DEFAULT_CAPACITY, Dispatcher};
use maildesk::mail::{SmtpConfig, SmtpMailSender};
use maildesk::pipeline::PipelineEngine;
use maildesk::rules::RulesEngine;
use maildesk::store::{LibSqlStore, TicketStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let http_port: u16 = std::env::var("MAILDESK_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("📬 Maildesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Ingest API: http://0.0.0.0:{http_port}/api/messages");
    eprintln!("   Ticket API: http://0.0.0.0:{http_port}/api/tickets");

    // ── Database ─────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILDESK_DB_PATH").unwrap_or_else(|_| "./data/maildesk.db".to_string());
    let store: Arc<dyn TicketStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Extraction ───────────────────────────────────────────────────
    let llm_config = LlmConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export LLM_API_KEY=...");
        std::process::exit(1);
    });
    eprintln!("   Model: {}", llm_config.model);
    let extractor = Arc::new(LlmExtractor::new(llm_config));

    // ── Rules ────────────────────────────────────────────────────────
    let rules = match std::env::var("RULES_PATH") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)?;
            eprintln!("   Rules: {path}");
            RulesEngine::from_json(&json)?
        }
        Err(_) => {
            eprintln!("   Rules: built-in defaults");
            RulesEngine::default_rules()
        }
    };

    // ── Outbound mail ────────────────────────────────────────────────
    let smtp_config = SmtpConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export SMTP_HOST=smtp.example.com");
        std::process::exit(1);
    });
    eprintln!("   SMTP: {}:{}", smtp_config.host, smtp_config.port);
    let mail = Arc::new(SmtpMailSender::new(smtp_config));

    // ── Pipeline ─────────────────────────────────────────────────────
    let config = PipelineConfig::from_env()?;
    eprintln!(
        "   Follow-ups: remind after {:?}, {} reminder(s), operator {}\n",
        config.reminder_after, config.max_reminders, config.operator_address,
    );

    let sweep_interval = config.sweep_interval;
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        extractor.clone(),
        extractor.clone(),
        extractor,
        Arc::new(rules),
        mail,
        config,
    ));

    // Periodic follow-up sweep (reminders, stalling).
    let _sweep_handle = engine.followups().spawn_sweep_task(sweep_interval);

    let dispatcher = Arc::new(Dispatcher::spawn(engine, DEFAULT_CAPACITY));

    // ── HTTP surface ─────────────────────────────────────────────────
    let app = dashboard_routes(DashboardState { store, dispatcher });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{http_port}")).await?;
    tracing::info!(port = http_port, "Maildesk server started");
    axum::serve(listener, app).await?;

    Ok(())
}

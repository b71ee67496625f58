mod admin;
mod db_cmds;

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use p8_config::Settings;
use p8_dreaming::DreamingHandler;
use p8_llm::{ChatOptions, ChatTurn};
use p8_queue::{Task, TaskHandler, Tier, WorkerContext};
use p8_server::{AppState, bootstrap, build_app};
use p8_store::{RemQueryEngine, Repository, deterministic_id};

#[derive(Debug, Parser)]
#[command(name = "p8", version, about = "Personal memory and knowledge backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API server plus this process's background workers.
    Serve,
    /// Apply the embedded database migrations.
    Migrate,
    /// Execute a REM dialect query and print the results.
    Query {
        /// e.g. `LOOKUP "sarah-chen"` or `FUZZY migration LIMIT 5`
        query: String,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        user: Option<Uuid>,
    },
    /// One-shot chat turn against a session.
    Chat {
        /// Session name or uuid. Defaults to a scratch session.
        session: Option<String>,
        /// Prompt text; reads stdin when omitted.
        prompt: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Operator commands.
    Admin {
        #[command(subcommand)]
        command: admin::AdminCommands,
    },
    /// Schema inspection and manual SQL application.
    Db {
        #[command(subcommand)]
        command: db_cmds::DbCommands,
    },
    /// Run the dreaming pipeline for a user, immediately and in-process.
    Dream {
        user_id: Uuid,
        #[arg(long, default_value_t = 1)]
        lookback: i64,
        #[arg(long)]
        tenant: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Migrate => {
            let db = connect(&settings).await?;
            db.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Query { query, tenant, user } => {
            let services = bootstrap(settings).await?;
            let engine = RemQueryEngine::new(
                services.db.clone(),
                p8_embed::QueryEmbedderHandle(services.provider.clone()),
            );
            let results = engine.execute(&query, tenant.as_deref(), user).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        Commands::Chat { session, prompt, agent } => chat(settings, session, prompt, agent).await,
        Commands::Admin { command } => admin::run(settings, command).await,
        Commands::Db { command } => db_cmds::run(settings, command).await,
        Commands::Dream { user_id, lookback, tenant } => {
            dream(settings, user_id, lookback, tenant).await
        }
    }
}

async fn connect(settings: &Settings) -> Result<p8_store::Db> {
    p8_store::Db::connect(
        &settings.database.url,
        settings.database.pool_min,
        settings.database.pool_max,
    )
    .await
    .context("connecting to the database")
}

async fn serve(settings: Settings) -> Result<()> {
    let bind_addr = settings.api.bind_addr.clone();
    let services = bootstrap(settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = p8_server::bootstrap::spawn_background(&services, shutdown_rx);

    let app = build_app(AppState::from_services(&services));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "api listening");

    let shutdown_for_server = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            let _ = shutdown_for_server.send(true);
        })
        .await?;

    // Workers drain their current batch before exiting.
    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received");
}

async fn chat(
    settings: Settings,
    session: Option<String>,
    prompt: Option<String>,
    agent: Option<String>,
) -> Result<()> {
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_line(&mut buffer)?;
            buffer.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("empty prompt");
    }

    let services = bootstrap(settings).await?;
    let session_name = session.unwrap_or_else(|| "cli-scratch".to_string());
    let session_id = Uuid::parse_str(&session_name)
        .unwrap_or_else(|_| deterministic_id("sessions", &session_name));

    let repo = Repository::for_table(
        services.db.clone(),
        "sessions",
        Arc::clone(&services.encryption),
    )?;
    let mut row = serde_json::Map::new();
    row.insert("id".into(), json!(session_id.to_string()));
    row.insert("name".into(), json!(session_name));
    row.insert("mode".into(), json!("chat"));
    if let Some(agent) = &agent {
        row.insert("agent_name".into(), json!(agent));
    }
    repo.upsert(row).await?;

    let history = services
        .db
        .rem_load_messages(
            session_id,
            Some(services.settings.memory.context_token_budget as i64),
            None,
            None,
        )
        .await?;

    let mut turns = vec![ChatTurn::System(
        "You are a helpful personal memory assistant.".to_string(),
    )];
    for entry in &history {
        let content = entry["content"].as_str().unwrap_or_default();
        match entry["message_type"].as_str() {
            Some("assistant") => turns.push(ChatTurn::assistant_text(content)),
            Some("user") => turns.push(ChatTurn::User(content.to_string())),
            _ => {}
        }
    }
    turns.push(ChatTurn::User(prompt.clone()));

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let llm = services.llm.clone();
    let model = services.settings.llm.default_model.clone();
    let options = ChatOptions {
        temperature: Some(services.settings.llm.default_temperature),
        max_tokens: Some(services.settings.llm.default_max_tokens),
    };
    let generation =
        tokio::spawn(async move { llm.chat_stream(&model, &turns, None, &options, tx).await });

    while let Some(delta) = rx.recv().await {
        print!("{delta}");
        std::io::stdout().flush()?;
    }
    println!();

    let response = generation.await??;
    services
        .db
        .rem_persist_turn(
            session_id,
            &prompt,
            &response.text,
            None,
            None,
            None,
            None,
            services.settings.memory.moment_token_threshold,
        )
        .await?;
    Ok(())
}

async fn dream(
    settings: Settings,
    user_id: Uuid,
    lookback: i64,
    tenant: Option<String>,
) -> Result<()> {
    let services = bootstrap(settings).await?;

    let ctx = WorkerContext {
        db: services.db.clone(),
        encryption: Arc::clone(&services.encryption),
        queue: Arc::clone(&services.queue),
        embedding: Arc::clone(&services.embedding),
        llm: services.llm.clone(),
        settings: Arc::clone(&services.settings),
        worker_id: "cli-dream".to_string(),
        tier: Tier::Small,
    };
    let task = Task {
        id: Uuid::new_v4(),
        task_type: "dreaming".to_string(),
        tier: Tier::Small.as_str().to_string(),
        user_id: Some(user_id),
        tenant_id: tenant.clone(),
        payload: json!({
            "user_id": user_id.to_string(),
            "tenant_id": tenant,
            "lookback_days": lookback,
        }),
        priority: 0,
        status: "processing".to_string(),
        scheduled_at: chrono::Utc::now(),
        retry_count: 0,
        max_retries: 0,
    };

    let result = DreamingHandler.handle(&task, &ctx).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

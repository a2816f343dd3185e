//! Lexicon - term resolution and generated entry cache
//!
//! "Seek and ye shall find" - Matthew 7:7

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lexicon::{
    config::{Args, LogFormat},
    guard::{GuardPolicy, InputGuard},
    logging::UsageLogger,
    server::{self, AppState},
    store::{EntryStore, MemoryEntryStore, SqliteEntryStore, SqliteOptions},
    synth::{ContentSynthesizer, HttpSynthesizer, UnconfiguredSynthesizer},
    LexiconService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    let fmt_layer = match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lexicon={},info", log_level).into()),
        )
        .with(fmt_layer)
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Lexicon - Term Resolution Cache");
    info!("  \"Seek and ye shall find\"");
    info!("======================================");
    info!("Listen: {}", args.listen);
    match &args.database_path {
        Some(path) => info!("Store: sqlite ({})", path.display()),
        None => info!("Store: memory (entries are lost on restart)"),
    }
    info!("Trigram matching: {}", args.trigram_enabled);
    info!("Trusted proxies: {:?}", args.trusted_proxies);
    info!("Similarity threshold: {}", args.similarity_threshold);
    info!(
        "Rate limits: search {} / generate {} / suggest {}",
        args.rate_limit_search, args.rate_limit_generate, args.rate_limit_suggest
    );
    info!("======================================");

    // Input guard
    let guard = match &args.guard_policy_path {
        Some(path) => {
            let policy = GuardPolicy::from_file(path)?;
            let guard = InputGuard::new(&policy)?;
            info!("Guard policy loaded from {:?} ({} patterns)", path, guard.pattern_count());
            guard
        }
        None => InputGuard::with_defaults(),
    };

    // Entry store
    let store: Arc<dyn EntryStore> = match &args.database_path {
        Some(path) => Arc::new(SqliteEntryStore::open(
            path,
            SqliteOptions {
                trigram: args.trigram_enabled,
            },
        )?),
        None => {
            warn!("No DATABASE_PATH set, using in-memory store");
            if args.trigram_enabled {
                Arc::new(MemoryEntryStore::with_similarity())
            } else {
                Arc::new(MemoryEntryStore::new())
            }
        }
    };

    // Content synthesizer
    let synthesizer: Arc<dyn ContentSynthesizer> = match &args.synthesizer_url {
        Some(url) => {
            info!("Synthesizer: {}", url);
            Arc::new(HttpSynthesizer::new(
                url.as_str(),
                args.synthesizer_token.clone(),
                args.synthesizer_timeout(),
            )?)
        }
        None => {
            warn!("No SYNTHESIZER_URL set, misses will fail with generation_failed");
            Arc::new(UnconfiguredSynthesizer)
        }
    };

    let mut service = LexiconService::new(store, synthesizer, guard, args.service_config());

    // Usage log
    if let Some(path) = &args.usage_log_path {
        let logger = UsageLogger::new();
        logger.init_file(path.clone()).await?;
        service = service.with_usage_logger(logger);
    }

    let capability = service.similarity_capability().await;
    info!("Similarity tier: {:?}", capability);

    let state = Arc::new(AppState::new(args, Arc::new(service)));

    server::run(state).await?;

    Ok(())
}

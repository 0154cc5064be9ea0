// This is the entry point of the security bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (databases, APIs)
// - `discord/` = Discord-specific adapters (commands, events)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework
// 4. Register commands and event handlers

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::security::subscribers::{register_subscribers, SubscriberDeps};
use crate::core::security::{
    ActorLocks, AdminActionStore, CaseStore, DetectionEventStore, DetectionOrchestrator, EventBus,
    MemberStore, ModerationActuator, ModerationPlatform, SecurityActionService,
    SecurityConfigStore, SuspicionClassifier,
};
use crate::discord::security::events as security_events;
use crate::discord::security::SerenityPlatform;
use crate::discord::{Data, Error};
use crate::infra::security::{
    InMemorySecurityStore, OpenRouterClassifier, SqliteSecurityStore, DEFAULT_MODEL,
};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "data/security.db";
const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 8;

/// Event handler for non-command Discord events.
async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if let Err(e) = security_events::handle_message(data, new_message).await {
                tracing::error!("Error screening message: {}", e);
            }
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = security_events::handle_member_join(data, new_member).await {
                tracing::error!("Error screening new member: {}", e);
            }
        }
        _ => {}
    }

    Ok(())
}

/// Wire the pipeline over one store that implements every storage port.
fn build_data<S>(
    store: Arc<S>,
    platform: Arc<dyn ModerationPlatform>,
    classifier: Option<Arc<dyn SuspicionClassifier>>,
    patience: Duration,
) -> Data
where
    S: CaseStore
        + DetectionEventStore
        + AdminActionStore
        + SecurityConfigStore
        + MemberStore
        + 'static,
{
    let bus = Arc::new(EventBus::new());
    let locks = Arc::new(ActorLocks::new());

    register_subscribers(
        &bus,
        SubscriberDeps {
            config: store.clone(),
            cases: store.clone(),
            admin_actions: store.clone(),
            members: store.clone(),
            platform: Arc::clone(&platform),
        },
    );

    let detection = Arc::new(DetectionOrchestrator::new(
        store.clone(),
        store.clone(),
        classifier,
        patience,
    ));
    let security = Arc::new(SecurityActionService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::clone(&bus),
        Arc::clone(&locks),
    ));
    let actuator = Arc::new(ModerationActuator::new(
        store.clone(),
        store.clone(),
        platform,
        bus,
        locks,
    ));

    Data {
        detection,
        security,
        actuator,
        config: store.clone(),
        members: store,
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Get Discord bot token from environment
    let token = std::env::var("DISCORD_TOKEN").expect(
        "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
    );

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Create our services with their dependencies.
    // This is the "composition root" where we wire everything together.

    // The platform gets its own HTTP client so it exists before the framework does.
    let http = Arc::new(serenity::Http::new(&token));
    let platform: Arc<dyn ModerationPlatform> = Arc::new(SerenityPlatform::new(http));

    // Optional AI classifier. Without a key, detection is heuristic-only.
    let classifier: Option<Arc<dyn SuspicionClassifier>> =
        match std::env::var("OPENROUTER_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => {
                let model = std::env::var("OPENROUTER_MODEL")
                    .unwrap_or_else(|_| DEFAULT_MODEL.to_string());
                tracing::info!(model = %model, "AI classifier enabled");
                Some(Arc::new(OpenRouterClassifier::new(api_key, model)) as Arc<dyn SuspicionClassifier>)
            }
            _ => {
                tracing::warn!("OPENROUTER_API_KEY not set, running heuristics only");
                None
            }
        };
    let patience = Duration::from_secs(
        std::env::var("CLASSIFIER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
    );

    let data = if std::env::var("SECURITY_STORAGE").as_deref() == Ok("memory") {
        tracing::warn!("Using in-memory security storage, nothing survives a restart");
        build_data(
            Arc::new(InMemorySecurityStore::new()),
            platform,
            classifier,
            patience,
        )
    } else {
        // Keep runtime databases in a dedicated folder so the repo root stays tidy.
        let db_path =
            std::env::var("SECURITY_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .expect("Failed to create data directory for SQLite files");
        }

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}?mode=rwc", db_path))
            .await
            .expect("Failed to connect to security DB");
        let store = SqliteSecurityStore::new(pool);
        store
            .migrate()
            .await
            .expect("Failed to migrate security DB");

        build_data(Arc::new(store), platform, classifier, patience)
    };

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================
    // Configure the poise framework with our commands and settings.

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required to read message content
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS; // Required for join events

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                discord::security::commands::security(),
                discord::security::commands::report(),
            ],
            // Event handler for messages and other events
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                tracing::info!("Bot is starting up...");

                // Register slash commands globally (can take up to an hour to propagate)
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                tracing::info!("Commands registered, bot is ready");
                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .expect("Error creating client");

    client.start().await.expect("Error running bot");
}

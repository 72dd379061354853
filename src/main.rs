use poise::CreateReply;
use serenity::all::{ClientBuilder, GatewayIntents};
use sqlx::SqlitePool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod db;
mod error;
mod features;
mod settings;
mod streaks;
mod violations;

use config::Config;
use features::mass_actions::AssetSnapshots;
use settings::SettingsStore;
use streaks::ChatStreakStorage;
use violations::ViolationCounters;

/// Shared state handed to every command and event handler.
pub(crate) struct Data {
    pub(crate) guild_settings: SettingsStore,
    pub(crate) user_settings: SettingsStore,
    pub(crate) streaks: ChatStreakStorage,
    /// Recent joins per user, feeding the join flood check.
    pub(crate) join_counters: ViolationCounters,
    /// Recent messages per author, feeding the spam check.
    pub(crate) message_counters: ViolationCounters,
    /// Recent role, channel, emoji and sticker changes per guild.
    pub(crate) guild_counters: ViolationCounters,
    pub(crate) known_assets: AssetSnapshots,
}

impl Data {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self {
            guild_settings: SettingsStore::guild(pool.clone()),
            user_settings: SettingsStore::user(pool.clone()),
            streaks: ChatStreakStorage::new(pool),
            join_counters: ViolationCounters::new(),
            message_counters: ViolationCounters::new(),
            guild_counters: ViolationCounters::new(),
            known_assets: AssetSnapshots::new(),
        }
    }
}

type Error = anyhow::Error;
type Context<'a> = poise::Context<'a, Data, Error>;

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            tracing::error!(
                command = %ctx.command().qualified_name,
                "command failed: {error:?}"
            );
            let reply = CreateReply::default()
                .content("Something went wrong, please try again later.")
                .ephemeral(true);
            if let Err(why) = ctx.send(reply).await {
                tracing::warn!("could not report command failure: {why}");
            }
        }
        poise::FrameworkError::EventHandler { error, event, .. } => {
            tracing::error!(event = event.snake_case_name(), "event handler failed: {error:?}");
        }
        other => {
            if let Err(why) = poise::builtins::on_error(other).await {
                tracing::error!("error while handling error: {why}");
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("akabot=info,poise=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    init_tracing();

    let config = Config::from_env()?;
    let pool = db::connect(&config).await?;
    let data = Data::new(pool.clone());

    // Member joins need the privileged members intent.
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_MEMBERS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: features::commands(),
            event_handler: |ctx, event, framework, data| {
                Box::pin(features::event_handler(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(|ctx, ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!(user = %ready.user.name, "connected and commands registered");
                Ok(data)
            })
        })
        .build();

    let mut client = ClientBuilder::new(&config.discord_token, intents)
        .framework(framework)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            shard_manager.shutdown_all().await;
        }
    });

    client.start().await?;
    db::close(pool).await;
    Ok(())
}

use std::str::FromStr;

use anyhow::Context as _;
use serenity::all::{Context as SerenityContext, FullEvent};

use crate::{Context, Data, Error};
use mass_actions::MassAction;

pub(crate) mod antiraid;
pub(crate) mod antispam;
pub(crate) mod mass_actions;
pub(crate) mod settings;
pub(crate) mod streaks;

/// Every slash command the bot registers, in the order Discord lists them.
pub(crate) fn commands() -> Vec<poise::Command<Data, Error>> {
    vec![
        antiraid::antiraid(),
        settings::settings(),
        settings::user_settings(),
        streaks::streak(),
        streaks::streaks(),
    ]
}

pub(crate) async fn event_handler(
    ctx: &SerenityContext,
    event: &FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        FullEvent::GuildMemberAddition { new_member } => {
            antiraid::on_member_join(ctx, data, new_member).await?;
        }
        FullEvent::GuildCreate { guild, .. } => {
            mass_actions::remember_guild(data, guild);
        }
        FullEvent::GuildEmojisUpdate {
            guild_id,
            current_state,
            ..
        } => {
            let removed = data.known_assets.replace(
                mass_actions::Asset::Emoji,
                guild_id.get(),
                current_state.keys().map(|id| id.get()),
            );
            mass_actions::on_actions(ctx, data, *guild_id, MassAction::EmojiDelete, removed)
                .await?;
        }
        FullEvent::GuildStickersUpdate {
            guild_id,
            current_state,
            ..
        } => {
            let removed = data.known_assets.replace(
                mass_actions::Asset::Sticker,
                guild_id.get(),
                current_state.keys().map(|id| id.get()),
            );
            mass_actions::on_actions(ctx, data, *guild_id, MassAction::StickerDelete, removed)
                .await?;
        }
        FullEvent::GuildRoleCreate { new, .. } => {
            mass_actions::on_actions(ctx, data, new.guild_id, MassAction::RoleCreate, 1).await?;
        }
        FullEvent::GuildRoleDelete { guild_id, .. } => {
            mass_actions::on_actions(ctx, data, *guild_id, MassAction::RoleDelete, 1).await?;
        }
        FullEvent::ChannelCreate { channel, .. } => {
            mass_actions::on_actions(ctx, data, channel.guild_id, MassAction::ChannelCreate, 1)
                .await?;
        }
        FullEvent::ChannelDelete { channel, .. } => {
            mass_actions::on_actions(ctx, data, channel.guild_id, MassAction::ChannelDelete, 1)
                .await?;
        }
        FullEvent::Message { new_message } => {
            if new_message.author.bot {
                return Ok(());
            }
            let Some(guild_id) = new_message.guild_id else {
                return Ok(());
            };
            antispam::on_message(ctx, data, guild_id, new_message).await?;
            streaks::on_message(ctx, data, guild_id, new_message).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Settings are stored as text; a value that does not parse falls back.
pub(crate) fn parse_or<T: FromStr>(value: &str, fallback: T) -> T {
    value.trim().parse().unwrap_or(fallback)
}

pub(crate) fn is_yes(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1"
    )
}

/// Counter kind for events that only count within one guild.
pub(crate) fn guild_kind(kind: &str, guild_id: u64) -> String {
    format!("{kind}:{guild_id}")
}

// Discord's limits on message content and embed descriptions.
pub(crate) const CONTENT_LIMIT: usize = 2000;
pub(crate) const EMBED_DESCRIPTION_LIMIT: usize = 4096;

// Room kept free for the "...and N more" line.
const MORE_ROOM: usize = 32;

/// Joins `lines` with newlines, stopping before the text would exceed `limit`
/// bytes and noting how many lines were left out.
pub(crate) fn join_within(lines: Vec<String>, limit: usize) -> String {
    let total = lines.len();
    let mut joined = String::new();
    for (shown, line) in lines.into_iter().enumerate() {
        let last = shown + 1 == total;
        let budget = if last { limit } else { limit.saturating_sub(MORE_ROOM) };
        let separator = usize::from(!joined.is_empty());
        if joined.len() + separator + line.len() > budget {
            if !joined.is_empty() {
                joined.push('\n');
            }
            joined.push_str(&format!("...and {} more", total - shown));
            break;
        }
        if separator == 1 {
            joined.push('\n');
        }
        joined.push_str(&line);
    }
    joined
}

pub(crate) fn guild_id(ctx: Context<'_>) -> anyhow::Result<u64> {
    ctx.guild_id()
        .map(|id| id.get())
        .context("command used outside of a guild")
}

pub(crate) const TIPS_ENABLED: &str = "tips_enabled";

const TIPS: &[&str] = &[
    "Use `/streaks leaderboard` to see who has been chatting the longest.",
    "Moderators can tune join flood protection with `/antiraid join_threshold`.",
    "Don't want these tips? Turn them off with `/user_settings tips`.",
];

/// Appends a tip unless the user has turned tips off.
pub(crate) async fn with_tip(data: &Data, user_id: u64, message: String) -> anyhow::Result<String> {
    let enabled = data.user_settings.get(user_id, TIPS_ENABLED, "true").await?;
    if !is_yes(&enabled) {
        return Ok(message);
    }
    let tip = TIPS[(chrono::Utc::now().timestamp() as usize) % TIPS.len()];
    Ok(format!("{message}\n-# Tip: {tip}"))
}

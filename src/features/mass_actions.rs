use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use serenity::all::{
    ChannelId, Colour, Context as SerenityContext, CreateEmbed, CreateMessage, Guild, GuildId,
    Timestamp,
};
use serenity::model::guild::audit_log::{
    Action, ChannelAction, EmojiAction, RoleAction, StickerAction,
};

use crate::features::parse_or;
use crate::violations::ViolationCounters;
use crate::Data;

/// Guild setting naming the channel that receives moderation reports.
pub(crate) const LOG_CHANNEL: &str = "log_channel";

/// Server-wide changes that are harmless alone and destructive in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MassAction {
    EmojiDelete,
    StickerDelete,
    RoleCreate,
    RoleDelete,
    ChannelCreate,
    ChannelDelete,
}

/// How quickly the changes piled up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pace {
    Burst,
    Sustained,
}

struct Window {
    pace: Pace,
    ttl_seconds: i64,
    limit: usize,
}

impl MassAction {
    fn kind(self) -> &'static str {
        match self {
            MassAction::EmojiDelete => "emoji_delete",
            MassAction::StickerDelete => "sticker_delete",
            MassAction::RoleCreate => "role_create",
            MassAction::RoleDelete => "role_delete",
            MassAction::ChannelCreate => "channel_create",
            MassAction::ChannelDelete => "channel_delete",
        }
    }

    fn windows(self) -> [Window; 2] {
        let burst_seconds = match self {
            MassAction::EmojiDelete | MassAction::StickerDelete => 2,
            _ => 3,
        };
        [
            Window {
                pace: Pace::Burst,
                ttl_seconds: burst_seconds,
                limit: 2,
            },
            Window {
                pace: Pace::Sustained,
                ttl_seconds: 30,
                limit: 5,
            },
        ]
    }

    fn doing(self) -> &'static str {
        match self {
            MassAction::EmojiDelete => "deleting emojis",
            MassAction::StickerDelete => "deleting stickers",
            MassAction::RoleCreate => "creating roles",
            MassAction::RoleDelete => "deleting roles",
            MassAction::ChannelCreate => "creating channels",
            MassAction::ChannelDelete => "deleting channels",
        }
    }

    fn audit_action(self) -> Action {
        match self {
            MassAction::EmojiDelete => Action::Emoji(EmojiAction::Delete),
            MassAction::StickerDelete => Action::Sticker(StickerAction::Delete),
            MassAction::RoleCreate => Action::Role(RoleAction::Create),
            MassAction::RoleDelete => Action::Role(RoleAction::Delete),
            MassAction::ChannelCreate => Action::Channel(ChannelAction::Create),
            MassAction::ChannelDelete => Action::Channel(ChannelAction::Delete),
        }
    }

    fn headline(self, pace: Pace) -> String {
        match pace {
            Pace::Burst => format!("A member is mass {} in this server", self.doing()),
            Pace::Sustained => format!(
                "A member is mass {} over a longer period of time in this server",
                self.doing()
            ),
        }
    }
}

/// Records `occurrences` of `action` in a guild and returns the paces whose
/// limit is now exceeded. A tripped pace starts counting from zero again, so
/// one wave is reported once per pace.
pub(crate) fn record(
    counters: &ViolationCounters,
    guild_id: u64,
    action: MassAction,
    occurrences: usize,
) -> crate::error::Result<Vec<Pace>> {
    let mut tripped = Vec::new();
    for window in action.windows() {
        let kind = format!("{}:{:?}", action.kind(), window.pace);
        for _ in 0..occurrences {
            counters.add_event(&kind, guild_id, window.ttl_seconds)?;
        }
        if counters.count(&kind, guild_id) > window.limit {
            counters.clear(&kind, guild_id);
            tripped.push(window.pace);
        }
    }
    Ok(tripped)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Asset {
    Emoji,
    Sticker,
}

/// Last seen emoji and sticker ids per guild. Gateway updates only carry the
/// new set, so deletions are found by diffing against this.
#[derive(Debug, Default)]
pub(crate) struct AssetSnapshots {
    known: Mutex<HashMap<(Asset, u64), HashSet<u64>>>,
}

impl AssetSnapshots {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores the current ids and returns how many known ones are gone.
    /// The first snapshot of a guild reports nothing.
    pub(crate) fn replace(
        &self,
        asset: Asset,
        guild_id: u64,
        current: impl IntoIterator<Item = u64>,
    ) -> usize {
        let current: HashSet<u64> = current.into_iter().collect();
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = known
            .get(&(asset, guild_id))
            .map_or(0, |previous| previous.difference(&current).count());
        known.insert((asset, guild_id), current);
        removed
    }
}

pub(crate) fn remember_guild(data: &Data, guild: &Guild) {
    let guild_id = guild.id.get();
    data.known_assets
        .replace(Asset::Emoji, guild_id, guild.emojis.keys().map(|id| id.get()));
    data.known_assets
        .replace(Asset::Sticker, guild_id, guild.stickers.keys().map(|id| id.get()));
}

pub(crate) async fn on_actions(
    ctx: &SerenityContext,
    data: &Data,
    guild_id: GuildId,
    action: MassAction,
    occurrences: usize,
) -> anyhow::Result<()> {
    if occurrences == 0 {
        return Ok(());
    }
    let tripped = record(&data.guild_counters, guild_id.get(), action, occurrences)?;
    for pace in tripped {
        report(ctx, data, guild_id, action, pace).await?;
    }
    Ok(())
}

/// Best effort: the member behind the latest audit log entry for `action`.
async fn find_actor(ctx: &SerenityContext, guild_id: GuildId, action: MassAction) -> Option<String> {
    match guild_id
        .audit_logs(ctx, Some(action.audit_action()), None, None, Some(1))
        .await
    {
        Ok(logs) => logs
            .entries
            .first()
            .map(|entry| format!("<@{}>", entry.user_id)),
        Err(why) => {
            tracing::debug!(guild_id = guild_id.get(), "could not read audit log: {why}");
            None
        }
    }
}

async fn report(
    ctx: &SerenityContext,
    data: &Data,
    guild_id: GuildId,
    action: MassAction,
    pace: Pace,
) -> anyhow::Result<()> {
    let actor = find_actor(ctx, guild_id, action).await;
    tracing::warn!(
        guild_id = guild_id.get(),
        ?action,
        ?pace,
        actor = actor.as_deref().unwrap_or("unknown"),
        "mass action detected"
    );

    let Some(channel) = data.guild_settings.find(guild_id.get(), LOG_CHANNEL).await? else {
        return Ok(());
    };
    let channel = parse_or(&channel, 0u64);
    if channel == 0 {
        tracing::debug!(guild_id = guild_id.get(), "log channel setting is not a channel id");
        return Ok(());
    }

    let embed = CreateEmbed::new()
        .title(action.headline(pace))
        .field("Done by", actor.unwrap_or_else(|| "Unknown".to_string()), false)
        .colour(Colour::RED)
        .timestamp(Timestamp::now());
    if let Err(why) = ChannelId::new(channel)
        .send_message(ctx, CreateMessage::new().embed(embed))
        .await
    {
        tracing::warn!(guild_id = guild_id.get(), channel, "could not send report: {why}");
    }
    Ok(())
}

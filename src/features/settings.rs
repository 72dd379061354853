use std::sync::LazyLock;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use poise::CreateReply;
use serenity::all::CreateEmbed;

use crate::features::{
    antiraid, antispam, guild_id, join_within, mass_actions, streaks as streak_feature,
    CONTENT_LIMIT, EMBED_DESCRIPTION_LIMIT, TIPS_ENABLED,
};
use crate::streaks::TIMEZONE_OFFSET;
use crate::{Context, Error};

/// Guild settings the features read, offered first by autocomplete.
const KNOWN_KEYS: &[&str] = &[
    antiraid::JOIN_THRESHOLD,
    antiraid::JOIN_THRESHOLD_PER,
    antiraid::NO_PFP,
    antiraid::NEW_ACCOUNT_DAYS,
    antispam::SPAM_THRESHOLD,
    antispam::SPAM_WINDOW,
    antispam::SPAM_DELETE,
    antispam::SPAM_TIMEOUT_MINUTES,
    mass_actions::LOG_CHANNEL,
    TIMEZONE_OFFSET,
];

// Discord shows at most 25 autocomplete choices.
const MAX_CHOICES: usize = 25;

fn fuzzy_search<'b, T>(
    needle: &'b str,
    haystack: impl Iterator<Item = T> + 'b,
    key: impl Fn(&T) -> &str,
) -> Vec<T> {
    static MATCHER: LazyLock<SkimMatcherV2> =
        LazyLock::new(|| SkimMatcherV2::default().smart_case().use_cache(true));
    if needle.is_empty() {
        return haystack.take(MAX_CHOICES).collect();
    }
    let mut scores: Vec<_> = haystack
        .filter_map(|s| MATCHER.fuzzy_match(key(&s), needle).map(|score| (score, s)))
        .collect();
    scores.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
    scores.truncate(MAX_CHOICES);
    scores.into_iter().map(|(_, s)| s).collect()
}

async fn autocomplete_key<'a>(
    ctx: Context<'_>,
    partial: &'a str,
) -> impl Iterator<Item = String> + 'a {
    let mut keys: Vec<String> = KNOWN_KEYS.iter().map(|key| key.to_string()).collect();
    if let Some(guild) = ctx.guild_id() {
        let stored = ctx
            .data()
            .guild_settings
            .entries(guild.get())
            .await
            .unwrap_or_default();
        for (key, _) in stored {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    fuzzy_search(partial, keys.into_iter(), |key| key.as_str()).into_iter()
}

async fn reply(ctx: Context<'_>, content: String) -> Result<(), Error> {
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    default_member_permissions = "MANAGE_GUILD",
    subcommands(
        "settings_get",
        "settings_set",
        "settings_unset",
        "settings_list",
        "settings_search"
    )
)]
pub(crate) async fn settings(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the value of a server setting
#[poise::command(slash_command, guild_only, rename = "get")]
pub(crate) async fn settings_get(
    ctx: Context<'_>,
    #[description = "Setting key"]
    #[autocomplete = autocomplete_key]
    key: String,
) -> Result<(), Error> {
    let value = ctx
        .data()
        .guild_settings
        .find(guild_id(ctx)?, &key)
        .await?;
    let content = match value {
        Some(value) => format!("`{key}` is `{value}`"),
        None => format!("`{key}` has not been set yet, its default applies."),
    };
    reply(ctx, content).await
}

/// Change a server setting
#[poise::command(slash_command, guild_only, rename = "set")]
pub(crate) async fn settings_set(
    ctx: Context<'_>,
    #[description = "Setting key"]
    #[autocomplete = autocomplete_key]
    key: String,
    #[description = "New value"] value: String,
) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    ctx.data().guild_settings.set(guild, &key, &value).await?;
    tracing::info!(
        guild_id = guild,
        user_id = ctx.author().id.get(),
        key = %key,
        value = %value,
        "setting changed"
    );
    reply(ctx, format!(":white_check_mark: `{key}` set to `{value}`")).await
}

/// Reset a server setting to its default
#[poise::command(slash_command, guild_only, rename = "unset")]
pub(crate) async fn settings_unset(
    ctx: Context<'_>,
    #[description = "Setting key"]
    #[autocomplete = autocomplete_key]
    key: String,
) -> Result<(), Error> {
    ctx.data().guild_settings.unset(guild_id(ctx)?, &key).await?;
    reply(ctx, format!(":white_check_mark: `{key}` reset to its default")).await
}

/// List every setting this server has
#[poise::command(slash_command, guild_only, rename = "list")]
pub(crate) async fn settings_list(ctx: Context<'_>) -> Result<(), Error> {
    let entries = ctx
        .data()
        .guild_settings
        .entries(guild_id(ctx)?)
        .await?;

    let description = if entries.is_empty() {
        "Nothing configured yet.".to_string()
    } else {
        let lines = entries
            .iter()
            .map(|(key, value)| format!("`{key}` = `{value}`"))
            .collect();
        join_within(lines, EMBED_DESCRIPTION_LIMIT)
    };

    let embed = CreateEmbed::new()
        .title("Server settings")
        .description(description);
    ctx.send(CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Find which servers have a setting with this value
#[poise::command(slash_command, owners_only, hide_in_help, rename = "search")]
pub(crate) async fn settings_search(
    ctx: Context<'_>,
    #[description = "Exact value to look for"] value: String,
) -> Result<(), Error> {
    let found = ctx.data().guild_settings.search_by_value(&value).await?;
    let content = if found.is_empty() {
        format!("No setting has the value `{value}`.")
    } else {
        let lines = found
            .iter()
            .map(|(guild, key)| format!("{guild}: `{key}`"))
            .collect();
        join_within(lines, CONTENT_LIMIT)
    };
    reply(ctx, content).await
}

#[poise::command(slash_command, subcommands("chat_streaks_alerts", "tips"))]
pub(crate) async fn user_settings(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Enable or disable chat streaks alerts
#[poise::command(slash_command)]
pub(crate) async fn chat_streaks_alerts(
    ctx: Context<'_>,
    #[description = "How notifications should be sent"] state: streak_feature::AlertsState,
) -> Result<(), Error> {
    ctx.data()
        .user_settings
        .set(
            ctx.author().id.get(),
            streak_feature::CHAT_STREAKS_ALERTS,
            state.as_setting(),
        )
        .await?;
    let state = match state {
        streak_feature::AlertsState::On => "enabled",
        streak_feature::AlertsState::OnlyWhenLost => "only sent when you lose a streak",
        streak_feature::AlertsState::Off => "disabled",
    };
    reply(ctx, format!("Chat streak alerts are now {state}.")).await
}

/// Enable or disable tips
#[poise::command(slash_command)]
pub(crate) async fn tips(
    ctx: Context<'_>,
    #[description = "Show tips under bot replies"] state: bool,
) -> Result<(), Error> {
    ctx.data()
        .user_settings
        .set(ctx.author().id.get(), TIPS_ENABLED, &state.to_string())
        .await?;
    let state = if state { "enabled" } else { "disabled" };
    reply(ctx, format!("Tips are now {state}.")).await
}

use std::time::Duration;

use poise::CreateReply;
use serenity::all::{Context as SerenityContext, GuildId, Message, User};

use crate::features::{guild_id, with_tip};
use crate::streaks::{server_today, StreakUpdate};
use crate::{Context, Data, Error};

pub(crate) const CHAT_STREAKS_ALERTS: &str = "chat_streaks_alerts";

const ALERT_LIFETIME: Duration = Duration::from_secs(3);
const LEADERBOARD_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub(crate) enum AlertsState {
    #[name = "on"]
    On,
    #[name = "only when lost"]
    OnlyWhenLost,
    #[name = "off"]
    Off,
}

impl AlertsState {
    pub(crate) fn as_setting(self) -> &'static str {
        match self {
            AlertsState::On => "on",
            AlertsState::OnlyWhenLost => "lost",
            AlertsState::Off => "off",
        }
    }

    fn from_setting(value: &str) -> Self {
        match value {
            "off" => AlertsState::Off,
            "lost" => AlertsState::OnlyWhenLost,
            _ => AlertsState::On,
        }
    }
}

/// The message to flash at a member after their streak changed, if any.
fn alert_for(update: StreakUpdate, alerts: AlertsState) -> Option<String> {
    match update {
        StreakUpdate::Expired { streak } if streak > 0 && alerts != AlertsState::Off => Some(
            format!("Your chat streak of {streak} days has expired :("),
        ),
        StreakUpdate::Updated { after, .. } if alerts == AlertsState::On => {
            Some(format!("Your chat streak is now {after} days!"))
        }
        _ => None,
    }
}

pub(crate) async fn on_message(
    ctx: &SerenityContext,
    data: &Data,
    guild_id: GuildId,
    message: &Message,
) -> anyhow::Result<()> {
    let author_id = message.author.id.get();
    let today = server_today(&data.guild_settings, guild_id.get()).await?;
    let update = data
        .streaks
        .set_streak(guild_id.get(), author_id, today)
        .await?;

    let alerts = data
        .user_settings
        .get(author_id, CHAT_STREAKS_ALERTS, AlertsState::On.as_setting())
        .await?;
    let Some(alert) = alert_for(update, AlertsState::from_setting(&alerts)) else {
        return Ok(());
    };

    let reply = message.reply(ctx, alert).await?;
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ALERT_LIFETIME).await;
        if let Err(why) = reply.delete(&ctx).await {
            tracing::debug!("could not delete streak alert: {why}");
        }
    });
    Ok(())
}

/// Get your current streak
#[poise::command(slash_command, guild_only)]
pub(crate) async fn streak(ctx: Context<'_>) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    let data = ctx.data();
    let today = server_today(&data.guild_settings, guild).await?;
    let days = data
        .streaks
        .get(guild, ctx.author().id.get())
        .await?
        .map_or(0, |streak| streak.current_days(today));

    let content = with_tip(
        data,
        ctx.author().id.get(),
        format!("Your current chat streak is {days} days."),
    )
    .await?;
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

#[poise::command(
    slash_command,
    guild_only,
    subcommands("streaks_streak", "streaks_reset", "streaks_leaderboard")
)]
pub(crate) async fn streaks(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Get someone's streak, to get yours, /streak.
#[poise::command(
    slash_command,
    guild_only,
    rename = "streak",
    required_permissions = "MANAGE_GUILD"
)]
pub(crate) async fn streaks_streak(
    ctx: Context<'_>,
    #[description = "The user to get the streak for"] user: User,
) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    let data = ctx.data();
    let today = server_today(&data.guild_settings, guild).await?;
    let days = data
        .streaks
        .get(guild, user.id.get())
        .await?
        .map_or(0, |streak| streak.current_days(today));

    let content = with_tip(
        data,
        ctx.author().id.get(),
        format!("<@{}> has a chat streak of {days} days.", user.id),
    )
    .await?;
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

/// Reset streak for a specific user
#[poise::command(
    slash_command,
    guild_only,
    rename = "reset",
    required_permissions = "MANAGE_GUILD"
)]
pub(crate) async fn streaks_reset(
    ctx: Context<'_>,
    #[description = "The user to reset the streak for"] user: User,
) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    let data = ctx.data();
    let today = server_today(&data.guild_settings, guild).await?;
    data.streaks.reset_streak(guild, user.id.get(), today).await?;
    tracing::info!(
        guild_id = guild,
        admin_id = ctx.author().id.get(),
        user_id = user.id.get(),
        "chat streak reset"
    );

    let content = with_tip(
        data,
        ctx.author().id.get(),
        format!("Reset the chat streak of <@{}>.", user.id),
    )
    .await?;
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

/// Get the chat streak leaderboard
#[poise::command(slash_command, guild_only, rename = "leaderboard")]
pub(crate) async fn streaks_leaderboard(ctx: Context<'_>) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    let data = ctx.data();
    let today = server_today(&data.guild_settings, guild).await?;
    let board = data
        .streaks
        .leaderboard(guild, today, LEADERBOARD_SIZE)
        .await?;

    let mut message = "**Chat streak leaderboard**".to_string();
    if board.is_empty() {
        message.push_str("\nNobody has a streak yet.");
    }
    for (position, (member, days)) in board.iter().enumerate() {
        message.push_str(&format!("\n{}. <@{member}> - {days} days", position + 1));
    }

    let content = with_tip(data, ctx.author().id.get(), message).await?;
    ctx.send(CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

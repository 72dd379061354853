use chrono::Utc;
use poise::CreateReply;
use serenity::all::{
    Colour, Context as SerenityContext, CreateEmbed, CreateMessage, GuildId, Member, Permissions,
};

use crate::features::{guild_id, guild_kind, is_yes, parse_or};
use crate::settings::SettingsStore;
use crate::violations::ViolationCounters;
use crate::{Context, Data, Error};

pub(crate) const JOIN: &str = "join";

pub(crate) const JOIN_THRESHOLD: &str = "antiraid_join_threshold";
pub(crate) const JOIN_THRESHOLD_PER: &str = "antiraid_join_threshold_per";
pub(crate) const NO_PFP: &str = "antiraid_no_pfp";
pub(crate) const NEW_ACCOUNT_DAYS: &str = "antiraid_new_account_days";

const DEFAULT_JOIN_THRESHOLD: usize = 5;
const DEFAULT_JOIN_WINDOW: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JoinPolicy {
    pub require_avatar: bool,
    pub min_account_age_days: i64,
    pub join_threshold: usize,
    pub join_window: i64,
}

impl JoinPolicy {
    pub(crate) async fn load(settings: &SettingsStore, guild_id: u64) -> anyhow::Result<Self> {
        let require_avatar = settings.get(guild_id, NO_PFP, "no").await?;
        let min_account_age_days = settings.get(guild_id, NEW_ACCOUNT_DAYS, "0").await?;
        let join_threshold = settings
            .get(guild_id, JOIN_THRESHOLD, &DEFAULT_JOIN_THRESHOLD.to_string())
            .await?;
        let join_window = settings
            .get(guild_id, JOIN_THRESHOLD_PER, &DEFAULT_JOIN_WINDOW.to_string())
            .await?;

        Ok(Self {
            require_avatar: is_yes(&require_avatar),
            min_account_age_days: parse_or(&min_account_age_days, 0),
            join_threshold: parse_or(&join_threshold, DEFAULT_JOIN_THRESHOLD),
            join_window: parse_or(&join_window, DEFAULT_JOIN_WINDOW),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinVerdict {
    Allow,
    NoAvatar,
    NewAccount { age_days: i64 },
    Flood { joins: usize },
}

/// Decides what to do with a member who just joined.
///
/// Joins are counted per guild. Only allowed joins are recorded, so a member
/// who keeps getting kicked stays over the threshold until their earlier joins
/// expire.
pub(crate) fn screen_join(
    policy: &JoinPolicy,
    counters: &ViolationCounters,
    guild_id: u64,
    user_id: u64,
    has_avatar: bool,
    account_age_days: i64,
) -> crate::error::Result<JoinVerdict> {
    if policy.require_avatar && !has_avatar {
        return Ok(JoinVerdict::NoAvatar);
    }

    if policy.min_account_age_days > 0 && account_age_days < policy.min_account_age_days {
        return Ok(JoinVerdict::NewAccount {
            age_days: account_age_days,
        });
    }

    let kind = guild_kind(JOIN, guild_id);
    let joins = counters.count(&kind, user_id);
    if joins > policy.join_threshold {
        return Ok(JoinVerdict::Flood { joins });
    }

    counters.add_event(&kind, user_id, policy.join_window)?;
    Ok(JoinVerdict::Allow)
}

pub(crate) async fn on_member_join(
    ctx: &SerenityContext,
    data: &Data,
    member: &Member,
) -> anyhow::Result<()> {
    let guild_id = member.guild_id.get();
    let user_id = member.user.id.get();

    let policy = JoinPolicy::load(&data.guild_settings, guild_id).await?;
    let created = member.user.id.created_at().unix_timestamp();
    let account_age_days = (Utc::now().timestamp() - created) / 86_400;

    let verdict = screen_join(
        &policy,
        &data.join_counters,
        guild_id,
        user_id,
        member.user.avatar.is_some(),
        account_age_days,
    )?;

    let (reason, notice) = match verdict {
        JoinVerdict::Allow => return Ok(()),
        JoinVerdict::NoAvatar => (
            "No profile picture",
            "You have been kicked from a server for not having a profile picture. \
             They have the bot set up like this."
                .to_string(),
        ),
        JoinVerdict::NewAccount { age_days } => (
            "New account",
            format!(
                "Your account needs to be at least {} days old to join this server. \
                 Your account is {age_days} days old.",
                policy.min_account_age_days
            ),
        ),
        JoinVerdict::Flood { .. } => (
            "Suspected raiding",
            "You have been kicked from the server for suspected raiding. \
             If you believe this was a mistake, try rejoining in a few minutes."
                .to_string(),
        ),
    };

    tracing::info!(guild_id, user_id, ?verdict, "kicking member");
    kick(ctx, member, reason, &notice).await;
    Ok(())
}

/// The bot's own permissions in a guild, from the cache.
fn bot_permissions(ctx: &SerenityContext, guild_id: GuildId) -> Option<Permissions> {
    let bot_id = ctx.cache.current_user().id;
    let guild = ctx.cache.guild(guild_id)?;
    let bot = guild.members.get(&bot_id)?;
    Some(guild.member_permissions(bot))
}

/// Unknown permissions count as missing.
fn can_kick(permissions: Option<Permissions>) -> bool {
    permissions.is_some_and(|permissions| permissions.kick_members())
}

async fn kick(ctx: &SerenityContext, member: &Member, reason: &str, notice: &str) {
    let user_id = member.user.id.get();
    if !can_kick(bot_permissions(ctx, member.guild_id)) {
        tracing::warn!(
            guild_id = member.guild_id.get(),
            user_id,
            reason,
            "not kicking member, missing the kick members permission"
        );
        return;
    }

    if let Err(why) = member
        .user
        .direct_message(ctx, CreateMessage::new().content(notice))
        .await
    {
        tracing::debug!(user_id, "could not DM member before kicking: {why}");
    }

    if let Err(why) = member.kick_with_reason(ctx, reason).await {
        tracing::warn!(
            guild_id = member.guild_id.get(),
            user_id,
            "could not kick member: {why}"
        );
    }
}

#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    default_member_permissions = "MANAGE_GUILD",
    subcommands("join_threshold", "list")
)]
pub(crate) async fn antiraid(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Set the join threshold for the antiraid system
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub(crate) async fn join_threshold(
    ctx: Context<'_>,
    #[description = "The number of people joining..."]
    #[min = 1]
    people: u32,
    #[description = "...per the number of seconds to check"]
    #[min = 1]
    per: u32,
) -> Result<(), Error> {
    let guild = guild_id(ctx)?;
    let settings = &ctx.data().guild_settings;
    settings
        .set(guild, JOIN_THRESHOLD, &people.to_string())
        .await?;
    settings
        .set(guild, JOIN_THRESHOLD_PER, &per.to_string())
        .await?;

    ctx.send(
        CreateReply::default()
            .content(format!(
                "Successfully set the join threshold to {people} per {per} seconds."
            ))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// List the antiraid settings
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub(crate) async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let policy = JoinPolicy::load(&ctx.data().guild_settings, guild_id(ctx)?).await?;

    let account_age = match policy.min_account_age_days {
        days if days > 0 => format!("At least {days} days old"),
        _ => "Off".to_string(),
    };

    let embed = CreateEmbed::new()
        .title("Antiraid settings")
        .colour(Colour::BLURPLE)
        .field(
            "Join threshold",
            format!(
                "{} per {} seconds",
                policy.join_threshold, policy.join_window
            ),
            false,
        )
        .field(
            "Kick members without a profile picture",
            if policy.require_avatar { "Yes" } else { "No" },
            false,
        )
        .field("Minimum account age", account_age, false);

    ctx.send(CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn policy() -> JoinPolicy {
        JoinPolicy {
            require_avatar: false,
            min_account_age_days: 0,
            join_threshold: 2,
            join_window: 60,
        }
    }

    #[tokio::test]
    async fn policy_defaults_are_materialized() {
        let settings = SettingsStore::guild(memory_pool().await);
        let policy = JoinPolicy::load(&settings, 100).await.unwrap();

        assert_eq!(
            policy,
            JoinPolicy {
                require_avatar: false,
                min_account_age_days: 0,
                join_threshold: 5,
                join_window: 60,
            }
        );
        assert_eq!(
            settings.find(100, JOIN_THRESHOLD).await.unwrap().as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn policy_follows_moderator_changes() {
        let settings = SettingsStore::guild(memory_pool().await);
        settings.set(100, JOIN_THRESHOLD, "10").await.unwrap();
        settings.set(100, NO_PFP, "yes").await.unwrap();
        settings.set(100, NEW_ACCOUNT_DAYS, "garbage").await.unwrap();

        let policy = JoinPolicy::load(&settings, 100).await.unwrap();
        assert_eq!(policy.join_threshold, 10);
        assert!(policy.require_avatar);
        assert_eq!(policy.min_account_age_days, 0);
    }

    #[tokio::test]
    async fn repeated_joins_trip_the_flood_check() {
        let counters = ViolationCounters::new();
        let policy = policy();

        for _ in 0..3 {
            assert_eq!(
                screen_join(&policy, &counters, 9, 1, true, 100).unwrap(),
                JoinVerdict::Allow
            );
        }
        assert_eq!(
            screen_join(&policy, &counters, 9, 1, true, 100).unwrap(),
            JoinVerdict::Flood { joins: 3 }
        );
        assert_eq!(
            screen_join(&policy, &counters, 9, 2, true, 100).unwrap(),
            JoinVerdict::Allow
        );
    }

    #[test]
    fn avatar_and_age_checks_run_before_counting() {
        let counters = ViolationCounters::new();
        let policy = JoinPolicy {
            require_avatar: true,
            min_account_age_days: 7,
            ..policy()
        };

        assert_eq!(
            screen_join(&policy, &counters, 9, 1, false, 100).unwrap(),
            JoinVerdict::NoAvatar
        );
        assert_eq!(
            screen_join(&policy, &counters, 9, 1, true, 3).unwrap(),
            JoinVerdict::NewAccount { age_days: 3 }
        );
        assert_eq!(counters.count(&guild_kind(JOIN, 9), 1), 0);
    }

    #[test]
    fn negative_window_is_reported() {
        let counters = ViolationCounters::new();
        let policy = JoinPolicy {
            join_window: -1,
            ..policy()
        };
        assert!(screen_join(&policy, &counters, 9, 1, true, 100).is_err());
        assert_eq!(counters.count(&guild_kind(JOIN, 9), 1), 0);
    }

    #[test]
    fn joins_in_one_guild_do_not_count_in_another() {
        let counters = ViolationCounters::new();
        let policy = policy();

        for _ in 0..3 {
            screen_join(&policy, &counters, 100, 1, true, 100).unwrap();
        }
        assert_eq!(
            screen_join(&policy, &counters, 200, 1, true, 100).unwrap(),
            JoinVerdict::Allow
        );
        assert_eq!(
            screen_join(&policy, &counters, 100, 1, true, 100).unwrap(),
            JoinVerdict::Flood { joins: 3 }
        );
    }

    #[test]
    fn kicking_needs_the_kick_permission() {
        assert!(!can_kick(None));
        assert!(!can_kick(Some(Permissions::empty())));
        assert!(!can_kick(Some(Permissions::BAN_MEMBERS)));
        assert!(can_kick(Some(Permissions::KICK_MEMBERS)));
        assert!(can_kick(Some(Permissions::KICK_MEMBERS | Permissions::SEND_MESSAGES)));
    }
}

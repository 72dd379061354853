use chrono::Utc;
use serenity::all::{Context as SerenityContext, EditMember, GuildId, Message, Timestamp};

use crate::features::{guild_kind, is_yes, parse_or};
use crate::settings::SettingsStore;
use crate::violations::ViolationCounters;
use crate::Data;

pub(crate) const MESSAGE: &str = "message";

pub(crate) const SPAM_THRESHOLD: &str = "antispam_threshold";
pub(crate) const SPAM_WINDOW: &str = "antispam_window";
pub(crate) const SPAM_DELETE: &str = "antispam_delete";
pub(crate) const SPAM_TIMEOUT_MINUTES: &str = "antispam_timeout_minutes";

const DEFAULT_THRESHOLD: usize = 4;
const DEFAULT_WINDOW: i64 = 3;
// Discord refuses timeouts longer than 28 days.
const MAX_TIMEOUT_MINUTES: i64 = 28 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpamPolicy {
    pub threshold: usize,
    pub window: i64,
    pub delete: bool,
    pub timeout_minutes: i64,
}

impl SpamPolicy {
    pub(crate) async fn load(settings: &SettingsStore, guild_id: u64) -> anyhow::Result<Self> {
        let threshold = settings
            .get(guild_id, SPAM_THRESHOLD, &DEFAULT_THRESHOLD.to_string())
            .await?;
        let window = settings
            .get(guild_id, SPAM_WINDOW, &DEFAULT_WINDOW.to_string())
            .await?;
        let delete = settings.get(guild_id, SPAM_DELETE, "no").await?;
        let timeout_minutes = settings.get(guild_id, SPAM_TIMEOUT_MINUTES, "0").await?;

        Ok(Self {
            threshold: parse_or(&threshold, DEFAULT_THRESHOLD),
            window: parse_or(&window, DEFAULT_WINDOW),
            delete: is_yes(&delete),
            timeout_minutes: parse_or(&timeout_minutes, 0).clamp(0, MAX_TIMEOUT_MINUTES),
        })
    }

    fn acts(&self) -> bool {
        self.delete || self.timeout_minutes > 0
    }

    /// Unix time the timeout started at `now` ends, if timeouts are on.
    fn timeout_until(&self, now: i64) -> Option<i64> {
        let minutes = self.timeout_minutes.clamp(0, MAX_TIMEOUT_MINUTES);
        (minutes > 0).then(|| now.saturating_add(minutes * 60))
    }
}

/// Records a message and returns how many the author sent in this guild
/// inside the window if that is over the threshold. Tripping the check forgets
/// the author's history there so one burst triggers one action.
pub(crate) fn check_message(
    policy: &SpamPolicy,
    counters: &ViolationCounters,
    guild_id: u64,
    author_id: u64,
) -> crate::error::Result<Option<usize>> {
    let kind = guild_kind(MESSAGE, guild_id);
    counters.add_event(&kind, author_id, policy.window)?;
    let sent = counters.count(&kind, author_id);
    if sent <= policy.threshold {
        return Ok(None);
    }
    counters.clear(&kind, author_id);
    Ok(Some(sent))
}

pub(crate) async fn on_message(
    ctx: &SerenityContext,
    data: &Data,
    guild_id: GuildId,
    message: &Message,
) -> anyhow::Result<()> {
    let policy = SpamPolicy::load(&data.guild_settings, guild_id.get()).await?;
    if !policy.acts() {
        return Ok(());
    }

    let author_id = message.author.id.get();
    let span = data
        .message_counters
        .span(&guild_kind(MESSAGE, guild_id.get()), author_id);
    let Some(sent) = check_message(&policy, &data.message_counters, guild_id.get(), author_id)?
    else {
        return Ok(());
    };
    tracing::info!(
        guild_id = guild_id.get(),
        author_id,
        sent,
        ?span,
        "message flood detected"
    );

    if policy.delete {
        if let Err(why) = message.delete(ctx).await {
            tracing::warn!(author_id, "could not delete spam message: {why}");
        }
    }

    if let Some(until) = policy.timeout_until(Utc::now().timestamp()) {
        let until = Timestamp::from_unix_timestamp(until)
            .map_err(|_| anyhow::anyhow!("timeout end {until} is out of range"))?;
        let edit = EditMember::new()
            .disable_communication_until_datetime(until)
            .audit_log_reason("Message spam");
        if let Err(why) = guild_id.edit_member(ctx, message.author.id, edit).await {
            tracing::warn!(author_id, "could not time out spammer: {why}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn policy() -> SpamPolicy {
        SpamPolicy {
            threshold: 4,
            window: 3,
            delete: true,
            timeout_minutes: 0,
        }
    }

    #[tokio::test]
    async fn defaults_do_nothing() {
        let settings = SettingsStore::guild(memory_pool().await);
        let policy = SpamPolicy::load(&settings, 1).await.unwrap();
        assert_eq!(policy.threshold, DEFAULT_THRESHOLD);
        assert_eq!(policy.window, DEFAULT_WINDOW);
        assert!(!policy.acts());

        settings.set(1, SPAM_TIMEOUT_MINUTES, "10").await.unwrap();
        assert!(SpamPolicy::load(&settings, 1).await.unwrap().acts());
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_message_in_window_trips() {
        let counters = ViolationCounters::new();
        for _ in 0..4 {
            assert_eq!(check_message(&policy(), &counters, 7, 1).unwrap(), None);
        }
        assert_eq!(check_message(&policy(), &counters, 7, 1).unwrap(), Some(5));
        assert_eq!(counters.count(&guild_kind(MESSAGE, 7), 1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_messages_never_trip() {
        let counters = ViolationCounters::new();
        for _ in 0..20 {
            assert_eq!(check_message(&policy(), &counters, 7, 1).unwrap(), None);
            tokio::time::advance(std::time::Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn guilds_do_not_share_message_history() {
        let counters = ViolationCounters::new();
        for _ in 0..3 {
            assert_eq!(check_message(&policy(), &counters, 100, 77).unwrap(), None);
        }
        for _ in 0..2 {
            assert_eq!(check_message(&policy(), &counters, 200, 77).unwrap(), None);
        }
        assert_eq!(counters.count(&guild_kind(MESSAGE, 100), 77), 3);
        assert_eq!(counters.count(&guild_kind(MESSAGE, 200), 77), 2);

        assert_eq!(check_message(&policy(), &counters, 100, 77).unwrap(), None);
        assert_eq!(check_message(&policy(), &counters, 100, 77).unwrap(), Some(5));
        assert_eq!(counters.count(&guild_kind(MESSAGE, 200), 77), 2);
    }

    #[tokio::test]
    async fn timeout_is_clamped_to_what_discord_accepts() {
        let settings = SettingsStore::guild(memory_pool().await);

        settings
            .set(1, SPAM_TIMEOUT_MINUTES, "999999999999999999")
            .await
            .unwrap();
        let policy = SpamPolicy::load(&settings, 1).await.unwrap();
        assert_eq!(policy.timeout_minutes, MAX_TIMEOUT_MINUTES);
        assert_eq!(policy.timeout_until(1_000), Some(1_000 + 28 * 24 * 60 * 60));

        settings.set(1, SPAM_TIMEOUT_MINUTES, "-5").await.unwrap();
        let policy = SpamPolicy::load(&settings, 1).await.unwrap();
        assert_eq!(policy.timeout_minutes, 0);
        assert_eq!(policy.timeout_until(1_000), None);
    }

    #[test]
    fn timeout_math_never_overflows() {
        let policy = SpamPolicy {
            timeout_minutes: i64::MAX,
            ..policy()
        };
        assert_eq!(policy.timeout_until(i64::MAX - 10), Some(i64::MAX));
    }
}

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::settings::SettingsStore;

pub(crate) const TIMEZONE_OFFSET: &str = "timezone_offset";

const SECONDS_PER_DAY: i64 = 86_400;
const MAX_ATTEMPTS: usize = 5;

/// How long after the last counted day a streak survives. One day plus an
/// hour of slack for offset changes.
fn grace_period() -> Duration {
    Duration::hours(25)
}

/// Start of the guild's current local day, as a UTC instant.
///
/// `tz_offset_hours` is the guild's offset from UTC and may be fractional.
pub fn server_midnight(now: DateTime<Utc>, tz_offset_hours: f64) -> DateTime<Utc> {
    let offset = (tz_offset_hours * 3600.0).round() as i64;
    let local = now.timestamp() + offset;
    let midnight = local.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY - offset;
    DateTime::from_timestamp(midnight, 0).unwrap_or(now)
}

/// The guild's current day boundary, using its `timezone_offset` setting.
/// A malformed offset counts as UTC.
pub async fn server_today(settings: &SettingsStore, guild_id: u64) -> Result<DateTime<Utc>> {
    let offset = settings.get(guild_id, TIMEZONE_OFFSET, "0").await?;
    let offset = offset.trim().parse::<f64>().unwrap_or_else(|_| {
        tracing::warn!(guild_id, offset = %offset, "ignoring unparsable timezone offset");
        0.0
    });
    Ok(server_midnight(Utc::now(), offset))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct ChatStreak {
    pub last_message: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
}

impl ChatStreak {
    fn starting(today: DateTime<Utc>) -> Self {
        Self {
            last_message: today,
            start_time: today,
        }
    }

    /// Whole days between the first and the latest active day.
    pub fn days(&self) -> i64 {
        (self.last_message - self.start_time).num_days().max(0)
    }

    /// The streak as it stands on `today`, zero if it has lapsed.
    pub fn current_days(&self, today: DateTime<Utc>) -> i64 {
        if today - self.last_message > grace_period() {
            0
        } else {
            self.days()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakUpdate {
    /// First message ever seen from this member in this guild.
    Started,
    /// The previous streak lapsed; a new one starts today.
    Expired { streak: i64 },
    /// Today is a new day of an unbroken streak.
    Updated { before: i64, after: i64 },
    /// Already counted today.
    Stayed { streak: i64 },
}

/// Applies one message on `today` to a member's streak.
pub fn advance(previous: Option<ChatStreak>, today: DateTime<Utc>) -> (StreakUpdate, ChatStreak) {
    let Some(previous) = previous else {
        return (StreakUpdate::Started, ChatStreak::starting(today));
    };

    if today - previous.last_message > grace_period() {
        return (
            StreakUpdate::Expired {
                streak: previous.days(),
            },
            ChatStreak::starting(today),
        );
    }

    let before = previous.days();
    let next = ChatStreak {
        last_message: today,
        start_time: previous.start_time,
    };
    let after = next.days();

    if before != after {
        (StreakUpdate::Updated { before, after }, next)
    } else {
        (StreakUpdate::Stayed { streak: after }, next)
    }
}

/// Per-guild, per-member streak rows.
#[derive(Debug, Clone)]
pub struct ChatStreakStorage {
    pool: SqlitePool,
}

impl ChatStreakStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, guild_id: u64, member_id: u64) -> Result<Option<ChatStreak>> {
        let mut connection = self.pool.acquire().await?;
        let streak = sqlx::query_as::<_, ChatStreak>(
            "SELECT last_message, start_time FROM chat_streaks WHERE guild_id = ? AND member_id = ?",
        )
        .bind(guild_id as i64)
        .bind(member_id as i64)
        .fetch_optional(&mut *connection)
        .await?;
        Ok(streak)
    }

    /// Records activity on `today` and reports how the streak changed.
    ///
    /// Each write only applies if the row still holds what was read, and a
    /// lost race rereads. Every statement runs on its own, so no read
    /// transaction ever has to upgrade to a write.
    pub async fn set_streak(
        &self,
        guild_id: u64,
        member_id: u64,
        today: DateTime<Utc>,
    ) -> Result<StreakUpdate> {
        let mut connection = self.pool.acquire().await?;
        for _ in 0..MAX_ATTEMPTS {
            let previous = sqlx::query_as::<_, ChatStreak>(
                "SELECT last_message, start_time FROM chat_streaks WHERE guild_id = ? AND member_id = ?",
            )
            .bind(guild_id as i64)
            .bind(member_id as i64)
            .fetch_optional(&mut *connection)
            .await?;

            let (update, next) = advance(previous, today);
            if previous == Some(next) {
                return Ok(update);
            }
            if Self::replace(&mut *connection, guild_id, member_id, previous, next).await? {
                return Ok(update);
            }
            tracing::debug!(guild_id, member_id, "chat streak changed underneath, retrying");
        }
        Err(Error::Contended(format!(
            "chat streak of member {member_id} in guild {guild_id}"
        )))
    }

    /// Writes `next` if the row still matches `expected`. Returns whether it did.
    async fn replace(
        connection: &mut sqlx::SqliteConnection,
        guild_id: u64,
        member_id: u64,
        expected: Option<ChatStreak>,
        next: ChatStreak,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO chat_streaks (guild_id, member_id, last_message, start_time)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (guild_id, member_id) DO NOTHING",
                )
                .bind(guild_id as i64)
                .bind(member_id as i64)
                .bind(next.last_message)
                .bind(next.start_time)
                .execute(connection)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE chat_streaks SET last_message = ?, start_time = ?
                     WHERE guild_id = ? AND member_id = ? AND last_message = ? AND start_time = ?",
                )
                .bind(next.last_message)
                .bind(next.start_time)
                .bind(guild_id as i64)
                .bind(member_id as i64)
                .bind(expected.last_message)
                .bind(expected.start_time)
                .execute(connection)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    pub async fn reset_streak(
        &self,
        guild_id: u64,
        member_id: u64,
        today: DateTime<Utc>,
    ) -> Result<()> {
        let mut connection = self.pool.acquire().await?;
        let streak = ChatStreak::starting(today);
        sqlx::query(
            "INSERT INTO chat_streaks (guild_id, member_id, last_message, start_time)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (guild_id, member_id) DO UPDATE
             SET last_message = excluded.last_message, start_time = excluded.start_time",
        )
        .bind(guild_id as i64)
        .bind(member_id as i64)
        .bind(streak.last_message)
        .bind(streak.start_time)
        .execute(&mut *connection)
        .await?;
        Ok(())
    }

    /// Members with the longest live streaks in a guild, longest first.
    pub async fn leaderboard(
        &self,
        guild_id: u64,
        today: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(u64, i64)>> {
        let mut connection = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, (i64, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT member_id, last_message, start_time FROM chat_streaks WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_all(&mut *connection)
        .await?;

        let mut board: Vec<_> = rows
            .into_iter()
            .map(|(member_id, last_message, start_time)| {
                let streak = ChatStreak {
                    last_message,
                    start_time,
                };
                (member_id as u64, streak.current_days(today))
            })
            .filter(|(_, days)| *days > 0)
            .collect();
        board.sort_by(|(a_id, a_days), (b_id, b_days)| b_days.cmp(a_days).then(a_id.cmp(b_id)));
        board.truncate(limit);
        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::{file_pool, memory_pool};

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, n, 0, 0, 0).unwrap()
    }

    #[test]
    fn midnight_in_utc() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 17, 42, 9).unwrap();
        assert_eq!(server_midnight(now, 0.0), day(5));
    }

    #[test]
    fn midnight_with_positive_offset_can_be_the_next_day() {
        // 23:00 UTC is already 01:00 on the 6th at UTC+2.
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 23, 0, 0).unwrap();
        let midnight = server_midnight(now, 2.0);
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 3, 5, 22, 0, 0).unwrap());
    }

    #[test]
    fn midnight_with_fractional_negative_offset() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 2, 0, 0).unwrap();
        // Still the 4th at UTC-3:30; that local midnight is 03:30 UTC on the 4th.
        let midnight = server_midnight(now, -3.5);
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 3, 4, 3, 30, 0).unwrap());
    }

    #[test]
    fn first_message_starts_a_streak() {
        let (update, streak) = advance(None, day(1));
        assert_eq!(update, StreakUpdate::Started);
        assert_eq!(streak.days(), 0);
    }

    #[test]
    fn same_day_stays() {
        let (_, streak) = advance(None, day(1));
        let (update, _) = advance(Some(streak), day(1));
        assert_eq!(update, StreakUpdate::Stayed { streak: 0 });
    }

    #[test]
    fn next_day_increments() {
        let (_, streak) = advance(None, day(1));
        let (update, streak) = advance(Some(streak), day(2));
        assert_eq!(update, StreakUpdate::Updated { before: 0, after: 1 });
        let (update, _) = advance(Some(streak), day(3));
        assert_eq!(update, StreakUpdate::Updated { before: 1, after: 2 });
    }

    #[test]
    fn skipping_a_day_expires() {
        let streak = ChatStreak {
            start_time: day(1),
            last_message: day(4),
        };
        let (update, next) = advance(Some(streak), day(6));
        assert_eq!(update, StreakUpdate::Expired { streak: 3 });
        assert_eq!(next, ChatStreak::starting(day(6)));
    }

    #[test]
    fn current_days_is_zero_once_lapsed() {
        let streak = ChatStreak {
            start_time: day(1),
            last_message: day(4),
        };
        assert_eq!(streak.current_days(day(5)), 3);
        assert_eq!(streak.current_days(day(6)), 0);
    }

    #[tokio::test]
    async fn storage_tracks_consecutive_days() {
        let storage = ChatStreakStorage::new(memory_pool().await);

        assert_eq!(
            storage.set_streak(1, 10, day(1)).await.unwrap(),
            StreakUpdate::Started
        );
        assert_eq!(
            storage.set_streak(1, 10, day(2)).await.unwrap(),
            StreakUpdate::Updated { before: 0, after: 1 }
        );
        assert_eq!(
            storage.set_streak(1, 10, day(2)).await.unwrap(),
            StreakUpdate::Stayed { streak: 1 }
        );
        assert_eq!(
            storage.set_streak(1, 10, day(5)).await.unwrap(),
            StreakUpdate::Expired { streak: 1 }
        );
        assert_eq!(
            storage.get(1, 10).await.unwrap(),
            Some(ChatStreak::starting(day(5)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_count_a_day_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChatStreakStorage::new(file_pool(&dir, 5).await);
        storage.set_streak(1, 10, day(1)).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let storage = storage.clone();
            tasks.spawn(async move { storage.set_streak(1, 10, day(2)).await });
        }

        let mut updates = Vec::new();
        while let Some(result) = tasks.join_next().await {
            updates.push(result.unwrap().unwrap());
        }
        let grew = updates
            .iter()
            .filter(|update| **update == StreakUpdate::Updated { before: 0, after: 1 })
            .count();
        assert_eq!(grew, 1);
        assert_eq!(
            updates
                .iter()
                .filter(|update| **update == StreakUpdate::Stayed { streak: 1 })
                .count(),
            31
        );
        assert_eq!(storage.get(1, 10).await.unwrap().map(|s| s.days()), Some(1));
    }

    #[tokio::test]
    async fn reset_restarts_from_today() {
        let storage = ChatStreakStorage::new(memory_pool().await);
        storage.set_streak(1, 10, day(1)).await.unwrap();
        storage.set_streak(1, 10, day(2)).await.unwrap();

        storage.reset_streak(1, 10, day(2)).await.unwrap();
        assert_eq!(storage.get(1, 10).await.unwrap().map(|s| s.days()), Some(0));

        storage.reset_streak(1, 11, day(2)).await.unwrap();
        assert!(storage.get(1, 11).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn leaderboard_orders_live_streaks() {
        let storage = ChatStreakStorage::new(memory_pool().await);
        for member in [10, 11, 12] {
            storage.set_streak(1, member, day(1)).await.unwrap();
        }
        storage.set_streak(1, 10, day(2)).await.unwrap();
        storage.set_streak(1, 11, day(2)).await.unwrap();
        storage.set_streak(1, 11, day(3)).await.unwrap();
        storage.set_streak(2, 13, day(1)).await.unwrap();
        storage.set_streak(2, 13, day(3)).await.unwrap();

        let board = storage.leaderboard(1, day(3), 10).await.unwrap();
        assert_eq!(board, vec![(11, 2), (10, 1)]);

        let board = storage.leaderboard(1, day(3), 1).await.unwrap();
        assert_eq!(board, vec![(11, 2)]);
    }

    #[tokio::test]
    async fn server_today_reads_the_offset_setting() {
        let settings = SettingsStore::guild(memory_pool().await);
        let today = server_today(&settings, 1).await.unwrap();
        assert_eq!(today.timestamp() % SECONDS_PER_DAY, 0);
        assert_eq!(
            settings.find(1, TIMEZONE_OFFSET).await.unwrap().as_deref(),
            Some("0")
        );

        settings.set(1, TIMEZONE_OFFSET, "not a number").await.unwrap();
        let today = server_today(&settings, 1).await.unwrap();
        assert_eq!(today.timestamp() % SECONDS_PER_DAY, 0);
    }
}

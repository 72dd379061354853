use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct ViolationEvent {
    kind: String,
    subject_id: u64,
    recorded_at: Instant,
    expires_at: Instant,
}

/// Counts recent events per `(kind, subject)`, each event expiring on its own
/// schedule.
///
/// Events carry their own TTL rather than sharing one window, so a guild can
/// change its window without invalidating what was already recorded. Expired
/// events are only dropped when [`count`](Self::count) sweeps; nothing runs in
/// the background. State lives in memory and resets on restart.
#[derive(Debug, Default)]
pub struct ViolationCounters {
    events: Mutex<Vec<ViolationEvent>>,
}

impl ViolationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ViolationEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one occurrence that counts until `ttl_seconds` from now.
    pub fn add_event(&self, kind: &str, subject_id: u64, ttl_seconds: i64) -> Result<()> {
        let ttl = u64::try_from(ttl_seconds).map_err(|_| {
            Error::InvalidArgument(format!(
                "ttl_seconds must be non-negative, got {ttl_seconds}"
            ))
        })?;

        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(ttl))
            .ok_or_else(|| Error::InvalidArgument(format!("ttl_seconds {ttl} is too large")))?;

        self.lock().push(ViolationEvent {
            kind: kind.to_string(),
            subject_id,
            recorded_at: now,
            expires_at,
        });
        Ok(())
    }

    /// Drops every expired event, of any kind, then counts the live ones for
    /// `(kind, subject_id)`.
    pub fn count(&self, kind: &str, subject_id: u64) -> usize {
        let now = Instant::now();
        let mut events = self.lock();
        events.retain(|event| now < event.expires_at);
        events
            .iter()
            .filter(|event| event.kind == kind && event.subject_id == subject_id)
            .count()
    }

    /// How long ago the oldest still-live event for `(kind, subject_id)` was
    /// recorded. Does not sweep.
    pub fn span(&self, kind: &str, subject_id: u64) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|event| event.kind == kind && event.subject_id == subject_id)
            .filter(|event| now < event.expires_at)
            .map(|event| event.recorded_at)
            .min()
            .map(|oldest| now.saturating_duration_since(oldest))
    }

    /// Forgets everything recorded for `(kind, subject_id)`.
    pub fn clear(&self, kind: &str, subject_id: u64) {
        self.lock()
            .retain(|event| !(event.kind == kind && event.subject_id == subject_id));
    }
}

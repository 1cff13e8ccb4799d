use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use uuid::Uuid;

/// Hands out the session id used to scope cost accounting. A session ends
/// after a stretch of inactivity and the next request starts a new one.
pub struct SessionTracker {
    idle_limit: Duration,
    state: Mutex<Session>,
}

struct Session {
    id: String,
    last_active: DateTime<Utc>,
}

impl SessionTracker {
    pub fn new(idle_minutes: i64) -> Self {
        Self::starting_at(idle_minutes, Utc::now())
    }

    fn starting_at(idle_minutes: i64, now: DateTime<Utc>) -> Self {
        Self {
            idle_limit: Duration::minutes(idle_minutes.max(1)),
            state: Mutex::new(Session {
                id: Uuid::new_v4().to_string(),
                last_active: now,
            }),
        }
    }

    /// Current session id, marking the session active.
    pub fn session_id(&self) -> String {
        self.session_id_at(Utc::now())
    }

    /// Current id without touching the activity clock.
    pub fn peek(&self) -> String {
        self.lock().id.clone()
    }

    fn session_id_at(&self, now: DateTime<Utc>) -> String {
        let mut session = self.lock();
        if now - session.last_active > self.idle_limit {
            session.id = Uuid::new_v4().to_string();
            tracing::debug!(session = %session.id, "session rotated after inactivity");
        }
        session.last_active = now;
        session.id.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_uuid_v4() {
        let tracker = SessionTracker::new(60);
        let id = Uuid::parse_str(&tracker.session_id()).unwrap();
        assert_eq!(id.get_version_num(), 4);
    }

    #[test]
    fn test_activity_keeps_session() {
        let start = Utc::now();
        let tracker = SessionTracker::starting_at(60, start);
        let first = tracker.session_id_at(start);
        let later = tracker.session_id_at(start + Duration::minutes(45));
        let even_later = tracker.session_id_at(start + Duration::minutes(90));
        assert_eq!(first, later);
        assert_eq!(later, even_later, "each call refreshes the idle window");
    }

    #[test]
    fn test_rotates_after_idle_limit() {
        let start = Utc::now();
        let tracker = SessionTracker::starting_at(60, start);
        let first = tracker.session_id_at(start);
        let rotated = tracker.session_id_at(start + Duration::minutes(61));
        assert_ne!(first, rotated);
        assert_eq!(tracker.peek(), rotated);
    }
}

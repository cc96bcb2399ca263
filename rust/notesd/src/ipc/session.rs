//! Login sessions held in daemon memory, keyed by an opaque token.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    /// Row in `session_logs` to stamp on logout or expiry.
    pub log_id: String,
    last_seen: Instant,
}

#[derive(Debug)]
pub enum Lookup {
    Active(Session),
    Expired(Session),
    Unknown,
}

pub struct SessionStore {
    ttl: Duration,
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            ttl,
            sessions: HashMap::new(),
        }
    }

    pub fn open(&mut self, user_id: &str, log_id: &str) -> String {
        self.open_at(user_id, log_id, Instant::now())
    }

    fn open_at(&mut self, user_id: &str, log_id: &str, now: Instant) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                user_id: user_id.to_string(),
                log_id: log_id.to_string(),
                last_seen: now,
            },
        );
        token
    }

    /// Refreshes the idle timer; an idle-expired session is removed and
    /// handed back so its log can be closed.
    pub fn touch(&mut self, token: &str) -> Lookup {
        self.touch_at(token, Instant::now())
    }

    fn touch_at(&mut self, token: &str, now: Instant) -> Lookup {
        let expired = match self.sessions.get(token) {
            Some(s) => now.duration_since(s.last_seen) > self.ttl,
            None => return Lookup::Unknown,
        };
        if expired {
            return self
                .sessions
                .remove(token)
                .map(Lookup::Expired)
                .unwrap_or(Lookup::Unknown);
        }
        match self.sessions.get_mut(token) {
            Some(s) => {
                s.last_seen = now;
                Lookup::Active(s.clone())
            }
            None => Lookup::Unknown,
        }
    }

    pub fn close(&mut self, token: &str) -> Option<Session> {
        self.sessions.remove(token)
    }

    /// Ends every session of one user (deactivation, deletion).
    pub fn drop_user(&mut self, user_id: &str) -> Vec<Session> {
        let tokens: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.user_id == user_id)
            .map(|(t, _)| t.clone())
            .collect();
        tokens
            .into_iter()
            .filter_map(|t| self.sessions.remove(&t))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn purge_expired(&mut self) -> Vec<Session> {
        let now = Instant::now();
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > ttl)
            .map(|(t, _)| t.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|t| self.sessions.remove(&t))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_sessions_expire() {
        let mut store = SessionStore::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let token = store.open_at("u1", "log1", t0);

        assert!(matches!(
            store.touch_at(&token, t0 + Duration::from_secs(30)),
            Lookup::Active(_)
        ));
        // The touch above moved the idle window forward.
        assert!(matches!(
            store.touch_at(&token, t0 + Duration::from_secs(80)),
            Lookup::Active(_)
        ));
        match store.touch_at(&token, t0 + Duration::from_secs(200)) {
            Lookup::Expired(s) => assert_eq!(s.log_id, "log1"),
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(matches!(store.touch_at(&token, t0), Lookup::Unknown));
    }

    #[test]
    fn drop_user_only_hits_that_user() {
        let mut store = SessionStore::new(Duration::from_secs(60));
        store.open("u1", "a");
        store.open("u1", "b");
        let keep = store.open("u2", "c");
        assert_eq!(store.drop_user("u1").len(), 2);
        assert_eq!(store.active_count(), 1);
        assert!(matches!(store.touch(&keep), Lookup::Active(_)));
    }
}

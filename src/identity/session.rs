use std::collections::{HashMap, HashSet};
use std::time::Duration;
use parking_lot::RwLock;
use base64::Engine;
use serde::{Deserialize, Serialize};
use crate::tprintln;

use super::principal::AuthUser;

pub type SessionToken = String;

/// An issued provider session. The token is opaque to callers; expiry is in
/// epoch milliseconds so sessions survive serialization to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub user: AuthUser,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired_at(&self, now_ms: i64) -> bool { self.expires_at <= now_ms }
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
}

fn gen_id() -> String {
    // 128-bit random token base64url without padding
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

/// Token book-keeping for the local identity provider.
///
/// All maps are owned by the manager instance; constructing two managers
/// yields two independent session namespaces. Nothing here is process-global.
pub struct SessionManager {
    pub ttl: Duration,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    user_index: RwLock<HashMap<String, HashSet<String>>>,
    revoked: RwLock<HashSet<String>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::with_ttl(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn issue(&self, user: AuthUser) -> Session {
        let now = now_ms();
        let token = gen_id();
        let sess = Session {
            token: token.clone(),
            user: user.clone(),
            issued_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
        };
        let entry = SessionEntry { session: sess.clone() };
        {
            let mut m = self.sessions.write();
            m.insert(token.clone(), entry);
        }
        {
            let mut uidx = self.user_index.write();
            let set = uidx.entry(user.id.to_string()).or_insert_with(HashSet::new);
            set.insert(token.clone());
        }
        tprintln!("session.issue user={} ttl_secs={}", user.email, self.ttl.as_secs());
        sess
    }

    pub fn validate(&self, token: &str) -> Option<Session> {
        // prune revoked
        if self.revoked.read().contains(token) { return None; }
        let now = now_ms();
        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(ent) = map.get(token) {
                if !ent.session.is_expired_at(now) {
                    Some(ent.session.clone())
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else { None }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        out
    }

    pub fn logout(&self, token: &str) -> bool {
        let mut removed = false;
        if let Some(ent) = self.sessions.write().remove(token) {
            removed = true;
            let uid = ent.session.user.id.to_string();
            let mut idx = self.user_index.write();
            if let Some(set) = idx.get_mut(&uid) { set.remove(token); }
            self.revoked.write().insert(token.to_string());
        }
        removed
    }

    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = self.user_index.read().get(user_id).cloned() {
            let mut s = self.sessions.write();
            let mut r = self.revoked.write();
            for t in tokens.iter() {
                if s.remove(t).is_some() { count += 1; }
                r.insert(t.clone());
            }
        }
        tprintln!("session.revoke user={} count={}", user_id, count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user() -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            email: "a@x.com".into(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn issue_validate_logout() {
        let sm = SessionManager::default();
        let sess = sm.issue(user());
        assert!(sm.validate(&sess.token).is_some());
        assert!(sm.logout(&sess.token));
        assert!(sm.validate(&sess.token).is_none());
        // logging out twice is a no-op
        assert!(!sm.logout(&sess.token));
    }

    #[test]
    fn expired_sessions_do_not_validate() {
        let sm = SessionManager::with_ttl(Duration::from_secs(0));
        let sess = sm.issue(user());
        assert!(sm.validate(&sess.token).is_none());
    }

    #[test]
    fn revoke_user_drops_all_tokens() {
        let sm = SessionManager::default();
        let u = user();
        let s1 = sm.issue(u.clone());
        let s2 = sm.issue(u.clone());
        assert_eq!(sm.revoke_user(&u.id.to_string()), 2);
        assert!(sm.validate(&s1.token).is_none());
        assert!(sm.validate(&s2.token).is_none());
    }

    #[test]
    fn managers_are_independent() {
        let a = SessionManager::default();
        let b = SessionManager::default();
        let sess = a.issue(user());
        assert!(b.validate(&sess.token).is_none());
    }
}

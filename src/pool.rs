//! Bounded session pool
//!
//! Owns every live authenticated browser. One map lock for membership and
//! metadata, one mutex per session for engine work; the pool never holds
//! both at the same time. Capacity is enforced by evicting the
//! least-recently-used idle session.

use crate::artifacts::ArtifactStore;
use crate::auth::LoginFlow;
use crate::error::{ErrorKind, GatewayError};
use crate::portal::urls;
use crate::session::{BrowserSession, Credentials, SessionInfo};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// How long a credential-holder waits for a concurrent login with the same
/// credentials before re-checking the map.
const PENDING_LOGIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    /// A keep-alive session is refreshed when its last refresh is older.
    pub refresh_interval: Duration,
    pub portal_url: String,
}

struct PoolEntry {
    session: Arc<Mutex<BrowserSession>>,
    credentials_hash: String,
    username: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    last_refreshed_at: DateTime<Utc>,
    keep_alive: bool,
    in_use: bool,
}

impl PoolEntry {
    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            username: self.username.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            last_refreshed_at: self.last_refreshed_at,
            keep_alive: self.keep_alive,
            in_use: self.in_use,
        }
    }
}

struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Credential hashes with a login in flight; prevents a double login
    /// when two requests miss simultaneously.
    pending_logins: HashSet<String>,
}

/// A vended session: exclusive access for the duration of the request.
/// Call `SessionPool::release` when done.
pub struct Acquired {
    pub guard: OwnedMutexGuard<BrowserSession>,
    pub session_id: String,
    pub is_new: bool,
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("session_id", &self.session_id)
            .field("is_new", &self.is_new)
            .finish()
    }
}

pub struct SessionPool {
    state: Mutex<PoolState>,
    login: Arc<dyn LoginFlow>,
    store: ArtifactStore,
    config: PoolConfig,
}

impl SessionPool {
    pub fn new(login: Arc<dyn LoginFlow>, store: ArtifactStore, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                pending_logins: HashSet::new(),
            }),
            login,
            store,
            config,
        })
    }

    /// Look up an existing session by id. Dead sessions are evicted and
    /// surface as `SESSION_DEAD`; the caller decides whether to re-auth.
    pub async fn acquire_by_id(&self, session_id: &str) -> Result<Acquired, GatewayError> {
        let session = {
            let mut state = self.state.lock().await;
            let entry = state.entries.get_mut(session_id).ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::SessionNotFound,
                    format!("no session {session_id}"),
                )
            })?;
            entry.in_use = true;
            entry.last_used_at = Utc::now();
            entry.session.clone()
        };

        let guard = session.lock_owned().await;
        if !guard.is_alive().await {
            self.discard(session_id, guard).await;
            return Err(GatewayError::new(
                ErrorKind::SessionDead,
                "session failed its liveness probe",
            )
            .with_session(session_id));
        }

        Ok(Acquired {
            guard,
            session_id: session_id.to_string(),
            is_new: false,
        })
    }

    /// Resolve a session for these credentials: reuse a live one, or log in
    /// fresh (evicting the LRU idle session first when at capacity).
    pub async fn acquire(&self, credentials: &Credentials) -> Result<Acquired, GatewayError> {
        let key = credentials.pool_key();
        loop {
            enum Plan {
                Hit(String, Arc<Mutex<BrowserSession>>),
                Wait,
                Create,
            }

            let plan = {
                let mut state = self.state.lock().await;
                let hit = state
                    .entries
                    .iter_mut()
                    .find(|(_, e)| e.credentials_hash == key)
                    .map(|(id, entry)| {
                        entry.in_use = true;
                        entry.last_used_at = Utc::now();
                        (id.clone(), entry.session.clone())
                    });
                match hit {
                    Some((id, session)) => Plan::Hit(id, session),
                    None if state.pending_logins.contains(&key) => Plan::Wait,
                    None => {
                        self.make_room(&mut state)?;
                        state.pending_logins.insert(key.clone());
                        Plan::Create
                    }
                }
            };

            match plan {
                Plan::Hit(id, session) => {
                    let guard = session.lock_owned().await;
                    if guard.is_alive().await {
                        return Ok(Acquired {
                            guard,
                            session_id: id,
                            is_new: false,
                        });
                    }
                    // Dead under us: evict and fall through to a fresh login.
                    tracing::info!(session_id = %id, "evicting dead session, re-authenticating");
                    self.discard(&id, guard).await;
                }
                Plan::Wait => {
                    tokio::time::sleep(PENDING_LOGIN_POLL).await;
                }
                Plan::Create => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    let result = self.login.login(credentials, &session_id).await;
                    let mut state = self.state.lock().await;
                    state.pending_logins.remove(&key);
                    let session = match result {
                        Ok(session) => session,
                        Err(e) => return Err(e),
                    };
                    let now = Utc::now();
                    let arc = Arc::new(Mutex::new(session));
                    state.entries.insert(
                        session_id.clone(),
                        PoolEntry {
                            session: arc.clone(),
                            credentials_hash: key.clone(),
                            username: credentials.username.clone(),
                            created_at: now,
                            last_used_at: now,
                            last_refreshed_at: now,
                            keep_alive: true,
                            in_use: true,
                        },
                    );
                    drop(state);
                    let guard = arc.lock_owned().await;
                    return Ok(Acquired {
                        guard,
                        session_id,
                        is_new: true,
                    });
                }
            }
        }
    }

    /// Ensure there is room for one more session. Called with the state
    /// lock held; in-flight logins count against capacity so concurrent
    /// misses cannot overshoot it. Evicted browsers close on a detached
    /// task.
    fn make_room(&self, state: &mut PoolState) -> Result<(), GatewayError> {
        while state.entries.len() + state.pending_logins.len() >= self.config.max_sessions {
            let victim = lru_victim(
                state
                    .entries
                    .iter()
                    .map(|(id, e)| (id.as_str(), e.last_used_at, e.in_use)),
            )
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::CapacityExceeded,
                    "every pooled session is in use",
                )
            })?;

            let Some(entry) = state.entries.remove(&victim) else {
                break;
            };
            tracing::info!(session_id = %victim, username = %entry.username, "LRU-evicting session");
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut session = entry.session.lock().await;
                session.close().await;
                store.remove_session(&session.session_id);
            });
        }
        Ok(())
    }

    /// Mark a session idle again. Never closes.
    pub async fn release(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(session_id) {
            entry.in_use = false;
            entry.last_used_at = Utc::now();
        }
    }

    /// Evict and destroy one session. Returns whether it existed.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let entry = {
            let mut state = self.state.lock().await;
            state.entries.remove(session_id)
        };
        match entry {
            Some(entry) => {
                let mut session = entry.session.lock().await;
                session.close().await;
                self.store.remove_session(session_id);
                true
            }
            None => false,
        }
    }

    /// Destroy a session whose guard the caller already holds. The browser
    /// is closed and the guard dropped before the state lock is touched;
    /// the pool never holds both locks at once. Until the map removal
    /// lands, racers see a dead entry, fail the liveness probe, and come
    /// back here; the double removal is harmless.
    async fn discard(&self, session_id: &str, mut guard: OwnedMutexGuard<BrowserSession>) {
        guard.close().await;
        drop(guard);
        {
            let mut state = self.state.lock().await;
            state.entries.remove(session_id);
        }
        self.store.remove_session(session_id);
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let state = self.state.lock().await;
        let mut infos: Vec<SessionInfo> = state
            .entries
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn persistent_count(&self) -> usize {
        let state = self.state.lock().await;
        state.entries.values().filter(|e| e.keep_alive).count()
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    /// One refresher round: revisit every keep-alive session that is idle
    /// and overdue, verify it is still logged in, evict it otherwise. Busy
    /// sessions are skipped; the refresher never waits on a user request.
    pub async fn refresh_pass(&self) {
        let due: Vec<(String, Arc<Mutex<BrowserSession>>)> = {
            let state = self.state.lock().await;
            let now = Utc::now();
            state
                .entries
                .iter()
                .filter(|(_, e)| {
                    e.keep_alive
                        && !e.in_use
                        && (now - e.last_refreshed_at).to_std().unwrap_or_default()
                            >= self.config.refresh_interval
                })
                .map(|(id, e)| (id.clone(), e.session.clone()))
                .collect()
        };

        for (session_id, session) in due {
            let Ok(mut guard) = session.try_lock_owned() else {
                tracing::debug!(session_id = %session_id, "session busy, skipping refresh");
                continue;
            };

            let landing = format!(
                "{}{}",
                self.config.portal_url.trim_end_matches('/'),
                urls::CONTAINERS_PATH
            );
            let still_in = match guard.driver.goto(&landing).await {
                Ok(()) => guard
                    .driver
                    .current_url()
                    .await
                    .map(|url| url.contains(urls::LANDING_MARKER))
                    .unwrap_or(false),
                Err(_) => false,
            };

            // The session guard is released before the state lock is
            // taken; the pool never holds both at once.
            if still_in {
                drop(guard);
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.get_mut(&session_id) {
                    entry.last_refreshed_at = Utc::now();
                }
                tracing::debug!(session_id = %session_id, "session refreshed");
            } else {
                tracing::info!(session_id = %session_id, "session no longer authenticated, evicting");
                guard.close().await;
                drop(guard);
                {
                    let mut state = self.state.lock().await;
                    state.entries.remove(&session_id);
                }
                self.store.remove_session(&session_id);
            }
        }
    }

    /// Spawn the periodic refresher. Holds only a weak reference so pool
    /// drop ends the task.
    pub fn spawn_refresher(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => pool.refresh_pass().await,
                    None => break,
                }
            }
        })
    }

    /// Close everything. Called on shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut state = self.state.lock().await;
            state.entries.drain().collect()
        };
        for (session_id, entry) in entries {
            let mut session = entry.session.lock().await;
            session.close().await;
            self.store.remove_session(&session_id);
        }
    }
}

/// Pick the eviction victim: smallest `last_used_at` among idle entries.
fn lru_victim<'a>(
    entries: impl Iterator<Item = (&'a str, DateTime<Utc>, bool)>,
) -> Option<String> {
    entries
        .filter(|(_, _, in_use)| !in_use)
        .min_by_key(|(_, last_used, _)| *last_used)
        .map(|(id, _, _)| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FakeLogin;
    use chrono::TimeZone;

    fn creds(n: u32) -> Credentials {
        Credentials {
            username: format!("user{n}"),
            password: "pw".to_string(),
            captcha_key: "key".to_string(),
        }
    }

    fn pool_with(max: usize) -> (tempfile::TempDir, Arc<SessionPool>, Arc<FakeLogin>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts")).unwrap();
        let login = Arc::new(FakeLogin::new(store.clone()));
        let pool = SessionPool::new(
            login.clone(),
            store,
            PoolConfig {
                max_sessions: max,
                refresh_interval: Duration::ZERO,
                portal_url: "https://portal.example.com".to_string(),
            },
        );
        (tmp, pool, login)
    }

    #[tokio::test]
    async fn same_credentials_reuse_the_session() {
        let (_tmp, pool, login) = pool_with(10);

        let first = pool.acquire(&creds(1)).await.unwrap();
        assert!(first.is_new);
        let id = first.session_id.clone();
        drop(first);
        pool.release(&id).await;

        let second = pool.acquire(&creds(1)).await.unwrap();
        assert!(!second.is_new);
        assert_eq!(second.session_id, id);
        assert_eq!(login.logins(), 1);
    }

    #[tokio::test]
    async fn capacity_never_exceeded_and_oldest_idle_evicted() {
        let (_tmp, pool, _login) = pool_with(2);

        let mut ids = Vec::new();
        for n in 0..3 {
            let acquired = pool.acquire(&creds(n)).await.unwrap();
            ids.push(acquired.session_id.clone());
            let id = acquired.session_id.clone();
            drop(acquired);
            pool.release(&id).await;
            assert!(pool.active_count().await <= 2);
        }

        let live: Vec<String> = pool
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert!(!live.contains(&ids[0]), "first created should be evicted");
        assert!(live.contains(&ids[2]), "newest must survive");
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn lru_respects_recent_touch() {
        let (_tmp, pool, _login) = pool_with(2);

        let a = pool.acquire(&creds(1)).await.unwrap();
        let a_id = a.session_id.clone();
        drop(a);
        pool.release(&a_id).await;

        let b = pool.acquire(&creds(2)).await.unwrap();
        let b_id = b.session_id.clone();
        drop(b);
        pool.release(&b_id).await;

        // Touch A so B becomes the LRU.
        let a = pool.acquire(&creds(1)).await.unwrap();
        drop(a);
        pool.release(&a_id).await;

        let c = pool.acquire(&creds(3)).await.unwrap();
        drop(c);

        let live: Vec<String> = pool
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert!(live.contains(&a_id));
        assert!(!live.contains(&b_id), "B was least recently used");
    }

    #[tokio::test]
    async fn all_in_use_fails_with_capacity() {
        let (_tmp, pool, _login) = pool_with(1);

        let held = pool.acquire(&creds(1)).await.unwrap();
        let err = pool.acquire(&creds(2)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CapacityExceeded);
        drop(held);
    }

    #[tokio::test]
    async fn dead_session_by_id_is_evicted_and_reported() {
        let (_tmp, pool, _login) = pool_with(10);

        let mut acquired = pool.acquire(&creds(1)).await.unwrap();
        let id = acquired.session_id.clone();
        acquired.guard.close().await; // simulate a crashed browser
        drop(acquired);
        pool.release(&id).await;

        let err = pool.acquire_by_id(&id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionDead);
        assert_eq!(pool.active_count().await, 0);
    }

    #[tokio::test]
    async fn dead_session_by_credentials_recreates_transparently() {
        let (_tmp, pool, login) = pool_with(10);

        let mut acquired = pool.acquire(&creds(1)).await.unwrap();
        let old_id = acquired.session_id.clone();
        acquired.guard.close().await;
        drop(acquired);
        pool.release(&old_id).await;

        let fresh = pool.acquire(&creds(1)).await.unwrap();
        assert!(fresh.is_new);
        assert_ne!(fresh.session_id, old_id);
        assert_eq!(login.logins(), 2);
    }

    #[tokio::test]
    async fn failed_login_clears_pending_state() {
        let (_tmp, pool, login) = pool_with(10);
        login.fail_next(ErrorKind::InvalidCredentials);

        let err = pool.acquire(&creds(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);

        // The pending marker must be gone or this would deadlock-wait.
        let ok = pool.acquire(&creds(1)).await.unwrap();
        assert!(ok.is_new);
    }

    #[tokio::test]
    async fn unknown_session_id_is_not_found() {
        let (_tmp, pool, _login) = pool_with(10);
        let err = pool.acquire_by_id("nope").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn refresh_pass_updates_live_sessions() {
        let (_tmp, pool, _login) = pool_with(10);

        let acquired = pool.acquire(&creds(1)).await.unwrap();
        let id = acquired.session_id.clone();
        drop(acquired);
        pool.release(&id).await;

        let before = pool.snapshot().await[0].last_refreshed_at;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.refresh_pass().await;
        let after = pool.snapshot().await[0].last_refreshed_at;
        assert!(after > before, "refresh should advance the timestamp");
    }

    #[tokio::test]
    async fn refresh_pass_evicts_dead_sessions() {
        let (_tmp, pool, _login) = pool_with(10);

        let mut acquired = pool.acquire(&creds(1)).await.unwrap();
        let id = acquired.session_id.clone();
        acquired.guard.close().await;
        drop(acquired);
        pool.release(&id).await;

        pool.refresh_pass().await;
        assert_eq!(pool.active_count().await, 0);
    }

    #[tokio::test]
    async fn refresh_pass_skips_busy_sessions() {
        let (_tmp, pool, _login) = pool_with(10);

        let acquired = pool.acquire(&creds(1)).await.unwrap();
        // in_use is still true: the refresher must not touch it.
        pool.refresh_pass().await;
        assert_eq!(pool.active_count().await, 1);
        drop(acquired);
    }

    #[test]
    fn lru_victim_ignores_in_use_entries() {
        let t = |secs: i64| chrono::Utc.timestamp_opt(secs, 0).unwrap();
        let entries = vec![
            ("a", t(10), true),
            ("b", t(20), false),
            ("c", t(5), true),
            ("d", t(30), false),
        ];
        assert_eq!(
            lru_victim(entries.into_iter()),
            Some("b".to_string()),
            "b is the oldest idle entry"
        );
    }

    #[test]
    fn lru_victim_none_when_all_busy() {
        let t = |secs: i64| chrono::Utc.timestamp_opt(secs, 0).unwrap();
        assert_eq!(lru_victim(vec![("a", t(1), true)].into_iter()), None);
    }

    proptest::proptest! {
        #[test]
        fn lru_victim_is_minimal_over_idle(entries in proptest::collection::vec(
            (0i64..1_000_000, proptest::bool::ANY), 1..20)) {
            let t = |secs: i64| chrono::Utc.timestamp_opt(secs, 0).unwrap();
            let named: Vec<(String, i64, bool)> = entries
                .iter()
                .enumerate()
                .map(|(i, (secs, busy))| (format!("s{i}"), *secs, *busy))
                .collect();
            let victim = lru_victim(named.iter().map(|(id, secs, busy)| (id.as_str(), t(*secs), *busy)));
            let idle: Vec<_> = named.iter().filter(|(_, _, busy)| !busy).collect();
            match victim {
                None => proptest::prop_assert!(idle.is_empty()),
                Some(id) => {
                    let (_, victim_secs, _) = named.iter().find(|(n, _, _)| *n == id).unwrap();
                    for (_, secs, _) in &idle {
                        proptest::prop_assert!(victim_secs <= secs);
                    }
                }
            }
        }
    }
}

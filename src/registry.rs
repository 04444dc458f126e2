//! Process-wide session registry: indexed live/finished storage, drain
//! semantics, and the TTL sweeper for finished sessions.
//!
//! Encapsulated behind a constructed, `Clone`-able instance (rather than a
//! bare global) so tests can spin up a fresh registry per run and the tool
//! closures in `server.rs` simply capture one.

use crate::session::{Session, SessionSnapshot, SessionStatus, Stream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the TTL sweeper walks the finished set.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct RegistryInner {
    live: Mutex<HashMap<String, Arc<Session>>>,
    finished: Mutex<HashMap<String, Arc<Session>>>,
    job_ttl_ms: Mutex<Option<u64>>,
}

/// Process-wide, in-memory mapping of session-id -> live session, plus a
/// bounded store of recently-finished sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// A registry with no TTL sweep configured; callers must opt in via
    /// `set_job_ttl_ms`. Used by tests that want to control sweeping
    /// explicitly.
    #[must_use]
    pub fn new() -> Self {
        Self::with_job_ttl_ms(None)
    }

    /// A registry with the TTL sweep active from construction, so finished
    /// sessions are never retained forever if a caller forgets to clear
    /// them.
    #[must_use]
    pub fn with_job_ttl_ms(job_ttl_ms: Option<u64>) -> Self {
        let inner = Arc::new(RegistryInner {
            live: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            job_ttl_ms: Mutex::new(job_ttl_ms),
        });

        let sweeper_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                sweep(&sweeper_inner).await;
            }
        });

        Self { inner }
    }

    /// Insert a newly-spawned session into the live set.
    ///
    /// Duplicate ids are a programmer error: session ids come from a UUID
    /// source and should never collide.
    pub async fn add(&self, session: Arc<Session>) {
        let mut live = self.inner.live.lock().await;
        assert!(
            !live.contains_key(&session.id),
            "session id collision: {}",
            session.id
        );
        live.insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.live.lock().await.get(id).cloned()
    }

    pub async fn get_finished(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.finished.lock().await.get(id).cloned()
    }

    /// Look up a session regardless of which set it's in.
    pub async fn get_any(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(s) = self.get(id).await {
            return Some(s);
        }
        self.get_finished(id).await
    }

    pub async fn append_output(&self, session: &Session, stream: Stream, chunk: &str) {
        session.append_output(stream, chunk).await;
    }

    pub async fn drain(&self, session: &Session) -> (String, String) {
        session.drain().await
    }

    pub async fn mark_backgrounded(&self, session: &Session) {
        session.mark_backgrounded().await;
    }

    /// Idempotent: the first call moves the session from live to finished
    /// and stamps `ended_at`; subsequent calls only update status fields.
    pub async fn mark_exited(
        &self,
        session: &Arc<Session>,
        exit_code: Option<i32>,
        exit_signal: Option<String>,
        status: SessionStatus,
    ) {
        let first = session
            .mark_exited(exit_code, exit_signal, status)
            .await;

        if first {
            let mut live = self.inner.live.lock().await;
            if let Some(s) = live.remove(&session.id) {
                drop(live);
                self.inner.finished.lock().await.insert(s.id.clone(), s);
            }
        }
    }

    pub async fn list_running(&self) -> Vec<SessionSnapshot> {
        let live = self.inner.live.lock().await;
        let mut out = Vec::with_capacity(live.len());
        for s in live.values() {
            out.push(s.snapshot().await);
        }
        out
    }

    pub async fn list_finished(&self) -> Vec<SessionSnapshot> {
        let finished = self.inner.finished.lock().await;
        let mut out = Vec::with_capacity(finished.len());
        for s in finished.values() {
            out.push(s.snapshot().await);
        }
        out
    }

    /// Remove a session from either set, returning it if present.
    pub async fn delete(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(s) = self.inner.live.lock().await.remove(id) {
            return Some(s);
        }
        self.inner.finished.lock().await.remove(id)
    }

    pub async fn set_job_ttl_ms(&self, ms: Option<u64>) {
        *self.inner.job_ttl_ms.lock().await = ms;
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove finished entries older than the configured TTL. Never touches the
/// live set. A TTL of `None` or zero disables the sweep.
async fn sweep(inner: &Arc<RegistryInner>) {
    let ttl_ms = *inner.job_ttl_ms.lock().await;
    let Some(ttl_ms) = ttl_ms.filter(|&ms| ms > 0) else {
        return;
    };

    let now = crate::session::now_ms();
    let mut finished = inner.finished.lock().await;
    let mut expired = Vec::new();
    for (id, session) in finished.iter() {
        let snap = session.snapshot().await;
        if let Some(ended_at) = snap.ended_at
            && ended_at + ttl_ms < now
        {
            expired.push(id.clone());
        }
    }
    for id in expired {
        finished.remove(&id);
    }
}

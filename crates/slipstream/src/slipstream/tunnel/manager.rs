use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use tokio::sync::watch;

use crate::slipstream::tunnel::{
    TunnelError,
    transport::{BoxedStream, TransportSession},
};

/// A session as seen by bridges: a generation number plus the shared session.
///
/// Only `open_stream` and `close` are exposed; liveness is owned by the
/// [`SessionManager`].
pub struct SessionHandle {
    generation: u64,
    sess: Arc<dyn TransportSession>,
    established: Instant,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .field("remote", &self.sess.remote_addr())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.sess.remote_addr()
    }

    pub fn uptime(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.sess.is_closed()
    }

    pub async fn open_stream(&self) -> Result<BoxedStream, TunnelError> {
        if self.sess.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        self.sess.open_stream().await
    }

    pub async fn closed(&self) -> String {
        self.sess.closed().await
    }

    pub fn close(&self, reason: &str) {
        self.sess.close(reason);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub remote: String,
    pub uptime_ms: u64,
    pub alive: bool,
}

/// Owns the one live transport session and hands it to concurrent openers.
///
/// Reads are lock-free (`ArcSwapOption`); install and invalidate publish on a
/// watch channel so bridges waiting for a session wake up. A session that failed
/// once is never handed out again.
pub struct SessionManager {
    current: ArcSwapOption<SessionHandle>,
    generation: AtomicU64,
    changed: watch::Sender<u64>,
    stream_wait: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(stream_wait: Duration) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            current: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            changed: tx,
            stream_wait,
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Publishes a freshly established session, replacing (and closing) any
    /// previous one.
    pub fn install(&self, sess: Arc<dyn TransportSession>) -> Arc<SessionHandle> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(SessionHandle {
            generation,
            sess,
            established: Instant::now(),
        });
        if let Some(old) = self.current.swap(Some(handle.clone())) {
            old.close("replaced");
        }
        self.bump_changed();
        handle
    }

    /// Drops `generation` if it is still current and closes it.
    ///
    /// Returns false when a newer session was already installed.
    pub fn invalidate(&self, generation: u64, reason: &str) -> bool {
        let cur = self.current.load();
        let Some(h) = &*cur else {
            return false;
        };
        if h.generation != generation {
            return false;
        }
        let prev = self
            .current
            .compare_and_swap(&cur, None::<Arc<SessionHandle>>);
        let swapped = match &*prev {
            Some(p) => p.generation == generation,
            None => false,
        };
        if swapped {
            h.close(reason);
            self.bump_changed();
        }
        swapped
    }

    /// The live session, if any. Dead sessions are pruned on the way.
    pub fn current(&self) -> Option<Arc<SessionHandle>> {
        let h = self.current.load_full()?;
        if h.is_closed() {
            self.invalidate(h.generation, "closed");
            return None;
        }
        Some(h)
    }

    /// Opens a stream on the live session, waiting up to the configured bound
    /// for one to be installed.
    pub async fn open_stream(&self) -> Result<(BoxedStream, u64), TunnelError> {
        let handle = self.wait_for_session().await?;
        match handle.open_stream().await {
            Ok(st) => Ok((st, handle.generation)),
            Err(err) => {
                if matches!(err, TunnelError::SessionClosed) || handle.is_closed() {
                    self.invalidate(handle.generation, "stream open failed");
                }
                Err(err)
            }
        }
    }

    async fn wait_for_session(&self) -> Result<Arc<SessionHandle>, TunnelError> {
        if let Some(h) = self.current() {
            return Ok(h);
        }

        let mut rx = self.changed.subscribe();
        let wait = async {
            loop {
                if let Some(h) = self.current() {
                    return Ok(h);
                }
                if rx.changed().await.is_err() {
                    return Err(TunnelError::SessionClosed);
                }
            }
        };
        match tokio::time::timeout(self.stream_wait, wait).await {
            Ok(res) => res,
            Err(_) => Err(TunnelError::StreamOpen(format!(
                "no live session after {}",
                humantime::format_duration(self.stream_wait)
            ))),
        }
    }

    /// Closes the live session; used at shutdown.
    pub fn close(&self, reason: &str) {
        if let Some(old) = self.current.swap(None) {
            old.close(reason);
            self.bump_changed();
        }
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let h = self.current.load_full()?;
        Some(SessionSnapshot {
            generation: h.generation,
            remote: h.remote_addr().to_string(),
            uptime_ms: h.uptime().as_millis() as u64,
            alive: !h.is_closed(),
        })
    }

    fn bump_changed(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::fake::FakeSession;
    use super::*;

    #[tokio::test]
    async fn open_stream_uses_installed_session() {
        let mgr = SessionManager::new(Duration::from_millis(100));
        let sess = FakeSession::new();
        let h = mgr.install(sess.clone());
        assert_eq!(h.generation(), 1);

        let (mut st, generation) = mgr.open_stream().await.expect("open");
        assert_eq!(generation, 1);
        st.write_all(b"abc").await.unwrap();
        st.shutdown().await.unwrap();
        let mut got = Vec::new();
        st.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"abc");
        assert_eq!(sess.opened.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn open_stream_without_session_fails_after_wait() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let err = match mgr.open_stream().await {
            Ok(_) => panic!("opened a stream without a session"),
            Err(err) => err,
        };
        assert!(matches!(err, TunnelError::StreamOpen(_)), "got {err:?}");
        assert!(err.to_string().contains("no live session"));
    }

    #[tokio::test]
    async fn waiting_opener_is_woken_by_install() {
        let mgr = Arc::new(SessionManager::new(Duration::from_secs(2)));
        let opener = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.open_stream().await.map(|(_, g)| g) }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.install(FakeSession::new());

        let generation = opener.await.unwrap().expect("open after install");
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn closed_session_is_never_handed_out() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let sess = FakeSession::new();
        mgr.install(sess.clone());
        sess.close("gone");

        assert!(mgr.current().is_none());
        assert!(mgr.open_stream().await.is_err());
        assert!(mgr.snapshot().is_none());
    }

    #[tokio::test]
    async fn invalidate_ignores_stale_generation() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let first = FakeSession::new();
        mgr.install(first.clone());
        let second = FakeSession::new();
        mgr.install(second.clone());

        // Replacing closes the previous session.
        assert!(first.is_closed());
        assert!(!mgr.invalidate(1, "stale"));
        assert!(!second.is_closed());

        assert!(mgr.invalidate(2, "dead"));
        assert!(second.is_closed());
        assert!(mgr.current().is_none());
    }

    #[tokio::test]
    async fn failed_open_on_dead_session_invalidates_it() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let sess = FakeSession::new();
        let h = mgr.install(sess.clone());
        let mut rx = mgr.subscribe();
        rx.borrow_and_update();

        // Close behind the manager's back so the first open discovers it.
        sess.closed.store(true, Ordering::Release);
        let err = match h.open_stream().await {
            Ok(_) => panic!("opened a stream on a closed session"),
            Err(err) => err,
        };
        assert!(matches!(err, TunnelError::SessionClosed));

        assert!(mgr.open_stream().await.is_err());
        assert!(mgr.current().is_none());
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn transient_open_failure_keeps_session() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let sess = FakeSession::new();
        mgr.install(sess.clone());
        sess.fail_opens.store(true, Ordering::Release);

        assert!(matches!(
            mgr.open_stream().await,
            Err(TunnelError::StreamOpen(_))
        ));
        assert!(mgr.current().is_some());
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_session() {
        let mgr = Arc::new(SessionManager::new(Duration::from_secs(1)));
        let sess = FakeSession::new();
        mgr.install(sess.clone());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let mgr = mgr.clone();
            tasks.spawn(async move { mgr.open_stream().await.map(|(_, g)| g) });
        }
        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap().expect("open"), 1);
        }
        assert_eq!(sess.opened.load(Ordering::Relaxed), 32);
    }

    #[tokio::test]
    async fn close_drops_the_session() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let sess = FakeSession::new();
        mgr.install(sess.clone());
        mgr.close("shutdown");
        assert!(sess.is_closed());
        assert!(mgr.current().is_none());
    }
}

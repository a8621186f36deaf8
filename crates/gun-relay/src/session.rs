//! UDP session table
//!
//! Maps a peer address to the session carrying its datagrams. Creation is an
//! atomic get-or-insert, so concurrent first packets from one peer share one
//! session. Removal always names the session id it expects, so a late
//! teardown can never delete a newer session registered under the same key.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One NAT-style association backed by a tunnel stream
pub struct Session {
    id: u64,
    peer: SocketAddr,
    created: Instant,
    /// Milliseconds after `created` of the last successful send or receive
    last_active: AtomicU64,
    cancel: CancellationToken,
    /// Datagrams waiting to be sent on the stream (client sessions)
    uplink: Option<mpsc::Sender<Bytes>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("idle", &self.idle_for())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        cancel: CancellationToken,
        uplink: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            id,
            peer,
            created: Instant::now(),
            last_active: AtomicU64::new(0),
            cancel,
            uplink,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_active.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last_active = Duration::from_millis(self.last_active.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_active)
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Ask the session task to close its stream and exit
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn uplink(&self) -> Option<&mpsc::Sender<Bytes>> {
        self.uplink.as_ref()
    }
}

/// Concurrent map of live sessions
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the session for `key`, creating it with `make` if absent.
    ///
    /// `make` runs while the entry is locked and must not block. The flag is
    /// `true` when this call created the session.
    pub fn get_or_insert_with<F>(&self, key: SocketAddr, make: F) -> (Arc<Session>, bool)
    where
        F: FnOnce(u64) -> Session,
    {
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Arc::new(make(self.next_id()));
                entry.insert(session.clone());
                trace!("Session {} created for {}", session.id, key);
                (session, true)
            }
        }
    }

    /// Register a session under a key nobody else uses
    pub fn insert(&self, session: Arc<Session>) {
        if let Some(previous) = self.sessions.insert(session.peer, session) {
            previous.close();
        }
    }

    pub fn get(&self, key: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `key` only if it still maps to session `id`
    pub fn remove_if_same(&self, key: &SocketAddr, id: u64) -> Option<Arc<Session>> {
        self.sessions
            .remove_if(key, |_, session| session.id == id)
            .map(|(_, session)| session)
    }

    /// Close and remove every session idle for longer than `timeout`.
    ///
    /// Each candidate is re-checked under the entry lock, so a session that
    /// became active or was replaced in the meantime survives.
    ///
    /// Teardown order is remove, then cancel, then the owning task
    /// half-closes the stream (or drops the socket). Once the entry is gone a
    /// new datagram from the same peer opens a fresh session instead of
    /// landing on the closing one.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let candidates: Vec<(SocketAddr, u64)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(timeout))
            .map(|entry| (*entry.key(), entry.value().id))
            .collect();

        let mut evicted = 0;
        for (key, id) in candidates {
            let removed = self
                .sessions
                .remove_if(&key, |_, session| session.id == id && session.is_idle(timeout));
            if let Some((_, session)) = removed {
                debug!(
                    "Evicting idle UDP session {} for {} (idle {:?})",
                    session.id,
                    key,
                    session.idle_for()
                );
                session.close();
                evicted += 1;
            }
        }
        evicted
    }

    /// Close and remove every session
    pub fn close_all(&self) {
        let keys: Vec<SocketAddr> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session(id: u64, port: u16) -> Session {
        Session::new(id, addr(port), CancellationToken::new(), None)
    }

    #[test]
    fn test_get_or_insert_creates_once() {
        let table = SessionTable::new();

        let (first, created) = table.get_or_insert_with(addr(1000), |id| session(id, 1000));
        assert!(created);
        let (second, created) =
            table.get_or_insert_with(addr(1000), |_| panic!("must reuse the session"));
        assert!(!created);
        assert_eq!(first.id(), second.id());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_first_packets_share_session() {
        let table = Arc::new(SessionTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    table
                        .get_or_insert_with(addr(2000), |id| session(id, 2000))
                        .0
                        .id()
                })
            })
            .collect();

        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_checks_identity() {
        let table = SessionTable::new();
        let (old, _) = table.get_or_insert_with(addr(3000), |id| session(id, 3000));
        table.remove_if_same(&addr(3000), old.id()).unwrap();

        let (new, _) = table.get_or_insert_with(addr(3000), |id| session(id, 3000));
        assert_ne!(old.id(), new.id());

        // A late teardown of the old session leaves the new one alone
        assert!(table.remove_if_same(&addr(3000), old.id()).is_none());
        assert_eq!(table.get(&addr(3000)).unwrap().id(), new.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_sessions() {
        let table = SessionTable::new();
        let (idle, _) = table.get_or_insert_with(addr(4000), |id| session(id, 4000));
        let (busy, _) = table.get_or_insert_with(addr(4001), |id| session(id, 4001));

        tokio::time::advance(Duration::from_secs(90)).await;
        busy.touch();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(table.evict_idle(Duration::from_secs(120)), 1);
        assert!(idle.is_closed());
        assert!(!busy.is_closed());
        assert!(table.get(&addr(4000)).is_none());
        assert!(table.get(&addr(4001)).is_some());
    }

    #[test]
    fn test_insert_replaces_and_closes_previous() {
        let table = SessionTable::new();
        let first = Arc::new(session(table.next_id(), 5000));
        let second = Arc::new(session(table.next_id(), 5000));
        table.insert(first.clone());
        table.insert(second.clone());
        assert!(first.is_closed());
        assert_eq!(table.get(&addr(5000)).unwrap().id(), second.id());

        table.close_all();
        assert!(second.is_closed());
        assert!(table.is_empty());
    }
}

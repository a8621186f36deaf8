//! Periodic eviction of idle UDP sessions

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::SessionTable;

/// Evict sessions idle for longer than `idle_timeout` every `interval`,
/// until `shutdown` is cancelled.
pub fn spawn_reaper(
    sessions: Arc<SessionTable>,
    idle_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "UDP session reaper started (timeout {:?}, interval {:?})",
            idle_timeout, interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sessions.evict_idle(idle_timeout);
                    if evicted > 0 {
                        debug!(
                            "Reaper evicted {} idle UDP sessions, {} remaining",
                            evicted,
                            sessions.len()
                        );
                    }
                }
            }
        }

        debug!("UDP session reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::net::SocketAddr;

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_and_stops() {
        let sessions = Arc::new(SessionTable::new());
        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));
        let (session, _) = sessions.get_or_insert_with(peer, |id| {
            Session::new(id, peer, CancellationToken::new(), None)
        });

        let shutdown = CancellationToken::new();
        let reaper = spawn_reaper(
            sessions.clone(),
            Duration::from_secs(10),
            Duration::from_secs(5),
            shutdown.clone(),
        );

        // Not idle long enough at the first tick
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sessions.len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sessions.is_empty());
        assert!(session.is_closed());

        shutdown.cancel();
        reaper.await.unwrap();
    }
}

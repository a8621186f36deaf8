//! Relay engines for the gun tunnel
//!
//! The client side accepts local TCP connections and UDP datagrams and carries
//! each over its own tunnel stream. The server side accepts tunnel stream calls
//! and forwards them to one configured remote endpoint.
//!
//! - TCP: one stream per connection, bytes copied both ways, half-close aware
//! - UDP: one stream per peer address, tracked in a [`SessionTable`] and
//!   evicted by a reaper after an idle timeout

pub mod client;
pub mod config;
pub mod error;
pub mod reaper;
pub mod server;
pub mod session;
pub mod tcp;
mod udp_client;
mod udp_server;

pub use client::Client;
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use reaper::spawn_reaper;
pub use server::Server;
pub use session::{Session, SessionTable};
pub use tcp::{relay_tcp, ConnectionGuard, ConnectionTracker, RelayStats};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Observe and stop a running client or server
#[derive(Clone)]
pub struct RelayHandle {
    shutdown: CancellationToken,
    connections: ConnectionTracker,
    sessions: Arc<SessionTable>,
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("active_connections", &self.active_connections())
            .field("udp_sessions", &self.udp_sessions())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl RelayHandle {
    pub(crate) fn new(
        shutdown: CancellationToken,
        connections: ConnectionTracker,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            shutdown,
            connections,
            sessions,
        }
    }

    /// Stop accept loops, the reaper and every UDP session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// TCP connections currently being relayed
    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    /// UDP sessions currently in the table
    pub fn udp_sessions(&self) -> usize {
        self.sessions.len()
    }
}

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::connection::Connection;

/// Client-side heartbeat configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// A heartbeat is sent after this long without any write
    pub write_idle_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_idle_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn write_idle(&self) -> Duration {
        Duration::from_millis(self.write_idle_ms)
    }
}

/// Spawns the heartbeat task of one connection.
///
/// The task wakes when the connection has been write-idle for the configured
/// window and sends a heartbeat. It stops when the connection is closed or
/// dropped; it holds only a weak reference so it never keeps a connection
/// alive on its own.
pub fn spawn_heartbeat(connection: &Arc<Connection>, config: &HeartbeatConfig) -> JoinHandle<()> {
    let weak = Arc::downgrade(connection);
    let shutdown = connection.shutdown_token();
    let interval = config.write_idle();

    tokio::spawn(async move {
        let mut floor = tokio::time::Instant::now();
        loop {
            let Some(deadline) = next_deadline(&weak, interval, floor) else {
                break;
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let Some(connection) = weak.upgrade() else {
                break;
            };
            if connection.is_closed() {
                break;
            }
            // Writes since we went to sleep push the deadline out
            if connection.write_idle_for() < interval {
                continue;
            }

            match connection.send_heartbeat().await {
                Ok(true) => tracing::trace!("Sent heartbeat to {}", connection.endpoint()),
                // A call owns the stream; look again one window from now
                Ok(false) => floor = tokio::time::Instant::now(),
                Err(e) => {
                    tracing::debug!(
                        "Heartbeat to {} failed, dropping connection: {}",
                        connection.endpoint(),
                        e
                    );
                    break;
                }
            }
        }
    })
}

fn next_deadline(
    weak: &Weak<Connection>,
    interval: Duration,
    floor: tokio::time::Instant,
) -> Option<tokio::time::Instant> {
    let connection = weak.upgrade()?;
    Some(connection.last_write().max(floor) + interval)
}

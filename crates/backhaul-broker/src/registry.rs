//! Connection registry
//!
//! Maps agent identity to its live [`AgentConnection`] and enforces the
//! one-connection-per-identity invariant. Map mutations go through the
//! registry lock, but duplicate arbitration runs against an unlocked
//! snapshot of the holder: the liveness probe can take up to the request
//! timeout, and lookups and unrelated registrations must not queue behind
//! it. Registration revalidates the slot before mutating and re-arbitrates
//! if it changed while the probe was in flight.

use crate::agent::AgentConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    /// An existing connection with the same identity proved it is alive; the
    /// new connection must be turned away.
    Rejected,
}

enum Arbitration {
    ExistingAlive,
    ExistingDead,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    agents: Mutex<HashMap<String, Arc<AgentConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Decide whether an already-registered connection still speaks for its
    /// identity. The probe races against the connection's own close
    /// notification, so an existing connection that dies mid-probe is
    /// recognised immediately instead of after the probe timeout. A probe
    /// that fails or times out is treated the same as a dead connection.
    async fn arbitrate(existing: &AgentConnection) -> Arbitration {
        if existing.is_closed() {
            return Arbitration::ExistingDead;
        }

        let mut closed = existing.closed_signal();
        tokio::select! {
            alive = existing.probe() => {
                if alive {
                    Arbitration::ExistingAlive
                } else {
                    Arbitration::ExistingDead
                }
            }
            _ = closed.wait_for(|state| state.is_some()) => Arbitration::ExistingDead,
        }
    }

    /// Advisory duplicate check for an identity offered in a handshake,
    /// before the session is established. A dead holder is evicted here so
    /// the slot is free by the time the new connection registers; the
    /// binding decision is still made by [`ConnectionRegistry::register`].
    pub async fn offer(&self, identity: &str) -> bool {
        let existing = self.agents.lock().await.get(identity).cloned();
        let Some(existing) = existing else {
            return true;
        };

        match Self::arbitrate(&existing).await {
            Arbitration::ExistingAlive => {
                info!(identity, addr = %existing.addr(), "Identity already connected");
                false
            }
            Arbitration::ExistingDead => {
                debug!(identity, "Evicting dead holder during handshake");
                existing.stop().await;
                true
            }
        }
    }

    /// Register a connection under its negotiated identity.
    ///
    /// If the identity is already held, the holder is arbitrated: a live
    /// holder wins and the newcomer is rejected; a dead one is stopped and
    /// replaced. The probe runs with the registry lock released so other
    /// lookups and registrations keep flowing; before inserting, the slot
    /// is revalidated and the whole decision is retried if it changed while
    /// the probe was in flight. On acceptance the connection's reactor is
    /// spawned along with a reaper that removes the entry when the
    /// connection closes.
    pub async fn register(self: &Arc<Self>, conn: Arc<AgentConnection>) -> RegisterOutcome {
        let identity = conn.identity();
        loop {
            let existing = self.agents.lock().await.get(&identity).cloned();

            if let Some(existing) = &existing {
                match Self::arbitrate(existing).await {
                    Arbitration::ExistingAlive => {
                        warn!(
                            identity,
                            existing_addr = %existing.addr(),
                            new_addr = %conn.addr(),
                            "Rejecting duplicate connection"
                        );
                        return RegisterOutcome::Rejected;
                    }
                    Arbitration::ExistingDead => {
                        info!(
                            identity,
                            existing_addr = %existing.addr(),
                            new_addr = %conn.addr(),
                            "Replacing dead connection"
                        );
                        existing.stop().await;
                    }
                }
            }

            let mut agents = self.agents.lock().await;
            let settled = match (existing.as_ref(), agents.get(&identity)) {
                (None, None) => true,
                // The holder we stopped was reaped meanwhile; slot is free.
                (Some(_), None) => true,
                (Some(old), Some(current)) => Arc::ptr_eq(old, current),
                // Someone claimed the slot while we were unlocked.
                (None, Some(_)) => false,
            };
            if !settled {
                debug!(identity, "Slot changed during arbitration, retrying");
                continue;
            }

            agents.insert(identity.clone(), conn.clone());
            break;
        }

        conn.mark_registered();
        conn.spawn();
        self.spawn_reaper(identity, conn);
        RegisterOutcome::Accepted
    }

    fn spawn_reaper(self: &Arc<Self>, identity: String, conn: Arc<AgentConnection>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut closed = conn.closed_signal();
            if closed.wait_for(|state| state.is_some()).await.is_ok() {
                registry.unregister(&identity, &conn).await;
            }
        });
    }

    /// Remove `conn`'s entry. The pointer comparison keeps a replaced
    /// connection's late close from evicting its replacement.
    async fn unregister(&self, identity: &str, conn: &Arc<AgentConnection>) {
        let mut agents = self.agents.lock().await;
        if let Some(current) = agents.get(identity) {
            if Arc::ptr_eq(current, conn) {
                agents.remove(identity);
                info!(identity, remaining = agents.len(), "Agent unregistered");
            }
        }
    }

    pub async fn find(&self, identity: &str) -> Option<Arc<AgentConnection>> {
        self.agents.lock().await.get(identity).cloned()
    }

    pub async fn count(&self) -> usize {
        self.agents.lock().await.len()
    }

    /// Ask every registered connection to stop. Each stop runs in its own
    /// task so one connection with a wedged close cannot hold up the rest.
    pub async fn stop_all(&self) {
        let conns: Vec<_> = self.agents.lock().await.values().cloned().collect();
        info!(count = conns.len(), "Stopping all agent connections");
        for conn in conns {
            tokio::spawn(async move { conn.stop().await });
        }
    }

    /// Shutdown drain: stop everything, then poll until the registry is
    /// empty. Gives up after `give_up_after` consecutive polls without
    /// progress; returns whether the registry actually emptied.
    pub async fn drain(&self, poll_interval: Duration, give_up_after: u32) -> bool {
        self.stop_all().await;

        let mut last_count = self.count().await;
        let mut stalled = 0u32;

        while last_count > 0 {
            tokio::time::sleep(poll_interval).await;
            let count = self.count().await;
            if count == last_count {
                stalled += 1;
                if stalled >= give_up_after {
                    warn!(remaining = count, "Giving up on drain");
                    return false;
                }
            } else {
                stalled = 0;
                last_count = count;
            }
        }

        info!("Registry drained");
        true
    }
}

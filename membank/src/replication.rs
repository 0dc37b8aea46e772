//! Write and tombstone fan-out to peer nodes (§4.6). The wire transport
//! itself is an external collaborator (HTTP/WebSocket, unspecified here);
//! this module owns only the protocol: retry/backoff, tombstone suppression,
//! and periodic reconciliation. Callers inject a [`PeerTransport`].

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CResult, Error};
use crate::resolver::{Resolver, ResolverMode};
use crate::value::Item;

/// One outbound unit of replication.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Item(Item),
    Tombstone {
        namespace: String,
        category: String,
        key: String,
    },
}

/// The seam between replication protocol and wire transport. A real
/// deployment backs this with HTTP/WebSocket calls to a peer; tests and the
/// in-process loopback case use an in-memory fake.
pub trait PeerTransport: Send + Sync {
    fn send(&self, peer: &str, envelope: &Envelope) -> CResult<()>;

    /// Items changed at `peer` since `since_ms`, used by periodic sync.
    fn list_since(&self, peer: &str, since_ms: i64) -> CResult<Vec<Item>>;
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub peers: Vec<String>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub sync_interval_ms: Option<u64>,
    pub resolver_mode: ResolverMode,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            peers: Vec::new(),
            retry_attempts: 3,
            retry_delay_ms: 1000,
            sync_interval_ms: None,
            resolver_mode: ResolverMode::VectorClock,
        }
    }
}

/// Exponential backoff delay for the `attempt`-th retry (0-indexed),
/// doubling each time and capped at `base_delay_ms * 2^6` to bound the tail.
/// Shared with the tabular backend's `StorageUnavailable` retry policy.
pub fn backoff_delay_ms(attempt: u32, base_delay_ms: u64) -> u64 {
    let cap_shift = 6u32;
    let shift = attempt.min(cap_shift);
    base_delay_ms.saturating_mul(1u64 << shift)
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub sent: u64,
    pub undelivered: u64,
    pub received: u64,
    pub suppressed_tombstone_resurrections: u64,
}

struct PendingTombstone {
    suppress_until_ms: i64,
}

pub struct Replicator {
    config: ReplicationConfig,
    transport: Box<dyn PeerTransport>,
    resolver: Box<dyn Resolver>,
    stats: ReplicationStats,
    recent_tombstones: HashMap<String, PendingTombstone>,
    last_sync_ms: i64,
}

impl Replicator {
    pub fn new(config: ReplicationConfig, transport: Box<dyn PeerTransport>) -> Self {
        let resolver = crate::resolver::resolver_for_mode(config.resolver_mode);
        Replicator {
            config,
            transport,
            resolver,
            stats: ReplicationStats::default(),
            recent_tombstones: HashMap::new(),
            last_sync_ms: 0,
        }
    }

    pub fn has_peers(&self) -> bool {
        !self.config.peers.is_empty()
    }

    /// Outgoing path: fan the envelope out to every configured peer,
    /// retrying each with exponential backoff. A peer that exhausts its
    /// retries is recorded as undelivered; local state is unaffected.
    ///
    /// `sleep` is injected so tests run instantly instead of blocking on
    /// real wall-clock backoff.
    pub fn replicate(&mut self, envelope: &Envelope, sleep: &dyn Fn(Duration)) {
        for peer in self.config.peers.clone() {
            let mut delivered = false;
            for attempt in 0..self.config.retry_attempts {
                match self.transport.send(&peer, envelope) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(_) => {
                        let delay = backoff_delay_ms(attempt, self.config.retry_delay_ms);
                        sleep(Duration::from_millis(delay));
                    }
                }
            }
            if delivered {
                self.stats.sent += 1;
            } else {
                self.stats.undelivered += 1;
                log::warn!("replication to peer {peer} exhausted retries, marking undelivered");
            }
        }
    }

    /// Incoming path for a replicated item: resolve against any existing
    /// local item and return what should be stored (caller persists via the
    /// manager's normal write path, skipping re-replication).
    pub fn receive_item(
        &mut self,
        existing: Option<&Item>,
        incoming: &Item,
        now_ms: i64,
        local_node_id: &str,
        next_counter: u64,
    ) -> Item {
        self.stats.received += 1;
        let key = tombstone_key(incoming.namespace(), &incoming.category, &incoming.key);
        self.recent_tombstones.remove(&key);
        match existing {
            Some(e) => self.resolver.resolve(e, incoming, now_ms, local_node_id, next_counter),
            None => incoming.clone(),
        }
    }

    /// Incoming tombstone: returns `true` if the caller should delete
    /// locally. Remembers the tombstone so a late in-flight write for the
    /// same key is suppressed rather than resurrecting the deleted item.
    pub fn receive_tombstone(
        &mut self,
        namespace: &str,
        category: &str,
        key: &str,
        existed_locally: bool,
        now_ms: i64,
    ) -> bool {
        self.stats.received += 1;
        let suppress_window_ms =
            (self.config.retry_attempts as i64) * (self.config.retry_delay_ms as i64) * 2;
        self.recent_tombstones.insert(
            tombstone_key(namespace, category, key),
            PendingTombstone {
                suppress_until_ms: now_ms + suppress_window_ms,
            },
        );
        existed_locally
    }

    /// Whether an incoming write for this key arrived inside a recent
    /// tombstone's suppression window and should be dropped.
    pub fn is_suppressed(&mut self, namespace: &str, category: &str, key: &str, now_ms: i64) -> bool {
        let tk = tombstone_key(namespace, category, key);
        let suppressed = match self.recent_tombstones.get(&tk) {
            Some(pending) => now_ms < pending.suppress_until_ms,
            None => false,
        };
        if suppressed {
            self.stats.suppressed_tombstone_resurrections += 1;
        }
        // Drop expired entries opportunistically.
        self.recent_tombstones.retain(|_, p| p.suppress_until_ms > now_ms);
        suppressed
    }

    pub fn should_sync(&self, now_ms: i64) -> bool {
        match self.config.sync_interval_ms {
            Some(interval) => now_ms - self.last_sync_ms >= interval as i64,
            None => false,
        }
    }

    /// Periodic reconciliation: pull every peer's changes since the last
    /// sync and return them for the caller to apply through the resolver.
    pub fn sync(&mut self, now_ms: i64) -> CResult<Vec<Item>> {
        let mut changed = Vec::new();
        for peer in self.config.peers.clone() {
            match self.transport.list_since(&peer, self.last_sync_ms) {
                Ok(items) => changed.extend(items),
                Err(e) => {
                    log::warn!("periodic sync with peer {peer} failed: {e}");
                    return Err(Error::StorageUnavailable(format!(
                        "sync with peer {peer} failed"
                    )));
                }
            }
        }
        self.last_sync_ms = now_ms;
        Ok(changed)
    }

    pub fn get_stats(&self) -> ReplicationStats {
        self.stats.clone()
    }

    pub fn close(&mut self) -> CResult<()> {
        Ok(())
    }
}

fn tombstone_key(namespace: &str, category: &str, key: &str) -> String {
    crate::value::composite_key(namespace, category, key)
}

//! Known peers and their unseen-message counters.
//!
//! Counts are advisory display state. An entry exists only while its count
//! is positive; clearing a peer removes the entry instead of storing zero.
//! A listing fetched before the cache was cleared is not applied.

use crate::api::{ChatApi, PeerListing};
use crate::bus::{Event, EventBus, NotificationLevel};
use crate::entity::{Peer, PeerId, PeerView};
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
pub struct DirectoryCache {
    peers: Vec<Peer>,
    unseen: HashMap<PeerId, u32>,
    epoch: u64,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace peers and counts wholesale. Zero counts are dropped.
    pub fn replace(&mut self, listing: PeerListing) {
        self.peers = listing.peers;
        self.unseen = listing
            .unseen
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect();
    }

    /// Bumped by every [`DirectoryCache::clear`].
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Replace only if the cache was not cleared since `epoch` was read.
    pub fn replace_if_current(&mut self, epoch: u64, listing: PeerListing) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.replace(listing);
        true
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    /// Peers whose display name contains `query`, ignoring case. An empty
    /// query matches everyone.
    pub fn search(&self, query: &str) -> Vec<&Peer> {
        let needle = query.trim().to_lowercase();
        self.peers
            .iter()
            .filter(|p| needle.is_empty() || p.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn unseen(&self, peer: &PeerId) -> u32 {
        self.unseen.get(peer).copied().unwrap_or(0)
    }

    pub fn unseen_counts(&self) -> &HashMap<PeerId, u32> {
        &self.unseen
    }

    /// Returns the new count.
    pub fn increment(&mut self, peer: &PeerId) -> u32 {
        let count = self.unseen.entry(peer.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns whether an entry was removed.
    pub fn clear_unseen(&mut self, peer: &PeerId) -> bool {
        self.unseen.remove(peer).is_some()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.unseen.clear();
        self.epoch += 1;
    }
}

/// Async front of [`DirectoryCache`], fed by the chat collaborator.
pub struct Directory {
    api: Arc<dyn ChatApi>,
    bus: Arc<EventBus>,
    cache: RwLock<DirectoryCache>,
}

impl Directory {
    pub fn new(api: Arc<dyn ChatApi>, bus: Arc<EventBus>) -> Self {
        Self {
            api,
            bus,
            cache: RwLock::new(DirectoryCache::new()),
        }
    }

    /// Fetch the peer list and unseen counts and replace both. On failure
    /// the previous contents stay.
    pub async fn refresh_peers(&self) -> Result<()> {
        let epoch = self.cache.read().await.epoch();
        match self.api.list_peers().await {
            Ok(listing) => {
                let peers = listing.peers.len();
                let with_unseen = listing.unseen.values().filter(|c| **c > 0).count();
                if !self.cache.write().await.replace_if_current(epoch, listing) {
                    debug!("Directory cleared while refreshing, discarding listing");
                    return Ok(());
                }
                info!(
                    "Directory refreshed: {} peers, {} with unseen messages",
                    peers, with_unseen
                );
                self.bus.publish(Event::PeersRefreshed);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh peers: {}", e);
                self.bus.notify(NotificationLevel::Error, e.user_message());
                Err(e)
            }
        }
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.cache.read().await.peers().to_vec()
    }

    pub async fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.cache.read().await.peer(id).cloned()
    }

    /// Search results with presence from `online`.
    pub async fn search(&self, query: &str, online: &HashSet<PeerId>) -> Vec<PeerView> {
        self.cache
            .read()
            .await
            .search(query)
            .into_iter()
            .map(|peer| PeerView {
                online: online.contains(&peer.id),
                peer: peer.clone(),
            })
            .collect()
    }

    pub async fn unseen(&self, peer: &PeerId) -> u32 {
        self.cache.read().await.unseen(peer)
    }

    pub async fn unseen_counts(&self) -> HashMap<PeerId, u32> {
        self.cache.read().await.unseen_counts().clone()
    }

    pub async fn increment_unseen(&self, peer: &PeerId) -> u32 {
        let count = self.cache.write().await.increment(peer);
        debug!("Unseen count for {} is now {}", peer, count);
        self.bus.publish(Event::UnseenChanged {
            peer: peer.clone(),
            count,
        });
        count
    }

    pub async fn clear_unseen(&self, peer: &PeerId) {
        if self.cache.write().await.clear_unseen(peer) {
            self.bus.publish(Event::UnseenChanged {
                peer: peer.clone(),
                count: 0,
            });
        }
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
        self.bus.publish(Event::PeersRefreshed);
    }
}

//! Single-flight registry of running dispatches

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use whatsend_common::types::{CampaignId, CampaignMessageId};

use super::events::DispatchProgress;

struct ActiveDispatch {
    cancel: CancellationToken,
    progress: DispatchProgress,
    in_flight: HashSet<CampaignMessageId>,
}

/// Campaigns currently dispatching in this process.
///
/// At most one entry per campaign. A stopped dispatch keeps its entry,
/// marked as stopping, until the owning [`DispatchGuard`] drops, so the
/// campaign cannot be claimed again while its last batch is still sending.
#[derive(Default)]
pub struct DispatchRegistry {
    active: Mutex<HashMap<CampaignId, ActiveDispatch>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CampaignId, ActiveDispatch>> {
        // The map stays consistent even if a holder panicked
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a campaign; `None` when a dispatch for it is already running
    pub fn try_acquire(self: &Arc<Self>, campaign_id: CampaignId) -> Option<DispatchGuard> {
        let mut active = self.lock();
        if active.contains_key(&campaign_id) {
            return None;
        }

        let cancel = CancellationToken::new();
        active.insert(
            campaign_id,
            ActiveDispatch {
                cancel: cancel.clone(),
                progress: DispatchProgress::new(campaign_id),
                in_flight: HashSet::new(),
            },
        );

        Some(DispatchGuard {
            registry: Arc::clone(self),
            campaign_id,
            cancel,
        })
    }

    /// Cancel a running dispatch.
    ///
    /// Returns the messages of the batch in flight, or `None` when the
    /// campaign is not dispatching or is already stopping. The entry is
    /// released only when the dispatch's guard drops.
    pub fn stop(&self, campaign_id: CampaignId) -> Option<Vec<CampaignMessageId>> {
        let mut active = self.lock();
        let entry = active.get_mut(&campaign_id)?;
        if entry.cancel.is_cancelled() {
            return None;
        }
        entry.cancel.cancel();
        Some(entry.in_flight.iter().copied().collect())
    }

    /// Progress of a running dispatch; `None` once it is stopping
    pub fn progress(&self, campaign_id: CampaignId) -> Option<DispatchProgress> {
        self.lock()
            .get(&campaign_id)
            .filter(|d| !d.cancel.is_cancelled())
            .map(|d| d.progress.clone())
    }

    /// Whether the campaign is claimed, including a dispatch still stopping
    pub fn is_active(&self, campaign_id: CampaignId) -> bool {
        self.lock().contains_key(&campaign_id)
    }
}

/// Ownership of one campaign's dispatch slot
pub struct DispatchGuard {
    registry: Arc<DispatchRegistry>,
    campaign_id: CampaignId,
    cancel: CancellationToken,
}

impl DispatchGuard {
    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `f` against this dispatch's registry entry
    fn with_entry<R>(&self, f: impl FnOnce(&mut ActiveDispatch) -> R) -> Option<R> {
        self.registry.lock().get_mut(&self.campaign_id).map(f)
    }

    pub fn update_progress(&self, f: impl FnOnce(&mut DispatchProgress)) {
        self.with_entry(|entry| f(&mut entry.progress));
    }

    pub fn progress(&self) -> Option<DispatchProgress> {
        self.with_entry(|entry| entry.progress.clone())
    }

    /// Record the batch about to be sent.
    ///
    /// Returns false, recording nothing, once the dispatch has been stopped;
    /// the check and the record happen under the same lock as [`DispatchRegistry::stop`].
    pub fn begin_batch(&self, ids: impl IntoIterator<Item = CampaignMessageId>) -> bool {
        self.with_entry(|entry| {
            if entry.cancel.is_cancelled() {
                return false;
            }
            entry.in_flight = ids.into_iter().collect();
            true
        })
        .unwrap_or(false)
    }

    pub fn end_batch(&self) {
        self.with_entry(|entry| entry.in_flight.clear());
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        // Only the guard removes the entry; a stop leaves it in place
        self.registry.lock().remove(&self.campaign_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_single_flight_per_campaign() {
        let registry = Arc::new(DispatchRegistry::new());
        let campaign = Uuid::new_v4();

        let guard = registry.try_acquire(campaign).unwrap();
        assert!(registry.try_acquire(campaign).is_none());
        assert!(registry.try_acquire(Uuid::new_v4()).is_some());

        drop(guard);
        assert!(!registry.is_active(campaign));
        assert!(registry.try_acquire(campaign).is_some());
    }

    #[test]
    fn test_stop_returns_in_flight_and_blocks_next_batch() {
        let registry = Arc::new(DispatchRegistry::new());
        let campaign = Uuid::new_v4();
        let guard = registry.try_acquire(campaign).unwrap();

        let message = Uuid::new_v4();
        assert!(guard.begin_batch([message]));
        assert_eq!(registry.stop(campaign), Some(vec![message]));

        assert!(guard.is_cancelled());
        assert!(!guard.begin_batch([Uuid::new_v4()]));
        assert!(registry.stop(campaign).is_none());
        assert!(registry.progress(campaign).is_none());
    }

    #[test]
    fn test_stopping_dispatch_blocks_reacquire_until_guard_drops() {
        let registry = Arc::new(DispatchRegistry::new());
        let campaign = Uuid::new_v4();

        let stopping = registry.try_acquire(campaign).unwrap();
        assert!(stopping.begin_batch([Uuid::new_v4()]));
        registry.stop(campaign);

        assert!(registry.is_active(campaign));
        assert!(registry.try_acquire(campaign).is_none());

        drop(stopping);
        assert!(!registry.is_active(campaign));
        let next = registry.try_acquire(campaign).unwrap();
        next.update_progress(|p| p.sent = 3);
        assert_eq!(registry.progress(campaign).map(|p| p.sent), Some(3));
    }
}

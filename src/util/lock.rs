use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::db::models::fixture::MatchId;

/// Per-match async locks shared by settlement and wager placement.
///
/// Holding a match's guard keeps a settlement's read-reverse-apply sequence from interleaving
/// with another settlement or wager write on the same match within this process. Writers in
/// other processes are caught by the store's match version check instead.
///
/// A slot lives only while someone holds or waits on it: idle slots are dropped on the next
/// `lock` call, so the map is bounded by the number of matches with work in flight.
#[derive(Debug, Clone, Default)]
pub struct MatchLocks {
    inner: Arc<Mutex<HashMap<MatchId, Arc<AsyncMutex<()>>>>>,
}

impl MatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, match_id: MatchId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // the map's own reference is the only one left on an idle slot
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(match_id).or_default().clone()
        };

        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

//! Session id -> live episode map.
//!
//! The store is the only state shared between concurrent remote calls. It serializes creation
//! and removal; calls for one session are expected to arrive one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::episode::{Episode, EpisodeError, EpisodeParams};

pub type SessionId = u64;

pub type EpisodeHandle = Arc<Mutex<Episode>>;

/// Result of [`SessionStore::get_or_create`].
#[derive(Debug)]
pub struct Lookup {
    pub episode: EpisodeHandle,
    /// True if this call created (and reset) the episode.
    pub created: bool,
}

#[derive(Debug)]
pub struct SessionStore {
    params: EpisodeParams,
    live: Mutex<HashMap<SessionId, EpisodeHandle>>,
    created: AtomicU64,
}

impl SessionStore {
    pub fn new(params: EpisodeParams) -> Self {
        Self {
            params,
            live: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
        }
    }

    /// Return the live episode for `id`, or create one reset to `initial`.
    ///
    /// An existing episode is returned unchanged and `initial` is ignored. If `initial` is
    /// rejected by `reset`, nothing is inserted.
    pub fn get_or_create(&self, id: SessionId, initial: &[f32]) -> Result<Lookup, EpisodeError> {
        let mut live = self.lock();
        if let Some(ep) = live.get(&id) {
            return Ok(Lookup {
                episode: Arc::clone(ep),
                created: false,
            });
        }
        let mut ep = Episode::new(id, self.params);
        ep.reset(initial.to_vec())?;
        ep.set_ordinal(self.created.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = Arc::new(Mutex::new(ep));
        live.insert(id, Arc::clone(&handle));
        Ok(Lookup {
            episode: handle,
            created: true,
        })
    }

    pub fn get(&self, id: SessionId) -> Option<EpisodeHandle> {
        self.lock().get(&id).cloned()
    }

    /// Drop the episode for `id`; the next `get_or_create` starts a new one.
    pub fn remove(&self, id: SessionId) -> Option<EpisodeHandle> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Episodes created over the store's lifetime.
    pub fn episodes_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn params(&self) -> EpisodeParams {
        self.params
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, EpisodeHandle>> {
        // A panicking holder cannot leave the map half-updated; keep serving.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lock one episode, tolerating poisoning from a panicked handler.
pub fn lock_episode(h: &EpisodeHandle) -> MutexGuard<'_, Episode> {
    h.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use po_core::RewardConfig;

    use super::*;
    use crate::episode::EpisodePhase;

    fn store() -> SessionStore {
        SessionStore::new(EpisodeParams {
            state_len: 2,
            reward: RewardConfig::default(),
        })
    }

    #[test]
    fn first_lookup_creates_and_resets() {
        let s = store();
        let l = s.get_or_create(7, &[1.0, 2.0]).unwrap();
        assert!(l.created);
        let ep = lock_episode(&l.episode);
        assert_eq!(ep.phase(), EpisodePhase::AwaitingAction);
        assert_eq!(ep.state(), &[1.0, 2.0]);
        assert_eq!(ep.session(), 7);
    }

    #[test]
    fn second_lookup_returns_same_episode_unchanged() {
        let s = store();
        let a = s.get_or_create(1, &[1.0, 2.0]).unwrap();
        let b = s.get_or_create(1, &[9.0, 9.0]).unwrap();
        assert!(!b.created);
        assert!(Arc::ptr_eq(&a.episode, &b.episode));
        assert_eq!(lock_episode(&b.episode).state(), &[1.0, 2.0]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn remove_then_lookup_starts_fresh_episode() {
        let s = store();
        let a = s.get_or_create(1, &[1.0, 2.0]).unwrap();
        assert!(s.remove(1).is_some());
        assert!(!s.contains(1));
        let b = s.get_or_create(1, &[3.0, 4.0]).unwrap();
        assert!(b.created);
        assert!(!Arc::ptr_eq(&a.episode, &b.episode));
        assert_eq!(s.episodes_created(), 2);
        assert_eq!(lock_episode(&b.episode).ordinal(), 2);
        assert_eq!(
            lock_episode(&b.episode).summary().label(),
            "session-1-episode-2"
        );
    }

    #[test]
    fn rejected_initial_state_inserts_nothing() {
        let s = store();
        let err = s.get_or_create(1, &[1.0]).unwrap_err();
        assert!(matches!(err, EpisodeError::BadState { got: 1, expected: 2 }));
        assert!(s.is_empty());
    }

    #[test]
    fn sessions_are_isolated() {
        let s = store();
        s.get_or_create(1, &[1.0, 1.0]).unwrap();
        s.get_or_create(2, &[2.0, 2.0]).unwrap();
        assert_eq!(s.len(), 2);
        s.remove(1);
        assert!(s.contains(2));
        assert_eq!(lock_episode(&s.get(2).unwrap()).state(), &[2.0, 2.0]);
    }

    #[test]
    fn concurrent_creation_has_single_winner() {
        let s = Arc::new(store());
        let n = 16;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let l = s.get_or_create(42, &[i as f32, 0.0]).unwrap();
                    (l.created, l.episode)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(created, _)| *created).count(), 1);
        let first = &results[0].1;
        assert!(results.iter().all(|(_, ep)| Arc::ptr_eq(ep, first)));
        assert_eq!(s.len(), 1);
        assert_eq!(s.episodes_created(), 1);
    }
}

//! State shared by both transports: the policy, the session store and the journal.

use std::sync::Arc;

use po_logging::{now_ms, EpisodeEventV1, Journal};
use po_policy::PolicyOracle;
use po_runtime::{lock_episode, EpisodeParams, EpisodeSummary, SessionId, SessionStore};

use crate::error::ServeError;

pub struct Advisor {
    policy: Arc<dyn PolicyOracle>,
    store: SessionStore,
    journal: Option<Arc<Journal>>,
}

impl Advisor {
    pub fn new(
        policy: Arc<dyn PolicyOracle>,
        params: EpisodeParams,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        Self {
            policy,
            store: SessionStore::new(params),
            journal,
        }
    }

    pub fn policy(&self) -> &dyn PolicyOracle {
        self.policy.as_ref()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_deref()
    }

    /// Remove a finished episode and record its completion.
    pub fn finish(&self, session: SessionId) -> Option<EpisodeSummary> {
        let handle = self.store.remove(session)?;
        let summary = lock_episode(&handle).summary();
        if let Some(j) = self.journal() {
            if let Err(e) = j.record_completion(&summary.label()) {
                eprintln!("[po-serve] completion log write failed: {e}");
            }
            self.record(&summary, "episode_end", None);
        }
        Some(summary)
    }

    /// Abort and remove whatever episode `session` has, if any.
    pub fn abort(&self, session: SessionId, reason: &ServeError) -> Option<EpisodeSummary> {
        let handle = self.store.remove(session)?;
        let summary = {
            let mut ep = lock_episode(&handle);
            ep.abort();
            ep.summary()
        };
        eprintln!(
            "[po-serve] session {session}: episode aborted after {} step(s): {reason}",
            summary.steps
        );
        self.record(&summary, "episode_aborted", Some(reason.to_string()));
        Some(summary)
    }

    fn record(&self, summary: &EpisodeSummary, event: &'static str, error: Option<String>) {
        let Some(j) = self.journal() else {
            return;
        };
        let ev = EpisodeEventV1 {
            event,
            ts_ms: now_ms(),
            session: summary.session,
            unit: summary.unit.clone(),
            steps: summary.steps,
            cumulative_reward: summary.cumulative_reward,
            actions: summary.trace.clone(),
            aborted: summary.aborted,
            error,
        };
        if let Err(e) = j.record_event(&ev) {
            eprintln!("[po-serve] event log write failed: {e}");
        }
    }
}

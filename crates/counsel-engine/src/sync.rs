use std::sync::Arc;

use tracing::instrument;

use counsel_core::model::Session;
use counsel_store::{SessionStore, StoreError, SyncBackend};

/// Merges the remote session list into the local store.
///
/// Remote metadata (title, pin state, recency) wins; local message
/// history wins whenever it is non-empty, so an in-progress conversation
/// is never clobbered by a stale remote copy. History for sessions the
/// store has never seen is fetched from the backend.
pub struct Reconciler {
    store: Arc<SessionStore>,
}

impl Reconciler {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, backend))]
    pub async fn reconcile(&self, backend: &dyn SyncBackend) -> Result<(), StoreError> {
        let summaries = backend.list_summaries().await?;
        let local = self.store.sessions();

        // Remote history is only worth fetching for sessions with no
        // local messages; the merge prefers local history anyway, read
        // fresh under the store lock so nothing landing during these
        // awaits is lost.
        let mut remote = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            let needs_fetch = local
                .iter()
                .find(|s| s.id == summary.id)
                .map_or(true, |s| s.messages.is_empty());
            let messages = if needs_fetch {
                match backend.fetch_messages(&summary.id).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(session = %summary.id, error = %e, "history fetch failed");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            remote.push(Session {
                id: summary.id.clone(),
                title: summary.title.clone(),
                messages,
                updated_at: summary.updated_at,
                is_pinned: summary.is_pinned,
            });
        }

        // Pinned sessions first, in remote order; the rest newest first.
        let (pinned, mut unpinned): (Vec<Session>, Vec<Session>) =
            remote.into_iter().partition(|s| s.is_pinned);
        unpinned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut result = pinned;
        result.extend(unpinned);

        self.store.merge_sessions(result);
        Ok(())
    }
}

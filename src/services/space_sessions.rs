//! Per-space runtime state that is not persisted: cached directory
//! registrations and open sync-request windows.

use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::services::api_client::{DirectoryApi, SpaceRegistration};

/// A peer that answered a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCandidate {
    pub inbox_address: String,
    pub message_count: usize,
    pub member_count: usize,
}

#[derive(Default)]
struct SyncWindow {
    expiry: i64,
    candidates: Vec<SyncCandidate>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct SpaceSessions {
    registrations: RwLock<HashMap<String, SpaceRegistration>>,
    windows: Mutex<HashMap<String, SyncWindow>>,
}

impl SpaceSessions {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registrations ──────────────────────────────────────────

    /// Cached registration, fetched from the directory on first use.
    pub async fn registration(
        &self,
        api: &dyn DirectoryApi,
        space_id: &str,
    ) -> Result<SpaceRegistration> {
        if let Some(reg) = self.registrations.read().await.get(space_id) {
            return Ok(reg.clone());
        }
        let reg = api.get_space(space_id).await?;
        self.registrations
            .write()
            .await
            .insert(space_id.to_string(), reg.clone());
        Ok(reg)
    }

    pub async fn set_registration(&self, space_id: &str, registration: SpaceRegistration) {
        self.registrations
            .write()
            .await
            .insert(space_id.to_string(), registration);
    }

    pub async fn forget_registration(&self, space_id: &str) {
        self.registrations.write().await.remove(space_id);
    }

    /// Is `public_key_hex` one of the space's registered owner keys?
    pub async fn is_owner_key(
        &self,
        api: &dyn DirectoryApi,
        space_id: &str,
        public_key_hex: &str,
    ) -> bool {
        match self.registration(api, space_id).await {
            Ok(reg) => reg.owner_public_keys.iter().any(|k| k == public_key_hex),
            Err(e) => {
                log::warn!("No registration for space {}: {}", space_id, e);
                false
            }
        }
    }

    // ── Sync windows ───────────────────────────────────────────

    /// Start collecting candidates until `expiry`, replacing any earlier window.
    pub async fn open_window(&self, space_id: &str, expiry: i64) {
        let mut windows = self.windows.lock().await;
        if let Some(old) = windows.remove(space_id) {
            if let Some(timer) = old.timer {
                timer.abort();
            }
        }
        windows.insert(
            space_id.to_string(),
            SyncWindow {
                expiry,
                ..Default::default()
            },
        );
    }

    pub async fn is_window_open(&self, space_id: &str, now: i64) -> bool {
        self.windows
            .lock()
            .await
            .get(space_id)
            .is_some_and(|w| w.expiry > now)
    }

    /// Record a candidate. Returns false when no window is open.
    pub async fn push_candidate(&self, space_id: &str, candidate: SyncCandidate, now: i64) -> bool {
        let mut windows = self.windows.lock().await;
        match windows.get_mut(space_id) {
            Some(window) if window.expiry > now => {
                window.candidates.retain(|c| c.inbox_address != candidate.inbox_address);
                window.candidates.push(candidate);
                true
            }
            _ => false,
        }
    }

    /// Install the settle timer for a window, aborting the one it replaces.
    pub async fn set_timer(&self, space_id: &str, timer: JoinHandle<()>) {
        let mut windows = self.windows.lock().await;
        match windows.get_mut(space_id) {
            Some(window) => {
                if let Some(old) = window.timer.replace(timer) {
                    old.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Hand back what the window collected so far.
    pub async fn take_candidates(&self, space_id: &str) -> Vec<SyncCandidate> {
        self.windows
            .lock()
            .await
            .get_mut(space_id)
            .map(|w| std::mem::take(&mut w.candidates))
            .unwrap_or_default()
    }

    /// Whether this client asked the space for a sync since the window was
    /// last closed. Solicited sync data is accepted from any member.
    pub async fn has_requested(&self, space_id: &str) -> bool {
        self.windows.lock().await.contains_key(space_id)
    }

    pub async fn close_window(&self, space_id: &str) {
        if let Some(window) = self.windows.lock().await.remove(space_id) {
            if let Some(timer) = window.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(inbox: &str, messages: usize) -> SyncCandidate {
        SyncCandidate {
            inbox_address: inbox.into(),
            message_count: messages,
            member_count: 1,
        }
    }

    #[tokio::test]
    async fn test_candidates_only_while_open() {
        let sessions = SpaceSessions::new();
        assert!(!sessions.push_candidate("s", candidate("a", 1), 0).await);

        sessions.open_window("s", 100).await;
        assert!(sessions.is_window_open("s", 50).await);
        assert!(sessions.push_candidate("s", candidate("a", 1), 50).await);
        assert!(sessions.push_candidate("s", candidate("a", 7), 60).await);
        assert!(!sessions.push_candidate("s", candidate("b", 2), 100).await);

        let taken = sessions.take_candidates("s").await;
        assert_eq!(taken, vec![candidate("a", 7)]);
        assert!(sessions.take_candidates("s").await.is_empty());
        assert!(sessions.has_requested("s").await);

        sessions.close_window("s").await;
        assert!(!sessions.has_requested("s").await);
    }

    #[tokio::test]
    async fn test_replacing_timer_aborts_previous() {
        let sessions = SpaceSessions::new();
        sessions.open_window("s", i64::MAX).await;
        let first = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let handle = first.abort_handle();
        sessions.set_timer("s", first).await;
        sessions.set_timer("s", tokio::spawn(async {})).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }
}

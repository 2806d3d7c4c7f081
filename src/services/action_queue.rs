//! Persistent background task queue.
//!
//! Sends and moderation actions are enqueued with a dedupe key and
//! processed by a polling loop with exponential backoff. The queue is
//! written to `{data_dir}/action_queue.json` after every change so a crash
//! never loses or double-runs a task: tasks caught in `processing` go back
//! to `pending` on the next start.

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::error::{QuorumError, Result};
use crate::services::config::ActionQueueSettings;

const QUEUE_FILE: &str = "action_queue.json";
const SESSION_EXPIRED: &str = "Session expired. Please log in again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    SendChannelMessage,
    SendDm,
    UpdateSpace,
    KickUser,
    MuteUser,
    UnmuteUser,
    PinMessage,
    UnpinMessage,
    EditMessage,
    DeleteMessage,
    Reaction,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendChannelMessage => "send-channel-message",
            ActionKind::SendDm => "send-dm",
            ActionKind::UpdateSpace => "update-space",
            ActionKind::KickUser => "kick-user",
            ActionKind::MuteUser => "mute-user",
            ActionKind::UnmuteUser => "unmute-user",
            ActionKind::PinMessage => "pin-message",
            ActionKind::UnpinMessage => "unpin-message",
            ActionKind::EditMessage => "edit-message",
            ActionKind::DeleteMessage => "delete-message",
            ActionKind::Reaction => "reaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub id: u64,
    pub task_type: ActionKind,
    pub context: serde_json::Value,
    pub key: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: i64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Counts from one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Work for one task kind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, context: &serde_json::Value) -> Result<()>;

    /// Permanent errors fail the task without retrying.
    fn is_permanent_error(&self, error: &QuorumError) -> bool;

    /// Called once when the task ends in `failed`.
    async fn on_failure(&self, context: &serde_json::Value, error: &QuorumError);
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct QueueFile {
    next_id: u64,
    tasks: BTreeMap<u64, QueueTask>,
}

pub struct ActionQueue {
    settings: ActionQueueSettings,
    state: Mutex<QueueFile>,
    handlers: RwLock<HashMap<ActionKind, Arc<dyn ActionHandler>>>,
    path: Option<PathBuf>,
    processing: AtomicBool,
    wake: Notify,
    online: std::sync::RwLock<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
}

impl ActionQueue {
    /// Create a queue; with a data dir it is loaded from and saved to disk.
    pub fn new(settings: ActionQueueSettings, data_dir: Option<PathBuf>) -> Self {
        let path = data_dir.map(|d| d.join(QUEUE_FILE));
        let state = path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .map(|raw| {
                serde_json::from_str::<QueueFile>(&raw).unwrap_or_else(|e| {
                    log::warn!("Failed to parse action queue, starting empty: {}", e);
                    QueueFile::default()
                })
            })
            .unwrap_or_default();

        if !state.tasks.is_empty() {
            log::info!("Loaded {} queued actions", state.tasks.len());
        }

        Self {
            settings,
            state: Mutex::new(state),
            handlers: RwLock::new(HashMap::new()),
            path,
            processing: AtomicBool::new(false),
            wake: Notify::new(),
            online: std::sync::RwLock::new(None),
        }
    }

    pub async fn register(&self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(kind, handler);
    }

    /// Processing pauses while `check` returns false.
    pub fn set_online_check(&self, check: Box<dyn Fn() -> bool + Send + Sync>) {
        match self.online.write() {
            Ok(mut slot) => *slot = Some(check),
            Err(poisoned) => *poisoned.into_inner() = Some(check),
        }
    }

    fn is_online(&self) -> bool {
        match self.online.read() {
            Ok(slot) => slot.as_ref().map(|f| f()).unwrap_or(true),
            Err(_) => true,
        }
    }

    fn persist(&self, state: &QueueFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(state)?;
        std::fs::write(path, body)
            .map_err(|e| QuorumError::Queue(format!("Failed to write action queue: {}", e)))
    }

    pub fn backoff_ms(&self, retry_count: u32) -> i64 {
        let factor = 2u64.saturating_pow(retry_count);
        self.settings
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.settings.max_backoff_ms) as i64
    }

    /// Add a task. A pending or running task with the same key is reused.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        context: serde_json::Value,
        key: &str,
    ) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.tasks.values().find(|t| {
            t.key == key && matches!(t.status, TaskStatus::Pending | TaskStatus::Processing)
        }) {
            log::debug!("Action {} already queued as task {}", key, existing.id);
            return Ok(existing.id);
        }

        if state.tasks.len() >= self.settings.max_queue_size {
            self.prune(&mut state, now);
            let pending = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .count();
            if pending >= self.settings.max_queue_size / 2 {
                return Err(QuorumError::Queue(
                    "Action queue is full. Please try again later.".to_string(),
                ));
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(
            id,
            QueueTask {
                id,
                task_type: kind,
                context,
                key: key.to_string(),
                status: TaskStatus::Pending,
                retry_count: 0,
                max_retries: self.settings.max_retries,
                next_retry_at: now,
                created_at: now,
                processing_started_at: None,
                processed_at: None,
                error: None,
            },
        );
        self.persist(&state)?;
        drop(state);

        log::info!("Enqueued {} task {}", kind.as_str(), id);
        self.wake.notify_one();
        Ok(id)
    }

    /// Drop completed and failed tasks older than the age limit.
    fn prune(&self, state: &mut QueueFile, now: i64) {
        let cutoff = now - self.settings.max_age_days * 24 * 60 * 60 * 1000;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| match t.status {
            TaskStatus::Completed | TaskStatus::Failed => {
                t.processed_at.unwrap_or(t.created_at) >= cutoff
            }
            _ => true,
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            log::info!("Pruned {} old queue tasks", removed);
        }
    }

    pub async fn prune_old_tasks(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.prune(&mut state, Utc::now().timestamp_millis());
        self.persist(&state)
    }

    /// Return tasks left in `processing` by a crash to `pending`.
    pub async fn reset_stuck_tasks(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Processing {
                task.status = TaskStatus::Pending;
                task.processing_started_at = None;
                reset += 1;
            }
        }
        if reset > 0 {
            log::info!("Reset {} stuck tasks on startup", reset);
            self.persist(&state)?;
        }
        Ok(reset)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub async fn task(&self, id: u64) -> Option<QueueTask> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    pub async fn process_batch(&self) -> Result<BatchOutcome> {
        self.process_ready(Utc::now().timestamp_millis()).await
    }

    /// Run every pending task due at `now`, oldest first, one at a time.
    async fn process_ready(&self, now: i64) -> Result<BatchOutcome> {
        if !self.is_online() {
            return Ok(BatchOutcome::default());
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return Ok(BatchOutcome::default());
        }
        let result = self.run_ready(now).await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn run_ready(&self, now: i64) -> Result<BatchOutcome> {
        let ready: Vec<u64> = {
            let state = self.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending && t.next_retry_at <= now)
                .take(self.settings.batch_size)
                .map(|t| t.id)
                .collect()
        };

        let mut outcome = BatchOutcome::default();
        for id in ready {
            self.run_task(id, &mut outcome).await?;
        }
        Ok(outcome)
    }

    async fn run_task(&self, id: u64, outcome: &mut BatchOutcome) -> Result<()> {
        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.tasks.get_mut(&id) else {
                return Ok(());
            };
            if task.status != TaskStatus::Pending {
                return Ok(());
            }
            task.status = TaskStatus::Processing;
            task.processing_started_at = Some(Utc::now().timestamp_millis());
            let snapshot = task.clone();
            self.persist(&state)?;
            snapshot
        };

        let handler = self.handlers.read().await.get(&task.task_type).cloned();
        let Some(handler) = handler else {
            self.update(id, |t| {
                t.status = TaskStatus::Failed;
                t.error = Some(format!(
                    "No handler registered for task type: {}",
                    t.task_type.as_str()
                ));
            })
            .await?;
            outcome.failed += 1;
            return Ok(());
        };

        match handler.execute(&task.context).await {
            Ok(()) => {
                self.update(id, |t| {
                    t.status = TaskStatus::Completed;
                    t.processing_started_at = None;
                    t.processed_at = Some(Utc::now().timestamp_millis());
                    t.error = None;
                })
                .await?;
                outcome.completed += 1;
            }
            Err(err) => {
                let text = err.to_string();
                let auth_expired = text.contains("401") || text.to_lowercase().contains("unauthorized");
                let permanent = auth_expired || handler.is_permanent_error(&err);
                let now = Utc::now().timestamp_millis();

                let mut gave_up = permanent;
                let backoff = self.backoff_ms(task.retry_count + 1);
                self.update(id, |t| {
                    t.processing_started_at = None;
                    if auth_expired {
                        t.status = TaskStatus::Failed;
                        t.error = Some(SESSION_EXPIRED.to_string());
                        t.processed_at = Some(now);
                    } else if permanent {
                        t.status = TaskStatus::Failed;
                        t.error = Some(text.clone());
                        t.processed_at = Some(now);
                    } else {
                        t.retry_count += 1;
                        if t.retry_count >= t.max_retries {
                            t.status = TaskStatus::Failed;
                            t.error = Some(format!("Max retries exceeded: {}", text));
                            t.processed_at = Some(now);
                            gave_up = true;
                        } else {
                            t.status = TaskStatus::Pending;
                            t.next_retry_at = now + backoff;
                            t.error = Some(text.clone());
                        }
                    }
                })
                .await?;

                if gave_up {
                    log::warn!("{} task {} failed: {}", task.task_type.as_str(), id, err);
                    handler.on_failure(&task.context, &err).await;
                    outcome.failed += 1;
                } else {
                    log::info!(
                        "{} task {} will retry in {}ms: {}",
                        task.task_type.as_str(),
                        id,
                        backoff,
                        err
                    );
                    outcome.retried += 1;
                }
            }
        }
        Ok(())
    }

    async fn update(&self, id: u64, f: impl FnOnce(&mut QueueTask)) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&id) {
            f(task);
        }
        self.persist(&state)
    }

    /// Spawn the polling loop. Runs until the returned handle is aborted.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.reset_stuck_tasks().await {
                log::warn!("Failed to reset stuck tasks: {}", e);
            }
            if let Err(e) = self.prune_old_tasks().await {
                log::warn!("Failed to prune action queue: {}", e);
            }
            log::info!("Action queue processor started");
            let interval = tokio::time::Duration::from_millis(self.settings.poll_interval_ms);
            loop {
                if let Err(e) = self.process_batch().await {
                    log::error!("Action queue pass failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.wake.notified() => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings() -> ActionQueueSettings {
        ActionQueueSettings::default()
    }

    #[rstest]
    #[case(0, 2_000)]
    #[case(1, 4_000)]
    #[case(3, 16_000)]
    #[case(10, 300_000)]
    fn test_backoff_is_capped(#[case] retry: u32, #[case] expected: i64) {
        let queue = ActionQueue::new(settings(), None);
        assert_eq!(queue.backoff_ms(retry), expected);
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_by_key() {
        let queue = ActionQueue::new(settings(), None);
        let a = queue
            .enqueue(ActionKind::SendDm, json!({"n": 1}), "send-dm:QmA:m1")
            .await
            .unwrap();
        let b = queue
            .enqueue(ActionKind::SendDm, json!({"n": 2}), "send-dm:QmA:m1")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn test_success_completes_task() {
        let queue = ActionQueue::new(settings(), None);
        let mut handler = MockActionHandler::new();
        handler.expect_execute().times(1).returning(|_| Ok(()));
        handler.expect_on_failure().never();
        queue
            .register(ActionKind::Reaction, Arc::new(handler))
            .await;

        let id = queue
            .enqueue(ActionKind::Reaction, json!({}), "r1")
            .await
            .unwrap();
        let outcome = queue.process_batch().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(queue.task(id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_error_retries_then_fails() {
        let queue = ActionQueue::new(settings(), None);
        let mut handler = MockActionHandler::new();
        handler
            .expect_execute()
            .times(3)
            .returning(|_| Err(QuorumError::Network("offline".into())));
        handler.expect_is_permanent_error().returning(|_| false);
        handler.expect_on_failure().times(1).returning(|_, _| ());
        queue
            .register(ActionKind::SendChannelMessage, Arc::new(handler))
            .await;

        let id = queue
            .enqueue(ActionKind::SendChannelMessage, json!({}), "send:s:c:m")
            .await
            .unwrap();

        let far_future = Utc::now().timestamp_millis() + 10 * 60 * 1000;
        assert_eq!(queue.process_ready(far_future).await.unwrap().retried, 1);
        let task = queue.task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.next_retry_at > Utc::now().timestamp_millis());

        assert_eq!(queue.process_ready(far_future).await.unwrap().retried, 1);
        assert_eq!(queue.process_ready(far_future).await.unwrap().failed, 1);
        let task = queue.task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("Max retries exceeded"));
    }

    #[tokio::test]
    async fn test_unauthorized_fails_with_session_message() {
        let queue = ActionQueue::new(settings(), None);
        let mut handler = MockActionHandler::new();
        handler.expect_execute().returning(|_| {
            Err(QuorumError::Api {
                status: 401,
                message: "Unauthorized".into(),
            })
        });
        handler.expect_is_permanent_error().returning(|_| false);
        handler.expect_on_failure().times(1).returning(|_, _| ());
        queue.register(ActionKind::KickUser, Arc::new(handler)).await;

        let id = queue
            .enqueue(ActionKind::KickUser, json!({}), "kick:s:u")
            .await
            .unwrap();
        queue.process_batch().await.unwrap();
        let task = queue.task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(SESSION_EXPIRED));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task() {
        let queue = ActionQueue::new(settings(), None);
        let id = queue
            .enqueue(ActionKind::UpdateSpace, json!({}), "u1")
            .await
            .unwrap();
        queue.process_batch().await.unwrap();
        let task = queue.task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("update-space"));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let mut s = settings();
        s.max_queue_size = 4;
        let queue = ActionQueue::new(s, None);
        for i in 0..4 {
            queue
                .enqueue(ActionKind::Reaction, json!({}), &format!("k{}", i))
                .await
                .unwrap();
        }
        let err = queue
            .enqueue(ActionKind::Reaction, json!({}), "k4")
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::Queue(_)));
    }

    #[tokio::test]
    async fn test_persisted_processing_task_resets_on_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let queue = ActionQueue::new(settings(), Some(tmp.path().to_path_buf()));
            let id = queue
                .enqueue(ActionKind::SendDm, json!({"a": 1}), "send-dm:x:y")
                .await
                .unwrap();
            queue
                .update(id, |t| t.status = TaskStatus::Processing)
                .await
                .unwrap();
        }
        let reloaded = ActionQueue::new(settings(), Some(tmp.path().to_path_buf()));
        assert_eq!(reloaded.stats().await.processing, 1);
        assert_eq!(reloaded.reset_stuck_tasks().await.unwrap(), 1);
        assert_eq!(reloaded.stats().await.pending, 1);
    }
}

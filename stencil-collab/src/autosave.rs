//! Periodic and on-demand saving of the local editor state.
//!
//! Saves are fire-and-forget. A save that resolves after the scheduler was
//! stopped leaves the editor's dirty/saved flags alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stencil_core::{EditorError, LocalEditorStore};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::store::StoreError;

/// Where drafts go.
#[async_trait]
pub trait DraftSink: Send + Sync {
    async fn save_draft(&self, work_id: &str, slots_json: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    pub interval: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing to save, or a save already in flight.
    Skipped,
    Saved,
    Failed(String),
    /// The scheduler stopped before the save resolved.
    Discarded,
}

pub struct AutosaveScheduler {
    config: AutosaveConfig,
    work_id: Arc<str>,
    editor: Arc<Mutex<LocalEditorStore>>,
    sink: Arc<dyn DraftSink>,
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AutosaveScheduler {
    pub fn new(
        config: AutosaveConfig,
        work_id: impl Into<Arc<str>>,
        editor: Arc<Mutex<LocalEditorStore>>,
        sink: Arc<dyn DraftSink>,
    ) -> Self {
        Self {
            config,
            work_id: work_id.into(),
            editor,
            sink,
            active: Arc::new(AtomicBool::new(true)),
            task: None,
        }
    }

    /// Start the interval timer. The first tick fires one interval from now.
    pub fn start(&mut self) {
        self.stop_timer();
        self.active.store(true, Ordering::SeqCst);

        let period = self.config.interval;
        let work_id = self.work_id.clone();
        let editor = self.editor.clone();
        let sink = self.sink.clone();
        let active = self.active.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let (work_id, editor, sink, active) =
                    (work_id.clone(), editor.clone(), sink.clone(), active.clone());
                tokio::spawn(async move {
                    match run_save(&work_id, &editor, sink.as_ref(), &active).await {
                        Ok(SaveOutcome::Failed(e)) => log::warn!("Autosave of {work_id} failed: {e}"),
                        Ok(outcome) => log::trace!("Autosave of {work_id}: {outcome:?}"),
                        Err(e) => log::error!("Autosave of {work_id} could not snapshot: {e}"),
                    }
                });
            }
        }));
        log::debug!("Autosave started for {} every {:?}", self.work_id, period);
    }

    /// Stop the timer. In-flight saves finish but no longer touch the
    /// editor's flags.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.stop_timer();
    }

    fn stop_timer(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Save right away (the save shortcut). Skipped while stopped.
    pub async fn save_now(&self) -> Result<SaveOutcome, EditorError> {
        if !self.is_active() {
            return Ok(SaveOutcome::Skipped);
        }
        run_save(&self.work_id, &self.editor, self.sink.as_ref(), &self.active).await
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_save(
    work_id: &str,
    editor: &Mutex<LocalEditorStore>,
    sink: &dyn DraftSink,
    active: &AtomicBool,
) -> Result<SaveOutcome, EditorError> {
    let Some(snapshot) = editor.lock().await.begin_save()? else {
        return Ok(SaveOutcome::Skipped);
    };

    let result = sink.save_draft(work_id, &snapshot).await;

    let mut editor = editor.lock().await;
    if !active.load(Ordering::SeqCst) {
        editor.abandon_save();
        return Ok(SaveOutcome::Discarded);
    }
    editor.finish_save(snapshot, result.is_ok());
    Ok(match result {
        Ok(()) => SaveOutcome::Saved,
        Err(e) => SaveOutcome::Failed(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use stencil_core::{Slot, SlotKind};

    #[derive(Default)]
    struct RecordingSink {
        saves: AtomicUsize,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl DraftSink for RecordingSink {
        async fn save_draft(&self, _work_id: &str, _slots_json: &str) -> Result<(), StoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }
    }

    fn dirty_editor() -> Arc<Mutex<LocalEditorStore>> {
        let mut editor = LocalEditorStore::new(Vec::new());
        editor.add_slot(Slot::new(SlotKind::Text, 0.0, 0.0, 50.0, 20.0));
        Arc::new(Mutex::new(editor))
    }

    #[tokio::test]
    async fn test_save_now_clears_dirty() {
        let editor = dirty_editor();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::new(AutosaveConfig::default(), "w1", editor.clone(), sink.clone());

        assert_eq!(scheduler.save_now().await.unwrap(), SaveOutcome::Saved);
        assert!(!editor.lock().await.is_dirty());
        assert_eq!(scheduler.save_now().await.unwrap(), SaveOutcome::Skipped);
        assert_eq!(sink.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_save_stays_dirty() {
        let editor = dirty_editor();
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let scheduler = AutosaveScheduler::new(AutosaveConfig::default(), "w1", editor.clone(), sink);

        assert!(matches!(scheduler.save_now().await.unwrap(), SaveOutcome::Failed(_)));
        let editor = editor.lock().await;
        assert!(editor.is_dirty());
        assert!(!editor.is_saving());
    }

    #[tokio::test]
    async fn test_stopped_scheduler_discards_result() {
        let editor = dirty_editor();
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let mut scheduler = AutosaveScheduler::new(AutosaveConfig::default(), "w1", editor.clone(), sink);

        let (work_id, in_flight, sink, active) = (
            scheduler.work_id.clone(),
            editor.clone(),
            scheduler.sink.clone(),
            scheduler.active.clone(),
        );
        let save = tokio::spawn(async move { run_save(&work_id, &in_flight, sink.as_ref(), &active).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(editor.lock().await.is_saving());
        scheduler.stop();

        assert_eq!(save.await.unwrap().unwrap(), SaveOutcome::Discarded);
        let guard = editor.lock().await;
        assert!(guard.is_dirty());
        assert!(!guard.is_saving());
        drop(guard);

        // The discarded save does not block the next one.
        scheduler.start();
        assert_eq!(scheduler.save_now().await.unwrap(), SaveOutcome::Saved);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_save_now_while_stopped_is_skipped() {
        let editor = dirty_editor();
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = AutosaveScheduler::new(AutosaveConfig::default(), "w1", editor.clone(), sink.clone());

        scheduler.stop();
        assert_eq!(scheduler.save_now().await.unwrap(), SaveOutcome::Skipped);
        assert_eq!(sink.saves.load(Ordering::SeqCst), 0);
        assert!(!editor.lock().await.is_saving());

        scheduler.start();
        assert_eq!(scheduler.save_now().await.unwrap(), SaveOutcome::Saved);
        assert!(!editor.lock().await.should_confirm_exit());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_interval_saves() {
        let editor = dirty_editor();
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = AutosaveScheduler::new(
            AutosaveConfig {
                interval: Duration::from_millis(10),
            },
            "w1",
            editor.clone(),
            sink.clone(),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop();

        assert!(!scheduler.is_active());
        assert_eq!(sink.saves.load(Ordering::SeqCst), 1);
        assert!(!editor.lock().await.is_dirty());
    }
}

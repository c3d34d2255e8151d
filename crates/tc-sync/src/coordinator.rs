//! Per-dataset origin polling with process-wide pause/resume

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use parking_lot::Mutex;
use tc_core::{ContentSource, Dataset, LifecycleObserver, LifecycleState};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::subscriber::{notify_all, CallbackOutcome, ChangeCallback, SubscriberId};
use crate::SyncError;

/// One watched dataset
struct Watch {
    callbacks: Vec<(SubscriberId, ChangeCallback)>,
    /// Last modification time acted upon
    baseline: Option<SystemTime>,
    stop: Arc<Notify>,
}

struct Inner {
    source: Arc<dyn ContentSource>,
    interval: Duration,
    handle: Handle,
    watches: Mutex<AHashMap<Dataset, Watch>>,
    paused: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Watches origins for changes and notifies subscribers.
///
/// Each watched dataset gets one polling task on the runtime given at
/// construction; the blocking metadata query and the callbacks run on the
/// blocking pool.
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(source: Arc<dyn ContentSource>, config: WatchConfig, handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                interval: config.poll_interval(),
                handle,
                watches: Mutex::new(AHashMap::new()),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create a coordinator bound to the runtime of the calling context
    pub fn with_current_runtime(source: Arc<dyn ContentSource>, config: WatchConfig) -> Result<Self, SyncError> {
        let handle = Handle::try_current().map_err(|e| SyncError::Runtime(e.to_string()))?;
        Ok(Self::new(source, config, handle))
    }

    /// Register `callback` for `dataset`, starting its watcher if needed.
    ///
    /// Several callbacks may watch one dataset; they share a single polling task.
    pub fn start_watching(&self, dataset: &Dataset, callback: ChangeCallback) -> Result<SubscriberId, SyncError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let baseline = self.inner.source.modified(&dataset.origin_path);
        let mut watches = self.inner.watches.lock();
        if let Some(watch) = watches.get_mut(dataset) {
            watch.callbacks.push((id, callback));
            debug!("Added {} to existing watch of {}", id, dataset);
            return Ok(id);
        }

        let stop = Arc::new(Notify::new());
        watches.insert(
            dataset.clone(),
            Watch {
                callbacks: vec![(id, callback)],
                baseline,
                stop: stop.clone(),
            },
        );
        drop(watches);

        self.inner.handle.spawn(watch_loop(
            Arc::downgrade(&self.inner),
            dataset.clone(),
            stop,
            self.inner.interval,
        ));
        info!("Started watching {} every {:?}", dataset, self.inner.interval);
        Ok(id)
    }

    /// Stop the watcher for `dataset` and drop its callbacks
    pub fn stop_watching(&self, dataset: &Dataset) -> bool {
        let removed = self.inner.watches.lock().remove(dataset);
        match removed {
            Some(watch) => {
                watch.stop.notify_one();
                info!("Stopped watching {}", dataset);
                true
            }
            None => false,
        }
    }

    /// Unregister one callback; the watch stops when its last callback goes
    pub fn remove_callback(&self, id: SubscriberId) -> bool {
        let mut watches = self.inner.watches.lock();
        let Some(dataset) = watches
            .iter()
            .find(|(_, w)| w.callbacks.iter().any(|(cb_id, _)| *cb_id == id))
            .map(|(ds, _)| ds.clone())
        else {
            return false;
        };

        let now_empty = watches.get_mut(&dataset).is_some_and(|watch| {
            watch.callbacks.retain(|(cb_id, _)| *cb_id != id);
            watch.callbacks.is_empty()
        });
        if now_empty {
            if let Some(watch) = watches.remove(&dataset) {
                watch.stop.notify_one();
                info!("Stopped watching {} (no callbacks left)", dataset);
            }
        }
        true
    }

    /// Check one dataset now, notifying callbacks if its origin got newer.
    ///
    /// Does nothing while paused. Blocking: queries the origin and runs callbacks.
    pub fn poll_once(&self, dataset: &Dataset) -> Vec<CallbackOutcome> {
        self.inner.poll_once(dataset)
    }

    /// Notify every callback of `dataset` immediately, paused or not
    pub fn force_refresh(&self, dataset: &Dataset) -> Vec<CallbackOutcome> {
        let modified = self.inner.source.modified(&dataset.origin_path);
        let callbacks = {
            let mut watches = self.inner.watches.lock();
            let Some(watch) = watches.get_mut(dataset) else {
                return Vec::new();
            };
            if modified.is_some() {
                watch.baseline = modified;
            }
            watch.callbacks.clone()
        };
        info!("Forced refresh of {} ({} callbacks)", dataset, callbacks.len());
        notify_all(dataset, &callbacks)
    }

    pub fn pause_all(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("Refresh polling paused");
        }
    }

    pub fn resume_all(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Refresh polling resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self, dataset: &Dataset) -> bool {
        self.inner.watches.lock().contains_key(dataset)
    }

    pub fn watched(&self) -> Vec<Dataset> {
        self.inner.watches.lock().keys().cloned().collect()
    }

    /// Stop every watcher and refuse new ones
    pub fn cleanup(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.inner.watches.lock().drain().collect();
        for (dataset, watch) in drained {
            watch.stop.notify_one();
            debug!("Stopped watching {} during cleanup", dataset);
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl LifecycleObserver for RefreshCoordinator {
    fn on_lifecycle_change(&self, state: LifecycleState) {
        match state {
            LifecycleState::Foreground => self.resume_all(),
            LifecycleState::Background => self.pause_all(),
        }
    }
}

impl Inner {
    fn poll_once(&self, dataset: &Dataset) -> Vec<CallbackOutcome> {
        if self.paused.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let Some(modified) = self.source.modified(&dataset.origin_path) else {
            return Vec::new();
        };

        let callbacks = {
            let mut watches = self.watches.lock();
            let Some(watch) = watches.get_mut(dataset) else {
                return Vec::new();
            };
            if watch.baseline.is_some_and(|baseline| modified <= baseline) {
                return Vec::new();
            }
            watch.baseline = Some(modified);
            watch.callbacks.clone()
        };

        info!("Origin of {} changed, notifying {} callbacks", dataset, callbacks.len());
        notify_all(dataset, &callbacks)
    }
}

async fn watch_loop(inner: Weak<Inner>, dataset: Dataset, stop: Arc<Notify>, interval: Duration) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(strong) = inner.upgrade() else {
            break;
        };
        let ds = dataset.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || strong.poll_once(&ds)).await {
            warn!("Poll of {} failed: {}", dataset, e);
        }
    }
    debug!("Watch loop for {} exited", dataset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;
    use tc_core::{LifecycleNotifier, SourceMetadata, TableError, TableResult};

    /// Origin whose modification time the test moves by hand
    struct ClockSource {
        modified: Mutex<Option<SystemTime>>,
    }

    impl ClockSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                modified: Mutex::new(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(100))),
            })
        }

        fn touch(&self, secs: u64) {
            *self.modified.lock() = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        }
    }

    impl ContentSource for ClockSource {
        fn open(&self, path: &str) -> TableResult<Box<dyn Read + Send>> {
            Err(TableError::NotFound(path.to_string()))
        }

        fn metadata(&self, _path: &str) -> Option<SourceMetadata> {
            Some(SourceMetadata {
                len: 0,
                modified: *self.modified.lock(),
            })
        }
    }

    fn counter() -> (Arc<AtomicUsize>, ChangeCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        let callback: ChangeCallback = Arc::new(move |_: &Dataset| -> anyhow::Result<()> {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, callback)
    }

    fn coordinator(source: Arc<ClockSource>, interval: Duration) -> RefreshCoordinator {
        RefreshCoordinator::new(source, WatchConfig::with_interval(interval), Handle::current())
    }

    fn dataset() -> Dataset {
        Dataset::new("Armatures.xlsx", "Armatures")
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn one_change_notifies_each_callback_once() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let (a, cb_a) = counter();
        let (b, cb_b) = counter();
        coordinator.start_watching(&dataset(), cb_a).unwrap();
        coordinator.start_watching(&dataset(), cb_b).unwrap();

        assert!(coordinator.poll_once(&dataset()).is_empty());

        source.touch(200);
        assert_eq!(coordinator.poll_once(&dataset()).len(), 2);
        assert!(coordinator.poll_once(&dataset()).is_empty());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paused_polls_are_skipped() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let (hits, cb) = counter();
        coordinator.start_watching(&dataset(), cb).unwrap();

        coordinator.pause_all();
        coordinator.pause_all();
        source.touch(200);
        assert!(coordinator.poll_once(&dataset()).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        coordinator.resume_all();
        assert_eq!(coordinator.poll_once(&dataset()).len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_ignores_pause() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let (hits, cb) = counter();
        coordinator.start_watching(&dataset(), cb).unwrap();
        coordinator.pause_all();

        let outcomes = coordinator.force_refresh(&dataset());
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(coordinator.force_refresh(&Dataset::new("other.xlsx", "S")).is_empty());
    }

    #[tokio::test]
    async fn failing_callback_reports_without_blocking_others() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let failing: ChangeCallback =
            Arc::new(|_: &Dataset| -> anyhow::Result<()> { Err(anyhow::anyhow!("rebuild failed")) });
        let (hits, cb) = counter();
        let bad = coordinator.start_watching(&dataset(), failing).unwrap();
        coordinator.start_watching(&dataset(), cb).unwrap();

        source.touch(300);
        let outcomes = coordinator.poll_once(&dataset());
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_ok()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].subscriber, bad);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removing_last_callback_stops_the_watch() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let (_, cb_a) = counter();
        let (_, cb_b) = counter();
        let a = coordinator.start_watching(&dataset(), cb_a).unwrap();
        let b = coordinator.start_watching(&dataset(), cb_b).unwrap();

        assert!(coordinator.remove_callback(a));
        assert!(coordinator.is_watching(&dataset()));
        assert!(coordinator.remove_callback(b));
        assert!(!coordinator.is_watching(&dataset()));
        assert!(!coordinator.remove_callback(b));
    }

    #[tokio::test]
    async fn stop_and_cleanup() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), HOUR);
        let (_, cb) = counter();
        coordinator.start_watching(&dataset(), cb.clone()).unwrap();
        coordinator.start_watching(&Dataset::new("Signals.xlsx", "Signals"), cb.clone()).unwrap();

        assert!(coordinator.stop_watching(&dataset()));
        assert!(!coordinator.stop_watching(&dataset()));
        assert_eq!(coordinator.watched().len(), 1);

        coordinator.cleanup();
        assert!(coordinator.watched().is_empty());
        assert!(matches!(coordinator.start_watching(&dataset(), cb), Err(SyncError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_loop_picks_up_changes() {
        let source = ClockSource::new();
        let coordinator = coordinator(source.clone(), Duration::from_millis(10));
        let (hits, cb) = counter();
        coordinator.start_watching(&dataset(), cb).unwrap();

        source.touch(500);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        coordinator.stop_watching(&dataset());
        source.touch(600);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lifecycle_notifier_pauses_polling() {
        let source = ClockSource::new();
        let coordinator = Arc::new(coordinator(source, HOUR));
        let notifier = LifecycleNotifier::new();
        let observer: Arc<dyn LifecycleObserver> = coordinator.clone();
        notifier.add_observer(observer);

        notifier.set_state(LifecycleState::Background);
        assert!(coordinator.is_paused());
        notifier.set_state(LifecycleState::Foreground);
        assert!(!coordinator.is_paused());
    }
}

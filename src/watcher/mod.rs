pub mod error;
pub mod event;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;

pub use error::WatchError;
pub use event::{ChangeEvent, WatchTargets, WatcherState, classify_event};

/// Identifies one registered subscriber.
pub type SubscriberId = u64;

/// Tuning for subscriber delivery.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Upper bound on how long a single send to one subscriber may block a broadcast.
    pub send_timeout: Duration,
    /// Notifications that may queue for one subscriber before sends start waiting.
    pub channel_capacity: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(2000),
            channel_capacity: 16,
        }
    }
}

/// Outcome of one [`ChangeWatcher::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Subscribers whose send failed or timed out; they were removed from the set.
    pub pruned: usize,
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    tx: tokio_mpsc::Sender<ChangeEvent>,
}

struct Inner {
    path: PathBuf,
    options: WatchOptions,
    state: Mutex<WatcherState>,
    /// Ordered by subscription time. The only shared mutable state.
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Watches one file and fans change notifications out to subscribers.
///
/// Constructed once at startup; clones are cheap handles to the same watcher
/// and are handed to the HTTP layer and to the background broadcast loop.
#[derive(Clone)]
pub struct ChangeWatcher {
    inner: Arc<Inner>,
}

/// Handle to a running watch. Keeps the OS watcher alive (dropping stops watching).
pub struct WatcherHandle {
    /// Keep alive: dropping the watcher closes the event channel, which ends both tasks.
    _watcher: RecommendedWatcher,
    /// Forwards raw events from the std channel to the tokio channel.
    _bridge_task: JoinHandle<()>,
    /// Broadcasts classified events to subscribers.
    _broadcast_task: JoinHandle<()>,
}

impl ChangeWatcher {
    pub fn new(path: impl Into<PathBuf>, options: WatchOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                options,
                state: Mutex::new(WatcherState::Idle),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> WatcherState {
        *self.inner.state.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Register the filesystem watch and start broadcasting (Idle -> Watching).
    ///
    /// The watch is placed on the file's parent directory so editors that
    /// save by writing a temp file and renaming it over the original are
    /// still seen. If the path is a symlink, the target's directory is
    /// watched as well. Must be called from within a tokio runtime.
    ///
    /// Fails with [`WatchError::AlreadyStarted`] on a second call. Any
    /// registration failure moves the watcher to `Terminated`; reporting it
    /// is left to the caller.
    pub fn start(&self) -> Result<WatcherHandle, WatchError> {
        let mut state = self.inner.state.lock();
        match *state {
            WatcherState::Idle => {}
            WatcherState::Terminated => return Err(WatchError::Terminated),
            WatcherState::Watching | WatcherState::Broadcasting => {
                return Err(WatchError::AlreadyStarted);
            }
        }

        match self.register() {
            Ok(handle) => {
                *state = WatcherState::Watching;
                Ok(handle)
            }
            Err(err) => {
                *state = WatcherState::Terminated;
                Err(err)
            }
        }
    }

    fn register(&self) -> Result<WatcherHandle, WatchError> {
        let targets = WatchTargets::resolve(&self.inner.path)?;

        let (std_tx, std_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = std_tx.send(res);
        })?;
        for dir in targets.dirs() {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let (tokio_tx, mut tokio_rx) = tokio_mpsc::channel::<ChangeEvent>(256);

        // Bridge: spawn_blocking to receive from std channel, classify, forward to tokio
        let bridge_task = tokio::task::spawn_blocking(move || {
            while let Ok(result) = std_rx.recv() {
                match result {
                    Ok(event) => {
                        if let Some(change) = classify_event(&event, &targets) {
                            if tokio_tx.blocking_send(change).is_err() {
                                return; // broadcast loop gone
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("[watcher] error: {err}");
                    }
                }
            }
        });

        let this = self.clone();
        let broadcast_task = tokio::spawn(async move {
            while let Some(event) = tokio_rx.recv().await {
                let report = this.broadcast(event).await;
                crate::debug_event!(
                    "watcher",
                    "broadcast",
                    "{} delivered, {} pruned",
                    report.delivered,
                    report.pruned
                );
            }
            // Watch released: close the connections that would otherwise stay silent.
            this.shutdown();
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            _bridge_task: bridge_task,
            _broadcast_task: broadcast_task,
        })
    }

    /// Register a new subscriber. Future change events are queued on the
    /// returned [`Subscription`]; dropping it unsubscribes.
    pub fn subscribe(&self) -> Result<Subscription, WatchError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = tokio_mpsc::channel(self.inner.options.channel_capacity.max(1));
        let count = {
            // Lock order: subscribers, then state. Checking the state under the
            // subscribers lock keeps a concurrent shutdown from missing us.
            let mut subscribers = self.inner.subscribers.lock();
            if self.state() == WatcherState::Terminated {
                return Err(WatchError::Terminated);
            }
            subscribers.push(Subscriber { id, tx });
            subscribers.len()
        };
        crate::debug_event!("watcher", "subscribed", "id={id}, {count} connected");
        Ok(Subscription {
            id,
            rx,
            watcher: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        remove_subscriber(&self.inner, id)
    }

    /// Deliver `event` to every subscriber registered right now.
    ///
    /// The set is snapshotted under the lock and the sends run outside it, so
    /// a concurrent subscribe never waits on a slow client and is neither
    /// skipped nor visited twice: it simply joins the next broadcast. Each
    /// send is bounded by `send_timeout`. A subscriber whose send fails or
    /// times out is removed; the others are unaffected.
    pub async fn broadcast(&self, event: ChangeEvent) -> BroadcastReport {
        let snapshot: Vec<Subscriber> = self.inner.subscribers.lock().clone();
        let entered = self.transition(WatcherState::Watching, WatcherState::Broadcasting);

        let timeout = self.inner.options.send_timeout;
        let results = join_all(snapshot.iter().map(|sub| async move {
            let sent = tokio::time::timeout(timeout, sub.tx.send(event)).await;
            (sub.id, matches!(sent, Ok(Ok(()))))
        }))
        .await;

        let failed: Vec<SubscriberId> = results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(id, _)| *id)
            .collect();
        if !failed.is_empty() {
            self.inner
                .subscribers
                .lock()
                .retain(|sub| !failed.contains(&sub.id));
            crate::debug_event!("watcher", "pruned", "{failed:?}");
        }

        if entered {
            self.transition(WatcherState::Broadcasting, WatcherState::Watching);
        }

        BroadcastReport {
            delivered: results.len() - failed.len(),
            pruned: failed.len(),
        }
    }

    /// Move to `Terminated` and drop every subscriber, which closes their
    /// connections. The filesystem watch itself is released by dropping the
    /// [`WatcherHandle`].
    pub fn shutdown(&self) {
        let dropped = {
            let mut subscribers = self.inner.subscribers.lock();
            *self.inner.state.lock() = WatcherState::Terminated;
            std::mem::take(&mut *subscribers)
        };
        crate::debug_event!("watcher", "shutdown", "{} subscribers dropped", dropped.len());
    }

    fn transition(&self, from: WatcherState, to: WatcherState) -> bool {
        let mut state = self.inner.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

fn remove_subscriber(inner: &Inner, id: SubscriberId) -> bool {
    let mut subscribers = inner.subscribers.lock();
    let before = subscribers.len();
    subscribers.retain(|sub| sub.id != id);
    let removed = subscribers.len() != before;
    if removed {
        crate::debug_event!(
            "watcher",
            "unsubscribed",
            "id={id}, {} connected",
            subscribers.len()
        );
    }
    removed
}

/// Receiving side of one subscriber.
pub struct Subscription {
    id: SubscriberId,
    rx: tokio_mpsc::Receiver<ChangeEvent>,
    watcher: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next change event. `None` once the subscriber has been
    /// removed (pruned, unsubscribed or watcher shut down).
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.watcher.upgrade() {
            remove_subscriber(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn watcher_for(path: &Path) -> ChangeWatcher {
        ChangeWatcher::new(path, WatchOptions::default())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber_once() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let mut subs: Vec<Subscription> =
            (0..5).map(|_| watcher.subscribe().unwrap()).collect();

        let report = watcher.broadcast(ChangeEvent).await;
        assert_eq!(report, BroadcastReport { delivered: 5, pruned: 0 });

        for sub in &mut subs {
            assert_eq!(sub.recv().await, Some(ChangeEvent));
            assert!(sub.rx.try_recv().is_err(), "exactly one notification each");
        }
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_pruned_without_affecting_others() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let mut alive = watcher.subscribe().unwrap();
        let mut dead = watcher.subscribe().unwrap();
        let mut also_alive = watcher.subscribe().unwrap();
        dead.rx.close();

        let report = watcher.broadcast(ChangeEvent).await;
        assert_eq!(report, BroadcastReport { delivered: 2, pruned: 1 });
        assert_eq!(watcher.subscriber_count(), 2);

        assert_eq!(alive.recv().await, Some(ChangeEvent));
        assert_eq!(also_alive.recv().await, Some(ChangeEvent));
    }

    #[tokio::test]
    async fn test_slow_subscriber_times_out_and_is_pruned() {
        let options = WatchOptions {
            send_timeout: Duration::from_millis(50),
            channel_capacity: 1,
        };
        let watcher = ChangeWatcher::new("/tmp/style.json", options);
        let _stuck = watcher.subscribe().unwrap();
        let mut reader = watcher.subscribe().unwrap();

        assert_eq!(watcher.broadcast(ChangeEvent).await.pruned, 0);
        assert_eq!(reader.recv().await, Some(ChangeEvent));

        // `_stuck` never reads, so its single slot is still full.
        let report = watcher.broadcast(ChangeEvent).await;
        assert_eq!(report, BroadcastReport { delivered: 1, pruned: 1 });
        assert_eq!(watcher.subscriber_count(), 1);
        assert_eq!(reader.recv().await, Some(ChangeEvent));
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let sub = watcher.subscribe().unwrap();
        let id = sub.id();
        assert_eq!(watcher.subscriber_count(), 1);

        drop(sub);
        assert_eq!(watcher.subscriber_count(), 0);
        assert!(!watcher.unsubscribe(id), "already removed on drop");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        watcher.broadcast(ChangeEvent).await;

        let mut late = watcher.subscribe().unwrap();
        assert!(late.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_events_are_handled_independently() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let mut sub = watcher.subscribe().unwrap();

        let first = watcher.broadcast(ChangeEvent).await;
        let second = watcher.broadcast(ChangeEvent).await;
        assert_eq!(first, second);
        assert_eq!(watcher.subscriber_count(), 1);
        assert_eq!(sub.recv().await, Some(ChangeEvent));
        assert_eq!(sub.recv().await, Some(ChangeEvent));
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers_and_rejects_new_ones() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let mut sub = watcher.subscribe().unwrap();

        watcher.shutdown();
        assert_eq!(watcher.state(), WatcherState::Terminated);
        assert_eq!(sub.recv().await, None);
        assert!(matches!(watcher.subscribe(), Err(WatchError::Terminated)));
        assert!(matches!(watcher.start(), Err(WatchError::Terminated)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_for(&dir.path().join("style.json"));

        let _handle = watcher.start().unwrap();
        assert_eq!(watcher.state(), WatcherState::Watching);
        assert!(matches!(watcher.start(), Err(WatchError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_start_on_missing_directory_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_for(&dir.path().join("missing").join("style.json"));

        assert!(watcher.start().is_err());
        assert_eq!(watcher.state(), WatcherState::Terminated);
    }

    #[tokio::test]
    async fn test_external_write_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.json");
        fs::write(&path, r#"{"version":8}"#).unwrap();

        let watcher = watcher_for(&path);
        let handle = watcher.start().unwrap();
        let mut first = watcher.subscribe().unwrap();
        let mut second = watcher.subscribe().unwrap();

        fs::write(&path, r#"{"version":9}"#).unwrap();

        let window = Duration::from_secs(5);
        let got = tokio::time::timeout(window, first.recv()).await;
        assert_eq!(got.ok().flatten(), Some(ChangeEvent));
        let got = tokio::time::timeout(window, second.recv()).await;
        assert_eq!(got.ok().flatten(), Some(ChangeEvent));

        drop(handle);
    }

    #[tokio::test]
    async fn test_sibling_write_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.json");
        fs::write(&path, "{}").unwrap();

        let watcher = watcher_for(&path);
        let _handle = watcher.start().unwrap();
        let mut sub = watcher.subscribe().unwrap();

        fs::write(dir.path().join("unrelated.txt"), "hello").unwrap();

        let got = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await;
        assert!(got.is_err(), "no notification expected for sibling files");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribers_each_receive_one() {
        let watcher = watcher_for(Path::new("/tmp/style.json"));
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let watcher = watcher.clone();
                tokio::spawn(async move { watcher.subscribe().unwrap() })
            })
            .collect();
        let mut subs = Vec::new();
        for task in tasks {
            subs.push(task.await.unwrap());
        }
        assert_eq!(watcher.subscriber_count(), 32);

        let report = watcher.broadcast(ChangeEvent).await;
        assert_eq!(report, BroadcastReport { delivered: 32, pruned: 0 });
        for sub in &mut subs {
            assert_eq!(sub.rx.try_recv(), Ok(ChangeEvent));
            assert!(sub.rx.try_recv().is_err(), "exactly one notification each");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_during_broadcast_joins_next_one() {
        let options = WatchOptions {
            send_timeout: Duration::from_millis(300),
            channel_capacity: 1,
        };
        let watcher = ChangeWatcher::new("/tmp/style.json", options);
        let mut early = watcher.subscribe().unwrap();
        let _stuck = watcher.subscribe().unwrap();
        // Fill `_stuck`'s only slot so the next broadcast waits on it.
        watcher.broadcast(ChangeEvent).await;
        assert_eq!(early.rx.try_recv(), Ok(ChangeEvent));

        let in_flight = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.broadcast(ChangeEvent).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let joiners: Vec<_> = (0..16)
            .map(|_| {
                let watcher = watcher.clone();
                tokio::spawn(async move { watcher.subscribe().unwrap() })
            })
            .collect();
        let mut late = Vec::new();
        for task in joiners {
            late.push(task.await.unwrap());
        }

        let report = in_flight.await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, pruned: 1 });
        assert_eq!(early.rx.try_recv(), Ok(ChangeEvent));
        for sub in &mut late {
            assert!(sub.rx.try_recv().is_err(), "joined after the snapshot");
        }

        let report = watcher.broadcast(ChangeEvent).await;
        assert_eq!(report, BroadcastReport { delivered: 17, pruned: 0 });
        assert_eq!(early.rx.try_recv(), Ok(ChangeEvent));
        for sub in &mut late {
            assert_eq!(sub.rx.try_recv(), Ok(ChangeEvent));
            assert!(sub.rx.try_recv().is_err(), "visited exactly once");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_racing_subscribe_leaves_no_subscriber() {
        for _ in 0..200 {
            let watcher = watcher_for(Path::new("/tmp/style.json"));
            let subscriber = {
                let watcher = watcher.clone();
                tokio::spawn(async move { watcher.subscribe().ok() })
            };
            let stopper = {
                let watcher = watcher.clone();
                tokio::spawn(async move { watcher.shutdown() })
            };
            stopper.await.unwrap();
            let sub = subscriber.await.unwrap();

            // Either the subscribe lost (rejected) or it won and shutdown cleared it.
            assert_eq!(watcher.subscriber_count(), 0);
            if let Some(mut sub) = sub {
                assert_eq!(sub.recv().await, None);
            }
        }
    }

    #[tokio::test]
    async fn test_released_watch_closes_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_for(&dir.path().join("style.json"));
        let handle = watcher.start().unwrap();
        let mut sub = watcher.subscribe().unwrap();

        drop(handle);

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await;
        assert_eq!(got.expect("closed within window"), None);
        assert_eq!(watcher.state(), WatcherState::Terminated);
        assert_eq!(watcher.subscriber_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_symlink_notifies_subscribers() {
        let real_dir = tempfile::tempdir().unwrap();
        let link_dir = tempfile::tempdir().unwrap();
        let real = real_dir.path().join("real.json");
        fs::write(&real, r#"{"version":8}"#).unwrap();
        let link = link_dir.path().join("style.json");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let watcher = watcher_for(&link);
        let _handle = watcher.start().unwrap();
        let mut sub = watcher.subscribe().unwrap();

        fs::write(&link, r#"{"version":9}"#).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await;
        assert_eq!(got.ok().flatten(), Some(ChangeEvent));
    }
}

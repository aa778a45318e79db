//! Registered change listeners and the curls they watch.
//!
//! The listener directory and the per-curl subscription sets live behind one lock, so the two
//! never disagree: an id found in a subscription set always has a directory entry. Every
//! mutation rewrites the recovery file.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use rand::Rng;
use snafu::Snafu;
use tracing::{debug, info, trace, warn};

use crate::{
    curl,
    listener::{ChangeListener, ListenerConnector},
    metrics::Metrics,
    recovery::{RecoveryError, RecoveryFile, RecoverySnapshot},
};

/// Draws made for a free listener id before giving up.
const MAX_ID_DRAWS: usize = 64;

/// Identifier of a registered listener. Always positive.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ListenerId(u32);

/// No unused listener id was found.
#[derive(Debug, Snafu)]
#[snafu(display("no free listener id after {attempts} draws"))]
pub struct IdSpaceExhausted {
    attempts: usize,
}

/// Result of a notification pass over one curl.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Listeners that accepted the notification.
    pub delivered: Vec<ListenerId>,
    /// Listeners dropped because delivery failed.
    pub pruned: Vec<ListenerId>,
}

#[derive(Debug, Default)]
struct State {
    listeners: HashMap<ListenerId, Arc<dyn ChangeListener>>,
    curls: BTreeMap<String, BTreeSet<ListenerId>>,
}

impl State {
    /// Drops ids without a directory entry from every curl, and curls left without listeners.
    fn sweep(&mut self) {
        let listeners = &self.listeners;
        self.curls.retain(|_, ids| {
            ids.retain(|id| listeners.contains_key(id));
            !ids.is_empty()
        });
    }

    fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            listeners: self
                .listeners
                .iter()
                .map(|(id, listener)| (*id, listener.reference()))
                .collect(),
            subscriptions: self.curls.clone(),
        }
    }
}

/// Listener directory and subscriptions, persisted to an optional recovery file.
#[derive(Debug)]
pub struct Subscriptions {
    state: Mutex<State>,
    /// Serializes recovery file writes, so the last write always carries the newest state.
    persist_lock: Mutex<()>,
    file: Option<RecoveryFile>,
    metrics: Arc<Metrics>,
}

impl Subscriptions {
    /// Creates an empty manager. Without a file nothing is persisted.
    pub fn new(file: Option<RecoveryFile>, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Default::default(),
            persist_lock: Default::default(),
            file,
            metrics,
        }
    }

    /// Adds a listener under a fresh random id.
    pub fn register(
        &self,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<ListenerId, IdSpaceExhausted> {
        let id = {
            let mut state = self.state.lock();
            let mut rng = rand::thread_rng();
            let id = (0..MAX_ID_DRAWS)
                .map(|_| ListenerId(rng.gen_range(1..=i32::MAX as u32)))
                .find(|id| !state.listeners.contains_key(id))
                .ok_or_else(|| IdSpaceExhaustedSnafu { attempts: MAX_ID_DRAWS }.build())?;
            state.listeners.insert(id, listener);
            id
        };
        debug!("registered listener {id}");
        self.persist();
        Ok(id)
    }

    /// Subscribes listener `id` to changes of `curl`.
    ///
    /// Neither the curl nor the id need to exist. Ids without a registered listener are
    /// dropped again by the next sweep.
    pub fn subscribe(&self, curl: &str, id: ListenerId) {
        let curl = curl::canonical(curl).to_string();
        trace!("listener {id} subscribed to '{curl}'");
        self.state.lock().curls.entry(curl).or_default().insert(id);
        self.persist();
    }

    /// Removes a listener and all its subscriptions.
    ///
    /// Returns whether the listener was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.listeners.remove(&id).is_some();
            for ids in state.curls.values_mut() {
                ids.remove(&id);
            }
            state.curls.retain(|_, ids| !ids.is_empty());
            removed
        };
        debug!("unregistered listener {id}");
        self.persist();
        removed
    }

    /// Whether listener `id` is registered.
    pub fn contains(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.contains_key(&id)
    }

    /// Ids subscribed to `curl`.
    pub fn subscribers(&self, curl: &str) -> BTreeSet<ListenerId> {
        self.state
            .lock()
            .curls
            .get(curl::canonical(curl))
            .cloned()
            .unwrap_or_default()
    }

    /// Curls with at least one subscription.
    pub fn curls(&self) -> Vec<String> {
        self.state.lock().curls.keys().cloned().collect()
    }

    /// The current persisted form.
    pub fn snapshot(&self) -> RecoverySnapshot {
        self.state.lock().snapshot()
    }

    /// Delivers a change of `curl` to its subscribers and drops the ones that fail.
    ///
    /// Deliveries happen one after the other, outside the lock. A failing listener is removed
    /// from the directory and from every curl.
    pub async fn notify(&self, curl: &str) -> NotifyOutcome {
        let curl = curl::canonical(curl);
        let targets: Vec<(ListenerId, Arc<dyn ChangeListener>)> = {
            let state = self.state.lock();
            state
                .curls
                .get(curl)
                .into_iter()
                .flatten()
                .filter_map(|id| state.listeners.get(id).map(|l| (*id, l.clone())))
                .collect()
        };

        let mut outcome = NotifyOutcome::default();
        for (id, listener) in targets {
            match listener.object_changed(curl).await {
                Ok(()) => {
                    self.metrics.notifications_sent.inc();
                    outcome.delivered.push(id);
                }
                Err(err) => {
                    debug!("listener {id} failed on '{curl}', removing it: {err}");
                    outcome.pruned.push(id);
                }
            }
        }

        if !outcome.pruned.is_empty() {
            {
                let mut state = self.state.lock();
                for id in &outcome.pruned {
                    state.listeners.remove(id);
                }
                state.sweep();
            }
            self.metrics
                .listeners_pruned
                .inc_by(outcome.pruned.len() as u64);
            self.persist();
        }
        outcome
    }

    /// Rewrites the recovery file from the current state.
    ///
    /// Write failures are logged and otherwise ignored.
    pub fn persist(&self) {
        let Some(file) = &self.file else {
            return;
        };
        let _guard = self.persist_lock.lock();
        let snapshot = self.snapshot();
        if let Err(err) = file.write(&snapshot) {
            warn!("failed to save listeners: {err}");
        }
    }

    /// Replaces the state with the contents of the recovery file.
    ///
    /// References the connector cannot reconnect are skipped, together with their
    /// subscriptions. Returns the number of restored listeners.
    pub fn restore(&self, connector: &dyn ListenerConnector) -> Result<usize, RecoveryError> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        let Some(snapshot) = file.read()? else {
            debug!("no recovery file at {}", file.path().display());
            return Ok(0);
        };

        let mut listeners = HashMap::new();
        for (id, reference) in snapshot.listeners {
            match connector.connect(&reference) {
                Ok(listener) => {
                    listeners.insert(id, listener);
                }
                Err(err) => warn!("dropping listener {id} ({reference}): {err}"),
            }
        }
        let restored = listeners.len();

        let mut state = self.state.lock();
        state.listeners = listeners;
        state.curls = snapshot.subscriptions;
        state.sweep();
        info!(
            "restored {restored} listeners on {} curls from {}",
            state.curls.len(),
            file.path().display()
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::{
        recovery::RECOVERY_FILE_NAME,
        test_utils::{RecordingConnector, RecordingListener},
    };

    fn with_file(dir: &std::path::Path) -> Subscriptions {
        Subscriptions::new(
            Some(RecoveryFile::new(dir.join(RECOVERY_FILE_NAME))),
            Arc::new(Metrics::default()),
        )
    }

    #[test]
    fn ids_are_positive_and_unique() {
        let subs = Subscriptions::new(None, Default::default());
        let ids: BTreeSet<_> = (0..100)
            .map(|i| subs.register(RecordingListener::new(format!("l{i}"))).unwrap())
            .collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| u32::from(*id) > 0 && u32::from(*id) <= i32::MAX as u32));
    }

    #[test]
    fn unregister_removes_everywhere() {
        let subs = Subscriptions::new(None, Default::default());
        let a = subs.register(RecordingListener::new("a")).unwrap();
        let b = subs.register(RecordingListener::new("b")).unwrap();
        subs.subscribe("/X/", a);
        subs.subscribe("X", b);
        subs.subscribe("Y", a);

        assert_eq!(subs.subscribers("X"), BTreeSet::from([a, b]));
        assert!(subs.unregister(a));
        assert!(!subs.contains(a));
        assert_eq!(subs.subscribers("X"), BTreeSet::from([b]));
        assert_eq!(subs.curls(), vec!["X"]);
        assert!(!subs.unregister(a));
    }

    #[tokio::test]
    async fn dead_listeners_are_pruned() {
        let subs = Subscriptions::new(None, Default::default());
        let healthy = RecordingListener::new("healthy");
        let dead = RecordingListener::failing("dead");
        let h = subs.register(healthy.clone()).unwrap();
        let d = subs.register(dead.clone()).unwrap();
        subs.subscribe("A", h);
        subs.subscribe("A", d);
        subs.subscribe("B", d);

        let outcome = subs.notify("A").await;
        assert_eq!(outcome.delivered, vec![h]);
        assert_eq!(outcome.pruned, vec![d]);
        assert_eq!(healthy.received(), vec!["A"]);
        assert!(!subs.contains(d));
        assert_eq!(subs.subscribers("A"), BTreeSet::from([h]));
        // the sweep also cleans other curls of the dead id
        assert!(subs.subscribers("B").is_empty());
        assert_eq!(subs.curls(), vec!["A"]);
        assert_eq!(subs.metrics.listeners_pruned.get(), 1);
    }

    #[tokio::test]
    async fn notify_unknown_curl_is_a_noop() {
        let subs = Subscriptions::new(None, Default::default());
        assert_eq!(subs.notify("Nothing").await, NotifyOutcome::default());
    }

    #[test]
    fn restore_reproduces_persisted_state() -> TestResult {
        let dir = tempfile::tempdir()?;
        let subs = with_file(dir.path());
        let l1 = subs.register(RecordingListener::new("http://l1/"))?;
        let l2 = subs.register(RecordingListener::new("http://l2/"))?;
        subs.subscribe("A", l1);
        subs.subscribe("A", l2);
        subs.subscribe("B", l2);
        let before = subs.snapshot();

        let restored = with_file(dir.path());
        let connector = RecordingConnector::default();
        assert_eq!(restored.restore(&connector)?, 2);
        assert_eq!(restored.snapshot(), before);
        assert_eq!(connector.connected().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn pruning_and_unregister_rewrite_the_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let subs = with_file(dir.path());
        let file = RecoveryFile::new(dir.path().join(RECOVERY_FILE_NAME));
        let l1 = subs.register(RecordingListener::new("http://l1/"))?;
        let l2 = subs.register(RecordingListener::failing("http://l2/"))?;
        subs.subscribe("A", l1);
        subs.subscribe("A", l2);
        subs.subscribe("B", l2);

        let outcome = subs.notify("A").await;
        assert_eq!(outcome.pruned, vec![l2]);
        let persisted = file.read()?.ok_or("file was written")?;
        assert!(!persisted.listeners.contains_key(&l2));
        assert_eq!(persisted.subscriptions.keys().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(persisted.subscriptions["A"], BTreeSet::from([l1]));

        assert!(subs.unregister(l1));
        let persisted = file.read()?.ok_or("file was written")?;
        assert!(persisted.listeners.is_empty());
        assert!(persisted.subscriptions.is_empty());
        Ok(())
    }

    #[test]
    fn restore_without_file_is_empty() -> TestResult {
        let dir = tempfile::tempdir()?;
        let subs = with_file(dir.path());
        assert_eq!(subs.restore(&RecordingConnector::default())?, 0);
        assert!(subs.curls().is_empty());
        Ok(())
    }
}

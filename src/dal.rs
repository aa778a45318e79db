//! The configuration database service.
//!
//! [`Dal`] is the curl addressed surface of the database. It resolves curls against the node
//! tree, assembles and caches documents, hands out bound [`Dao`](crate::dao::Dao) objects and
//! notifies registered listeners when records are invalidated.
//!
//! Every operation counts as an invocation and fails with
//! [`DalError::ServiceUnavailable`] once [`Dal::shutdown`] was called. Calls already in flight
//! when shutdown starts run to completion.

use std::{path::PathBuf, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use snafu::IntoError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    assembler::Assembler,
    cache::{DEFAULT_TARGET_FREE_RATIO, DocumentCache, MemoryProbe, SystemMemoryProbe},
    curl,
    dao::{DaoHandle, DaoRegistry},
    error::{DalError, InternalSnafu, ServiceUnavailableSnafu},
    listener::{ChangeListener, DeliveryError, HttpListenerConnector, ListenerConnector},
    metrics::Metrics,
    monitor::{DEFAULT_CHECK_INTERVAL, MemoryMonitor},
    node_tree::NodeTree,
    record::{Element, RecordParser, XmlRecordParser},
    recovery::RecoveryFile,
    repeat_guard::{DEFAULT_MAX_TRACKED, DEFAULT_WINDOW, RepeatGuard},
    resolver,
    schemas::SchemaLocations,
    subscriptions::{ListenerId, Subscriptions},
};

/// Value of [`Dal::configuration_name`].
pub const CONFIGURATION_NAME: &str = "XML";

/// Builder for a [`Dal`].
#[derive(Debug)]
pub struct Builder {
    root: PathBuf,
    parser: Arc<dyn RecordParser>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    memory_limit: Option<u64>,
    target_free_ratio: f64,
    check_interval: Duration,
    connector: Arc<dyn ListenerConnector>,
    recovery_file: Option<PathBuf>,
    replay: bool,
    repeat_window: Duration,
    repeat_max_tracked: usize,
    metrics: Arc<Metrics>,
}

impl Builder {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            parser: Arc::new(XmlRecordParser),
            memory_probe: None,
            memory_limit: None,
            target_free_ratio: DEFAULT_TARGET_FREE_RATIO,
            check_interval: DEFAULT_CHECK_INTERVAL,
            connector: Arc::new(HttpListenerConnector::default()),
            recovery_file: None,
            replay: true,
            repeat_window: DEFAULT_WINDOW,
            repeat_max_tracked: DEFAULT_MAX_TRACKED,
            metrics: Default::default(),
        }
    }

    /// Sets the record parser. Defaults to [`XmlRecordParser`].
    pub fn parser(mut self, parser: Arc<dyn RecordParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Sets the source of memory figures. Defaults to a [`SystemMemoryProbe`].
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Limits the memory of this process for the default probe.
    pub fn memory_limit(mut self, limit: Option<u64>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Share of memory the cache keeps free.
    pub fn target_free_ratio(mut self, ratio: f64) -> Self {
        self.target_free_ratio = ratio;
        self
    }

    /// Pause between two memory checks.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets how listener references are connected. Defaults to HTTP callbacks.
    pub fn connector(mut self, connector: Arc<dyn ListenerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Persists listeners to `path`. `None` disables recovery.
    pub fn recovery_file(mut self, path: Option<PathBuf>) -> Self {
        self.recovery_file = path;
        self
    }

    /// Whether listeners in the recovery file are restored on spawn. Defaults to `true`.
    pub fn replay_recovery(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }

    /// Throttling of repeated lookups of missing curls.
    pub fn repeat_guard(mut self, window: Duration, max_tracked: usize) -> Self {
        self.repeat_window = window;
        self.repeat_max_tracked = max_tracked;
        self
    }

    /// Shares `metrics` instead of creating a fresh group.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Scans the node tree and starts the service.
    ///
    /// With a recovery file and replay enabled, persisted listeners are restored and notified
    /// of a full invalidation in the background. Must be called from within a tokio runtime.
    pub fn spawn(self) -> Dal {
        let tree = NodeTree::scan(&self.root);
        let schemas = SchemaLocations::from_env(&self.root);
        if !schemas.is_empty() {
            debug!("schema locations: {}", schemas.external_schema_location());
        }

        let memory_limit = self.memory_limit;
        let probe = self.memory_probe.unwrap_or_else(|| {
            Arc::new(SystemMemoryProbe::new(memory_limit)) as Arc<dyn MemoryProbe>
        });
        let cache = Arc::new(DocumentCache::new(
            probe,
            self.target_free_ratio,
            self.metrics.clone(),
        ));
        let shutdown = CancellationToken::new();
        let monitor = MemoryMonitor::spawn(cache.clone(), self.check_interval, shutdown.child_token());
        let recovery = self.recovery_file.map(RecoveryFile::new);
        let replay = self.replay;

        let dal = Dal {
            inner: Arc::new(Inner {
                tree: RwLock::new(Arc::new(tree)),
                assembler: Assembler::new(self.parser, cache.clone()),
                cache,
                daos: DaoRegistry::new(self.metrics.clone()),
                subscriptions: Subscriptions::new(recovery, self.metrics.clone()),
                connector: self.connector,
                not_found_guard: RepeatGuard::new(self.repeat_window, self.repeat_max_tracked),
                load_lock: Default::default(),
                shutdown,
                monitor: Mutex::new(Some(monitor)),
                schemas: RwLock::new(schemas),
                metrics: self.metrics,
                root: self.root,
            }),
        };
        info!("serving configuration database at {}", dal.inner.root.display());
        if replay {
            dal.recover_clients();
        }
        dal
    }
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    tree: RwLock<Arc<NodeTree>>,
    assembler: Assembler,
    cache: Arc<DocumentCache>,
    daos: DaoRegistry,
    subscriptions: Subscriptions,
    connector: Arc<dyn ListenerConnector>,
    not_found_guard: RepeatGuard,
    /// Serializes document loads, so a curl is never assembled twice concurrently.
    load_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<MemoryMonitor>>,
    schemas: RwLock<SchemaLocations>,
    metrics: Arc<Metrics>,
}

/// The configuration database service.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Dal {
    inner: Arc<Inner>,
}

impl Dal {
    /// Starts building a service over the node tree in `root`.
    pub fn builder(root: impl Into<PathBuf>) -> Builder {
        Builder::new(root.into())
    }

    /// Returns the assembled XML document of `curl`.
    pub async fn get_document(&self, curl: &str) -> Result<Arc<str>, DalError> {
        self.enter()?;
        self.load_document(curl::canonical(curl)).await
    }

    /// Returns the bound object of `curl`, binding a new one if none is live.
    pub async fn get_dao(&self, curl: &str) -> Result<DaoHandle, DalError> {
        self.enter()?;
        let curl = curl::canonical(curl);
        self.inner
            .daos
            .get_or_create(curl, || async {
                let document = self.load_document(curl).await?;
                self.inner
                    .assembler
                    .parser()
                    .parse_str(&document)
                    .map_err(|err| {
                        InternalSnafu {
                            operation: "activate DAO",
                            curl,
                        }
                        .into_error(err.into())
                    })
            })
            .await
    }

    /// Lists the children of `curl` as space separated names.
    ///
    /// Listing the root re-reads the node tree from disk.
    pub async fn list_nodes(&self, curl: &str) -> Result<String, DalError> {
        self.enter()?;
        let curl = curl::canonical(curl);
        if curl.is_empty() {
            self.rescan().await;
        }
        Ok(self.tree().list(curl))
    }

    /// Lists the children of `curl` together with the elements of its record.
    pub async fn list_daos(&self, curl: &str) -> Result<String, DalError> {
        self.enter()?;
        let curl = curl::canonical(curl);
        let (mut names, has_record) = {
            let tree = self.tree();
            let names: Vec<String> = tree.list(curl).split_whitespace().map(String::from).collect();
            let has_record = match resolver::locate(&tree, curl) {
                Ok(located) => located.node.has_record() || !located.residual.is_empty(),
                Err(_) => false,
            };
            (names, has_record)
        };
        if has_record {
            match self.load_document(curl).await.and_then(|doc| {
                self.inner
                    .assembler
                    .parser()
                    .parse_str(&doc)
                    .map_err(|err| {
                        InternalSnafu {
                            operation: "list DAOs",
                            curl,
                        }
                        .into_error(err.into())
                    })
            }) {
                Ok(record) => merge_names(&mut names, &record),
                Err(err) => debug!("listing only nodes of '{curl}': {err}"),
            }
        }
        Ok(names.join(" "))
    }

    /// Drops the cached document and the bound object of `curl`, then notifies its listeners.
    pub async fn clear_cache(&self, curl: &str) -> Result<(), DalError> {
        self.enter()?;
        self.invalidate(curl::canonical(curl)).await;
        Ok(())
    }

    /// Re-reads the node tree, drops all cached documents and notifies every subscribed curl.
    pub async fn clear_cache_all(&self) -> Result<(), DalError> {
        self.enter()?;
        self.invalidate_all().await;
        Ok(())
    }

    /// Registers a listener and returns its new id.
    pub async fn add_change_listener(
        &self,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<ListenerId, DalError> {
        self.enter()?;
        let reference = listener.reference();
        self.inner.subscriptions.register(listener).map_err(|err| {
            InternalSnafu {
                operation: "register listener",
                curl: reference,
            }
            .into_error(err.into())
        })
    }

    /// Subscribes listener `id` to changes of `curl`.
    pub async fn listen_for_changes(&self, curl: &str, id: ListenerId) -> Result<(), DalError> {
        self.enter()?;
        self.inner.subscriptions.subscribe(curl, id);
        Ok(())
    }

    /// Removes listener `id` and all its subscriptions. Returns whether it was registered.
    pub async fn remove_change_listener(&self, id: ListenerId) -> Result<bool, DalError> {
        self.enter()?;
        Ok(self.inner.subscriptions.unregister(id))
    }

    /// Name of the configuration backend.
    pub async fn configuration_name(&self) -> Result<&'static str, DalError> {
        self.enter()?;
        Ok(CONFIGURATION_NAME)
    }

    /// Shuts the service down. Every later call fails with [`DalError::ServiceUnavailable`].
    pub async fn shutdown(&self) -> Result<(), DalError> {
        self.enter()?;
        self.inner.shutdown.cancel();
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        info!("configuration database shut down");
        Ok(())
    }

    /// Connects a stringified listener reference with the configured connector.
    pub fn connect_listener(
        &self,
        reference: &str,
    ) -> Result<Arc<dyn ChangeListener>, DeliveryError> {
        self.inner.connector.connect(reference)
    }

    /// Whether [`Dal::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`Dal::shutdown`] was called.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Number of operations invoked so far, including rejected ones.
    pub fn invocation_count(&self) -> u64 {
        self.inner.metrics.invocations.get()
    }

    /// The metrics of this service.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Schema files found at the last scan.
    pub fn schema_locations(&self) -> SchemaLocations {
        self.inner.schemas.read().clone()
    }

    fn enter(&self) -> Result<(), DalError> {
        self.inner.metrics.invocations.inc();
        snafu::ensure!(!self.is_shutdown(), ServiceUnavailableSnafu);
        Ok(())
    }

    fn tree(&self) -> Arc<NodeTree> {
        self.inner.tree.read().clone()
    }

    /// Re-reads the node tree from disk. A failed scan keeps the previous tree.
    async fn rescan(&self) {
        let tree = self.tree();
        match tokio::task::spawn_blocking(move || tree.rescan()).await {
            Ok(tree) => {
                *self.inner.tree.write() = Arc::new(tree);
                trace!("node tree rescanned");
            }
            Err(err) => warn!("failed to rescan the node tree: {err}"),
        }
    }

    async fn reload_schemas(&self) {
        let root = self.inner.root.clone();
        match tokio::task::spawn_blocking(move || SchemaLocations::from_env(&root)).await {
            Ok(schemas) => {
                *self.inner.schemas.write() = schemas;
            }
            Err(err) => warn!("failed to reload schemas: {err}"),
        }
    }

    async fn load_document(&self, curl: &str) -> Result<Arc<str>, DalError> {
        let _guard = self.inner.load_lock.lock().await;
        if let Some(document) = self.inner.cache.get(curl) {
            return Ok(document);
        }
        let record = self
            .load_element(curl)
            .await
            .inspect_err(|err| self.report_failure(curl, err))?;
        let document: Arc<str> = record.to_xml().into();
        self.inner.cache.put(curl, document.clone());
        Ok(document)
    }

    async fn load_element(&self, curl: &str) -> Result<Element, DalError> {
        let tree = self.tree();
        let assembler = self.inner.assembler.clone();
        let owned = curl.to_string();
        tokio::task::spawn_blocking(move || assembler.load(&tree, &owned))
            .await
            .map_err(|err| {
                InternalSnafu {
                    operation: "assemble record",
                    curl,
                }
                .into_error(err.into())
            })?
    }

    fn report_failure(&self, curl: &str, err: &DalError) {
        if !err.is_not_found() {
            warn!("failed to load '{curl}': {err}");
            return;
        }
        self.inner.metrics.record_not_found.inc();
        match self.inner.not_found_guard.check(curl) {
            None => {}
            Some(1) => warn!("missing record: {err}"),
            Some(count) => warn!("missing record: {err} (requested {count} times in the last window)"),
        }
    }

    async fn invalidate(&self, curl: &str) {
        let cached = self.inner.cache.remove(curl);
        let bound = self.inner.daos.invalidate(curl);
        trace!("cleared '{curl}' (cached: {cached}, bound: {bound})");
        let outcome = self.inner.subscriptions.notify(curl).await;
        debug!(
            "notified {} listeners of '{curl}', pruned {}",
            outcome.delivered.len(),
            outcome.pruned.len()
        );
    }

    async fn invalidate_all(&self) {
        self.rescan().await;
        self.reload_schemas().await;
        self.inner.cache.clear();
        let curls = self.inner.subscriptions.curls();
        info!("clearing all records, notifying {} curls", curls.len());
        for curl in curls {
            self.invalidate(&curl).await;
        }
    }

    /// Restores persisted listeners and tells them everything changed.
    fn recover_clients(&self) {
        match self.inner.subscriptions.restore(self.inner.connector.as_ref()) {
            Ok(0) => return,
            Ok(restored) => debug!("recovered {restored} listeners"),
            Err(err) => {
                warn!("failed to load listeners: {err}");
                return;
            }
        }
        let dal = self.clone();
        tokio::task::spawn(async move {
            dal.invalidate_all().await;
        });
    }
}

fn merge_names(names: &mut Vec<String>, record: &Element) {
    for name in record.child_names() {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
}

//! Bound data access objects and the registry handing them out.
//!
//! A [`Dao`] exposes field-level access to the record of one curl. The [`DaoRegistry`] makes
//! sure at most one live object exists per curl: lookups take a shared lock, the expensive
//! record load runs without any lock held, and the result is committed under the exclusive
//! lock only if no other caller got there first.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use nested_enum_utils::common_fields;
use parking_lot::RwLock;
use snafu::{Backtrace, Snafu};
use tracing::{debug, trace};

use crate::{curl, metrics::Metrics, record::Element};

/// Shared handle to a bound [`Dao`].
pub type DaoHandle = Arc<Dao>;

/// A failed access to a [`Dao`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DaoError {
    /// The object was invalidated and must be fetched again.
    #[snafu(display("DAO for '{curl}' has been destroyed"))]
    Destroyed { curl: String },
    #[snafu(display("field '{field}' does not exist in '{curl}'"))]
    FieldNotFound { curl: String, field: String },
}

/// A remote object bound to the record of one curl.
#[derive(Debug)]
pub struct Dao {
    id: u64,
    curl: String,
    record: Element,
    destroyed: AtomicBool,
}

impl Dao {
    fn new(id: u64, curl: String, record: Element) -> Self {
        Self {
            id,
            curl,
            record,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Unique id of this binding. A rebound curl gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The curl this object is bound to.
    pub fn curl(&self) -> &str {
        &self.curl
    }

    /// Whether the object has been released.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), DaoError> {
        snafu::ensure!(
            !self.is_destroyed(),
            DestroyedSnafu {
                curl: self.curl.clone()
            }
        );
        Ok(())
    }

    /// Reads a field of the record: an attribute, or a nested element's text.
    ///
    /// Slash separated names address fields of nested elements.
    pub fn get_field(&self, name: &str) -> Result<String, DaoError> {
        self.ensure_alive()?;
        let (scope, field) = match curl::split_last(name) {
            Some((path, field)) => (self.record.child(path).ok(), field),
            None => (Some(&self.record), name),
        };
        scope
            .and_then(|element| element.field(field))
            .map(ToString::to_string)
            .ok_or_else(|| {
                FieldNotFoundSnafu {
                    curl: self.curl.clone(),
                    field: name,
                }
                .build()
            })
    }

    /// Names of attributes and nested elements at the top of the record.
    pub fn field_names(&self) -> Result<Vec<String>, DaoError> {
        self.ensure_alive()?;
        let mut names: Vec<String> = self
            .record
            .attributes()
            .filter(|(key, _)| !key.starts_with("xmlns"))
            .map(|(key, _)| key.to_string())
            .collect();
        for child in self.record.child_names() {
            if !names.iter().any(|n| n == child) {
                names.push(child.to_string());
            }
        }
        Ok(names)
    }

    /// The bound record as XML.
    pub fn to_xml(&self) -> Result<String, DaoError> {
        self.ensure_alive()?;
        Ok(self.record.to_xml())
    }

    /// Releases the object. Every later access fails with [`DaoError::Destroyed`].
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

/// Maps curls to their live [`Dao`].
#[derive(Debug)]
pub struct DaoRegistry {
    daos: RwLock<HashMap<String, DaoHandle>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl DaoRegistry {
    /// Creates an empty registry.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            daos: Default::default(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Returns the live object for `curl`.
    pub fn get(&self, curl: &str) -> Option<DaoHandle> {
        self.daos.read().get(curl::trim_leading_slash(curl)).cloned()
    }

    /// Returns the live object for `curl`, loading its record and binding a new one if needed.
    ///
    /// `load` runs without the registry lock held. When two callers race on the same curl,
    /// both may load, but only the first to commit binds an object; the other result is
    /// dropped and the existing object returned.
    pub async fn get_or_create<F, Fut, E>(&self, curl: &str, load: F) -> Result<DaoHandle, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Element, E>>,
    {
        let curl = curl::trim_leading_slash(curl);
        if let Some(dao) = self.get(curl) {
            trace!("DAO for '{curl}' already bound");
            return Ok(dao);
        }

        let record = load().await?;

        let mut daos = self.daos.write();
        if let Some(dao) = daos.get(curl) {
            trace!("DAO for '{curl}' bound concurrently, dropping loaded record");
            return Ok(dao.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dao = Arc::new(Dao::new(id, curl.to_string(), record));
        daos.insert(curl.to_string(), dao.clone());
        self.metrics.dao_created.inc();
        debug!("bound DAO {id} for '{curl}'");
        Ok(dao)
    }

    /// Removes and destroys the object bound to `curl`, if any.
    ///
    /// Returns whether an object was bound.
    pub fn invalidate(&self, curl: &str) -> bool {
        let curl = curl::trim_leading_slash(curl);
        let mut daos = self.daos.write();
        match daos.remove(curl) {
            Some(dao) => {
                dao.destroy();
                self.metrics.dao_destroyed.inc();
                debug!("destroyed DAO {} for '{curl}'", dao.id());
                true
            }
            None => false,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.daos.read().len()
    }

    /// Whether no objects are bound.
    pub fn is_empty(&self) -> bool {
        self.daos.read().is_empty()
    }
}

//! Shared helpers for unit tests.

use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    cache::{MemoryProbe, MemoryStatus},
    curl,
    listener::{ChangeListener, DeliveryError, ListenerConnector, StatusSnafu},
    record::{AssembleError, Element, RecordParser, XmlRecordParser},
};

/// Writes a record file following the `<curl>/<name>.xml` layout.
pub(crate) fn write_record(base: &Path, curl: &str, xml: &str) -> std::io::Result<()> {
    let path = curl::record_path(base, curl);
    fs::create_dir_all(path.parent().expect("record path has a parent"))?;
    fs::write(path, xml)
}

/// A parser that counts how often it is invoked.
#[derive(Debug, Default)]
pub(crate) struct CountingParser {
    calls: AtomicUsize,
}

impl CountingParser {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecordParser for CountingParser {
    fn parse_str(&self, text: &str) -> Result<Element, AssembleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        XmlRecordParser.parse_str(text)
    }
}

/// A memory probe reporting whatever the test sets.
#[derive(Debug)]
pub(crate) struct FixedProbe {
    status: Mutex<MemoryStatus>,
}

impl FixedProbe {
    pub(crate) fn new(max: u64, allocated: u64) -> Self {
        Self {
            status: Mutex::new(MemoryStatus {
                max,
                allocated,
                free_of_allocated: 0,
            }),
        }
    }

    pub(crate) fn set_allocated(&self, allocated: u64) {
        self.status.lock().allocated = allocated;
    }
}

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> MemoryStatus {
        *self.status.lock()
    }
}

/// A listener recording every notification, optionally failing all deliveries.
#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    reference: String,
    failing: AtomicBool,
    received: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub(crate) fn new(reference: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reference: reference.into(),
            ..Default::default()
        })
    }

    pub(crate) fn failing(reference: impl Into<String>) -> Arc<Self> {
        let listener = Self::new(reference);
        listener.failing.store(true, Ordering::SeqCst);
        listener
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ChangeListener for RecordingListener {
    fn reference(&self) -> String {
        self.reference.clone()
    }

    async fn object_changed(&self, curl: &str) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StatusSnafu { status: 410u16 }.build());
        }
        self.received.lock().push(curl.to_string());
        Ok(())
    }
}

/// Connects references to [`RecordingListener`]s it hands out.
#[derive(Debug, Default)]
pub(crate) struct RecordingConnector {
    connected: Mutex<Vec<Arc<RecordingListener>>>,
}

impl RecordingConnector {
    pub(crate) fn connected(&self) -> Vec<Arc<RecordingListener>> {
        self.connected.lock().clone()
    }
}

impl ListenerConnector for RecordingConnector {
    fn connect(&self, reference: &str) -> Result<Arc<dyn ChangeListener>, DeliveryError> {
        let listener = RecordingListener::new(reference);
        self.connected.lock().push(listener.clone());
        Ok(listener)
    }
}

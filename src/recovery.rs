//! The recovery file: a snapshot of registered listeners and their subscriptions.
//!
//! The format is line oriented. First come `<id>` / `<reference>` line pairs for every
//! listener, then one block per subscribed curl: an empty line, the curl, and one line per
//! listener id. Curls without listeners are not written.
//!
//! ```text
//! 17
//! http://client-a/changed
//! 42
//! http://client-b/changed
//!
//! MACI/Managers/Manager
//! 17
//! 42
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::debug;

use crate::subscriptions::ListenerId;

/// File name of the recovery file inside the data directory.
pub const RECOVERY_FILE_NAME: &str = "CDB_Recovery.txt";

/// Failure to read or write the recovery file.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum RecoveryError {
    #[snafu(display("recovery file {} not accessible", path.display()))]
    Io { path: PathBuf, source: io::Error },
    #[snafu(display("invalid listener id '{value}' at line {line}"))]
    InvalidId {
        line: usize,
        value: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("listener {id} at line {line} has no reference"))]
    InvalidReference { line: usize, id: ListenerId },
}

/// Listeners and subscriptions as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySnapshot {
    /// Listener ids and their stringified references.
    pub listeners: BTreeMap<ListenerId, String>,
    /// Subscribed listener ids per curl.
    pub subscriptions: BTreeMap<String, BTreeSet<ListenerId>>,
}

impl RecoverySnapshot {
    /// Serializes the snapshot.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (id, reference) in &self.listeners {
            out.push_str(&format!("{id}\n{reference}\n"));
        }
        for (curl, ids) in &self.subscriptions {
            if ids.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str(curl);
            out.push('\n');
            for id in ids {
                out.push_str(&format!("{id}\n"));
            }
        }
        out
    }

    /// Parses a snapshot written by [`RecoverySnapshot::encode`].
    pub fn decode(text: &str) -> Result<Self, RecoveryError> {
        let mut snapshot = Self::default();
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim_end()));

        // listener block, up to the first empty line
        while let Some((line, value)) = lines.next() {
            if value.is_empty() {
                break;
            }
            let id = parse_id(line, value)?;
            let reference = match lines.next() {
                Some((_, reference)) if !reference.is_empty() => reference,
                _ => return InvalidReferenceSnafu { line, id }.fail(),
            };
            snapshot.listeners.insert(id, reference.to_string());
        }

        // curl blocks, each terminated by an empty line or the end of the file
        let mut current: Option<String> = None;
        for (line, value) in lines {
            if value.is_empty() {
                current = None;
                continue;
            }
            match &current {
                None => current = Some(value.to_string()),
                Some(curl) => {
                    let id = parse_id(line, value)?;
                    snapshot
                        .subscriptions
                        .entry(curl.clone())
                        .or_default()
                        .insert(id);
                }
            }
        }
        Ok(snapshot)
    }
}

fn parse_id(line: usize, value: &str) -> Result<ListenerId, RecoveryError> {
    value
        .parse::<u32>()
        .map(ListenerId::from)
        .context(InvalidIdSnafu { line, value })
}

/// Location of the recovery file.
#[derive(Debug, Clone)]
pub struct RecoveryFile {
    path: PathBuf,
}

impl RecoveryFile {
    /// Uses the recovery file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot. A missing file reads as `None`.
    pub fn read(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(IoSnafu { path: &self.path }),
        };
        RecoverySnapshot::decode(&text).map(Some)
    }

    /// Rewrites the whole file from `snapshot`.
    ///
    /// The snapshot goes to a sibling temp file first, which then replaces the file. The file is
    /// group writable.
    pub fn write(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        let path = &self.path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(IoSnafu { path })?;
        }
        let tmp_path = self.tmp_path();
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o664);
        }
        let mut file = options
            .open(&tmp_path)
            .context(IoSnafu { path: &tmp_path })?;
        file.write_all(snapshot.encode().as_bytes())
            .context(IoSnafu { path: &tmp_path })?;
        file.sync_all().context(IoSnafu { path: &tmp_path })?;
        drop(file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o664))
                .context(IoSnafu { path: &tmp_path })?;
        }
        fs::rename(&tmp_path, path).context(IoSnafu { path })?;
        debug!("wrote recovery file {}", path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn id(value: u32) -> ListenerId {
        ListenerId::from(value)
    }

    fn sample() -> RecoverySnapshot {
        let mut snapshot = RecoverySnapshot::default();
        snapshot.listeners.insert(id(17), "http://a/changed".into());
        snapshot.listeners.insert(id(42), "http://b/changed".into());
        snapshot
            .subscriptions
            .insert("MACI/Managers/Manager".into(), [id(17), id(42)].into());
        snapshot.subscriptions.insert("Other".into(), [id(42)].into());
        snapshot.subscriptions.insert("Empty".into(), BTreeSet::new());
        snapshot
    }

    #[test]
    fn encodes_line_blocks() {
        assert_eq!(
            sample().encode(),
            "17\nhttp://a/changed\n42\nhttp://b/changed\n\nMACI/Managers/Manager\n17\n42\n\nOther\n42\n"
        );
    }

    #[test]
    fn decodes_what_it_encodes() -> TestResult {
        let mut expected = sample();
        expected.subscriptions.remove("Empty");
        assert_eq!(RecoverySnapshot::decode(&sample().encode())?, expected);
        Ok(())
    }

    #[test]
    fn decodes_edge_shapes() -> TestResult {
        assert_eq!(RecoverySnapshot::decode("")?, RecoverySnapshot::default());

        // subscriptions whose listeners are no longer registered
        let only_curls = RecoverySnapshot::decode("\nA\n5\n\n\nB\n6\n")?;
        assert!(only_curls.listeners.is_empty());
        assert_eq!(only_curls.subscriptions.len(), 2);

        // windows line endings
        let crlf = RecoverySnapshot::decode("1\r\nhttp://x/\r\n\r\nA\r\n1\r\n")?;
        assert_eq!(crlf.listeners[&id(1)], "http://x/");
        assert!(crlf.subscriptions["A"].contains(&id(1)));
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            RecoverySnapshot::decode("abc\nhttp://x/\n"),
            Err(RecoveryError::InvalidId { line: 1, .. })
        ));
        assert!(matches!(
            RecoverySnapshot::decode("1\n"),
            Err(RecoveryError::InvalidReference { line: 1, .. })
        ));
        assert!(matches!(
            RecoverySnapshot::decode("1\nhttp://x/\n\nA\n-3\n"),
            Err(RecoveryError::InvalidId { line: 5, .. })
        ));
    }

    #[test]
    fn file_round_trip() -> TestResult {
        let dir = tempfile::tempdir()?;
        let file = RecoveryFile::new(dir.path().join("state").join(RECOVERY_FILE_NAME));
        assert!(file.read()?.is_none());

        file.write(&sample())?;
        let restored = file.read()?.expect("file was written");
        assert_eq!(restored.listeners, sample().listeners);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(file.path())?.permissions().mode();
            assert_eq!(mode & 0o777, 0o664);
        }
        Ok(())
    }

    #[test]
    fn rewrite_replaces_the_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let file = RecoveryFile::new(dir.path().join(RECOVERY_FILE_NAME));
        file.write(&sample())?;
        fs::write(file.tmp_path(), "stale")?;

        let mut smaller = RecoverySnapshot::default();
        smaller.listeners.insert(id(5), "http://c/changed".into());
        file.write(&smaller)?;

        assert_eq!(file.read()?, Some(smaller));
        assert!(!file.tmp_path().exists());
        let entries: Vec<_> = fs::read_dir(dir.path())?.collect::<Result<_, _>>()?;
        assert_eq!(entries.len(), 1);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(file.path())?.permissions().mode();
            assert_eq!(mode & 0o777, 0o664);
        }
        Ok(())
    }
}

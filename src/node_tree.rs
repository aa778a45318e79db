//! The on-disk tree of configuration nodes.
//!
//! Every directory below the database root is a node. A node owns a record if its directory
//! contains `<name>.xml`; a node with a record and no child nodes is *simple*, every other node
//! is *complex* and is assembled from its children on read.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::curl;

/// Directory at the database root holding schema files rather than records.
const SCHEMAS_DIR: &str = "schemas";

/// A node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    curl: String,
    has_record: bool,
    children: Vec<Node>,
    other_records: Vec<String>,
}

impl Node {
    /// The directory name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical curl of this node. Empty for the root.
    pub fn curl(&self) -> &str {
        &self.curl
    }

    /// Whether the node directory holds its own record file.
    pub fn has_record(&self) -> bool {
        self.has_record
    }

    /// Whether the node is backed by exactly one file.
    pub fn is_simple(&self) -> bool {
        self.has_record && self.children.is_empty()
    }

    /// Child nodes, sorted by name.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn scan(dir: &Path, name: String, curl: String, is_root: bool) -> Self {
        let mut children = Vec::new();
        let mut other_records = Vec::new();
        let own_record = format!("{name}.xml");
        let mut has_record = false;

        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let file_name = entry.file_name().to_string_lossy().into_owned();
                    if file_name.starts_with('.') {
                        continue;
                    }
                    let Ok(file_type) = entry.file_type() else {
                        continue;
                    };
                    if file_type.is_dir() {
                        if is_root && file_name == SCHEMAS_DIR {
                            continue;
                        }
                        let child_curl = curl::join(&curl, &file_name);
                        children.push(Node::scan(&entry.path(), file_name, child_curl, false));
                    } else if file_name == own_record {
                        has_record = true;
                    } else if let Some(stem) = file_name.strip_suffix(".xml") {
                        other_records.push(stem.to_string());
                    }
                }
            }
            Err(err) => debug!("cannot list {}: {err}", dir.display()),
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        other_records.sort();

        Self {
            name,
            curl,
            has_record,
            children,
            other_records,
        }
    }
}

/// Snapshot of the node hierarchy below a database root.
#[derive(Debug, Clone)]
pub struct NodeTree {
    base: PathBuf,
    root: Node,
}

impl NodeTree {
    /// Scans the directory hierarchy below `base`.
    ///
    /// A missing or unreadable root yields an empty tree.
    pub fn scan(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = Node::scan(&base, name, String::new(), true);
        trace!("scanned node tree at {}", base.display());
        Self { base, root }
    }

    /// Rebuilds the tree from disk.
    pub fn rescan(&self) -> Self {
        Self::scan(&self.base)
    }

    /// The directory this tree was scanned from.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The root node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Finds the node at `curl`. The empty curl addresses the root.
    pub fn find(&self, curl: &str) -> Option<&Node> {
        let mut node = &self.root;
        for segment in curl::canonical(curl).split('/').filter(|s| !s.is_empty()) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Lists the children of the node at `curl` as space separated names.
    ///
    /// Child directories are listed by name, other record files in the directory by their name
    /// without the `.xml` extension. Unknown curls list as empty.
    pub fn list(&self, curl: &str) -> String {
        let Some(node) = self.find(curl) else {
            return String::new();
        };
        let mut names: Vec<&str> = node.children.iter().map(|c| c.name.as_str()).collect();
        for other in &node.other_records {
            if !names.contains(&other.as_str()) {
                names.push(other);
            }
        }
        names.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use testresult::TestResult;

    use super::*;
    use crate::test_utils::write_record;

    #[test]
    fn scan_classifies_nodes() -> TestResult {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("CDB");
        write_record(&base, "MACI/Managers/Manager", "<Manager/>")?;
        write_record(&base, "MACI/Containers/Container", "<Container/>")?;
        write_record(&base, "MACI/Containers/Container/Sub", "<Sub/>")?;
        fs::create_dir_all(base.join("schemas"))?;
        fs::create_dir_all(base.join(".svn"))?;
        fs::write(base.join("MACI/Containers/Extra.xml"), "<Extra/>")?;

        let tree = NodeTree::scan(&base);
        assert_eq!(tree.root().name(), "CDB");
        assert_eq!(tree.list(""), "MACI");

        let manager = tree.find("MACI/Managers/Manager").expect("manager exists");
        assert!(manager.is_simple());
        assert_eq!(manager.curl(), "MACI/Managers/Manager");

        let container = tree.find("/MACI/Containers/Container/").expect("container exists");
        assert!(container.has_record());
        assert!(!container.is_simple());

        let managers = tree.find("MACI/Managers").expect("managers exists");
        assert!(!managers.has_record());
        assert!(!managers.is_simple());

        assert_eq!(tree.list("MACI/Containers"), "Container Extra");
        assert_eq!(tree.list("MACI/Managers/Manager"), "");
        assert_eq!(tree.list("Nowhere"), "");
        assert!(tree.find("MACI/Nowhere").is_none());
        Ok(())
    }

    #[test]
    fn missing_root_is_empty() {
        let tree = NodeTree::scan("/definitely/not/a/cdb/root");
        assert!(tree.root().children().is_empty());
        assert_eq!(tree.list(""), "");
    }
}

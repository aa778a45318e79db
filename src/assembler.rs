//! Turns located nodes into parsed records.
//!
//! Simple nodes are parsed straight from their file. Complex nodes are assembled: the node's
//! own record, if any, becomes the root element and every child node is appended to it as an
//! element named after the child, recursively.

use std::{error::Error, path::Path, sync::Arc};

use snafu::IntoError;
use tracing::{debug, trace};

use crate::{
    cache::DocumentCache,
    curl,
    error::{DalError, InternalSnafu, RecordMalformedSnafu, RecordNotFoundSnafu},
    node_tree::{Node, NodeTree},
    record::{AssembleError, Element, RecordParser},
    resolver,
};

/// Adapter between the node tree, the record parser and the document cache.
#[derive(Debug, Clone)]
pub struct Assembler {
    parser: Arc<dyn RecordParser>,
    cache: Arc<DocumentCache>,
}

impl Assembler {
    /// Creates an assembler parsing with `parser` and reusing documents from `cache`.
    pub fn new(parser: Arc<dyn RecordParser>, cache: Arc<DocumentCache>) -> Self {
        Self { parser, cache }
    }

    /// The record parser.
    pub fn parser(&self) -> &Arc<dyn RecordParser> {
        &self.parser
    }

    /// Resolves `curl` against `tree` and returns the requested element.
    ///
    /// This reads files and may take a while; call it off the async executor.
    pub fn load(&self, tree: &NodeTree, curl: &str) -> Result<Element, DalError> {
        let located = resolver::locate(tree, curl)?;
        let record = if located.node.is_simple() {
            self.load_record(tree.base(), located.node)?
        } else {
            self.assemble_node(tree.base(), located.node)?
        };
        resolver::extract(&located, record)
    }

    /// Parses the record file of `node`.
    pub fn load_record(&self, base: &Path, node: &Node) -> Result<Element, DalError> {
        let path = curl::record_path(base, node.curl());
        trace!("loading record '{}' from {}", node.curl(), path.display());
        self.parser
            .parse_file(&path)
            .map_err(|err| assemble_error(node.curl(), &path, err))
    }

    /// Builds the record of `node` from its own file and all its child nodes.
    pub fn assemble_node(&self, base: &Path, node: &Node) -> Result<Element, DalError> {
        let mut element = if node.has_record() {
            self.load_record(base, node)?
        } else {
            Element::new(node.name())
        };
        for child in node.children() {
            let mut child_element = match self.cached_record(child) {
                Some(cached) => cached,
                None if child.is_simple() => self.load_record(base, child)?,
                None => self.assemble_node(base, child)?,
            };
            child_element.set_name(child.name());
            element.push_child(child_element);
        }
        Ok(element)
    }

    /// The parsed cached document of a simple node, if there is a usable one.
    fn cached_record(&self, node: &Node) -> Option<Element> {
        if !node.is_simple() {
            return None;
        }
        let text = self.cache.peek(node.curl())?;
        match self.parser.parse_str(&text) {
            Ok(element) => {
                trace!("reusing cached document of '{}'", node.curl());
                Some(element)
            }
            Err(err) => {
                debug!("cached document of '{}' unusable: {err}", node.curl());
                None
            }
        }
    }
}

fn assemble_error(curl: &str, path: &Path, err: AssembleError) -> DalError {
    match err {
        AssembleError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            RecordNotFoundSnafu { curl }.build()
        }
        err @ AssembleError::Io { .. } => InternalSnafu {
            operation: "read record",
            curl,
        }
        .into_error(err.into()),
        err => RecordMalformedSnafu {
            curl,
            path: path.display().to_string(),
            detail: error_chain(&err),
        }
        .build(),
    }
}

/// Formats an error together with its sources.
fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        out.push_str(": ");
        out.push_str(&err.to_string());
        source = err.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::{
        cache::DEFAULT_TARGET_FREE_RATIO,
        metrics::Metrics,
        record::XmlRecordParser,
        test_utils::{CountingParser, FixedProbe, write_record},
    };

    fn assembler(parser: Arc<dyn RecordParser>) -> Assembler {
        let cache = DocumentCache::new(
            Arc::new(FixedProbe::new(u64::MAX, 0)),
            DEFAULT_TARGET_FREE_RATIO,
            Arc::new(Metrics::default()),
        );
        Assembler::new(parser, Arc::new(cache))
    }

    fn containers() -> TestResult<(tempfile::TempDir, NodeTree)> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("CDB");
        write_record(&base, "MACI/Containers", r#"<Containers Default="yes"/>"#)?;
        write_record(&base, "MACI/Containers/C1", r#"<Container Timeout="1"/>"#)?;
        write_record(
            &base,
            "MACI/Containers/C2",
            r#"<Container Timeout="2"><Autoload><e Name="baci"/></Autoload></Container>"#,
        )?;
        write_record(&base, "MACI/Containers/Group/C3", r#"<Container Timeout="3"/>"#)?;
        Ok((dir, NodeTree::scan(&base)))
    }

    #[test]
    fn assembles_complex_nodes() -> TestResult {
        let (_dir, tree) = containers()?;
        let assembler = assembler(Arc::new(XmlRecordParser));
        let record = assembler.load(&tree, "MACI/Containers")?;
        assert_eq!(record.name(), "Containers");
        assert_eq!(record.attribute("Default"), Some("yes"));
        assert_eq!(record.child_names(), vec!["C1", "C2", "Group"]);
        assert_eq!(record.child("Group/C3")?.attribute("Timeout"), Some("3"));

        let directory_only = assembler.load(&tree, "MACI")?;
        assert_eq!(directory_only.name(), "MACI");
        assert_eq!(directory_only.child_names(), vec!["Containers"]);
        Ok(())
    }

    #[test]
    fn extracts_residuals_through_files_and_assemblies() -> TestResult {
        let (_dir, tree) = containers()?;
        let assembler = assembler(Arc::new(XmlRecordParser));
        let named = assembler.load(&tree, "MACI/Containers/C2/Autoload/baci")?;
        assert_eq!(named.name(), "e");
        let through_parent = assembler.load(&tree, "MACI/Containers/Group/C3")?;
        assert_eq!(through_parent.attribute("Timeout"), Some("3"));

        let err = assembler.load(&tree, "MACI/Containers/C9").unwrap_err();
        assert_eq!(err.curl(), Some("MACI/Containers/C9"));
        Ok(())
    }

    #[test]
    fn reuses_cached_simple_children() -> TestResult {
        let (_dir, tree) = containers()?;
        let parser = Arc::new(CountingParser::default());
        let assembler = assembler(parser.clone());
        assembler
            .cache
            .put("MACI/Containers/C1", r#"<Container Timeout="cached"/>"#);

        let record = assembler.load(&tree, "MACI/Containers")?;
        assert_eq!(record.child("C1")?.attribute("Timeout"), Some("cached"));
        // Containers, cached C1, C2 and C3
        assert_eq!(parser.calls(), 4);
        Ok(())
    }

    #[test]
    fn malformed_records_name_file_and_curl() -> TestResult {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("CDB");
        write_record(&base, "Broken", "<Broken><a></Broken>")?;
        let tree = NodeTree::scan(&base);

        let err = assembler(Arc::new(XmlRecordParser))
            .load(&tree, "Broken")
            .unwrap_err();
        match err {
            DalError::RecordMalformed { curl, path, .. } => {
                assert_eq!(curl, "Broken");
                assert!(path.ends_with("Broken.xml"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }
}

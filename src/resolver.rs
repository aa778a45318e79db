//! Resolution of curls to the node holding them.
//!
//! A curl either names a node of the tree, or an element inside the record of one of its
//! ancestors. [`locate`] finds the longest existing ancestor and returns the unmatched rest of
//! the curl as the residual path, which [`extract`] then looks up in the assembled record.

use tracing::trace;

use crate::{
    curl,
    error::{DalError, RecordNotFoundSnafu},
    node_tree::{Node, NodeTree},
    record::Element,
};

/// A node found for a curl, plus the part of the curl below it.
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    /// The longest existing ancestor of the requested curl.
    pub node: &'a Node,
    /// Path of the requested element inside the node's record. Empty if the node itself was
    /// requested.
    pub residual: &'a str,
}

/// Finds the longest ancestor of `curl` that exists as a node.
///
/// The empty curl addresses the root. Any other curl must match at least its first segment,
/// otherwise the lookup fails with [`DalError::RecordNotFound`] carrying the full curl.
pub fn locate<'a>(tree: &'a NodeTree, curl: &'a str) -> Result<Located<'a>, DalError> {
    let requested = curl::canonical(curl);
    if requested.is_empty() {
        return Ok(Located {
            node: tree.root(),
            residual: "",
        });
    }

    let mut candidate = requested;
    loop {
        if let Some(node) = tree.find(candidate) {
            let residual = requested[candidate.len()..].trim_start_matches('/');
            trace!("curl '{requested}' resolved to node '{candidate}', residual '{residual}'");
            return Ok(Located { node, residual });
        }
        match curl::split_last(candidate) {
            Some((parent, _)) if !parent.is_empty() => candidate = parent,
            _ => {
                return RecordNotFoundSnafu {
                    curl: requested.to_string(),
                }
                .fail();
            }
        }
    }
}

/// Extracts the residual element of `located` from `record`, the assembled record of its
/// node.
///
/// A missing element fails with the node curl and the walked part of the residual joined,
/// so the error names the requested curl up to the first missing segment.
pub fn extract(located: &Located<'_>, record: Element) -> Result<Element, DalError> {
    if located.residual.is_empty() {
        return Ok(record);
    }
    match record.child(located.residual) {
        Ok(element) => Ok(element.clone()),
        Err(missing) => RecordNotFoundSnafu {
            curl: curl::join(located.node.curl(), &missing),
        }
        .fail(),
    }
}

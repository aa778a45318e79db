//! Shared state for the HTTP handlers

use crate::dal::Dal;

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The configuration database
    pub dal: Dal,
}

//! Discovery of XML schema files for configuration records.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

/// Environment variable with additional directories to search for schemas.
pub const SCHEMA_PATH_ENV: &str = "CDB_SCHEMA_PATH";

/// Schema directory inside the database root.
pub const SCHEMAS_DIR: &str = "schemas";

/// Schema files by name, in search order. The first file of a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaLocations {
    schemas: BTreeMap<String, PathBuf>,
}

impl SchemaLocations {
    /// Collects `*.xsd` files from `<root>/schemas`, then from every directory of
    /// `search_path`.
    pub fn discover(root: &Path, search_path: Option<&OsStr>) -> Self {
        let mut dirs = vec![root.join(SCHEMAS_DIR)];
        if let Some(search_path) = search_path {
            dirs.extend(std::env::split_paths(search_path));
        }

        let mut schemas = BTreeMap::new();
        for dir in dirs {
            let Ok(entries) = fs::read_dir(&dir) else {
                trace!("no schemas in {}", dir.display());
                continue;
            };
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension() == Some(OsStr::new("xsd")))
                .collect();
            files.sort();
            for file in files {
                let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                schemas.entry(stem.to_string()).or_insert(file);
            }
        }
        debug!("found {} schemas", schemas.len());
        Self { schemas }
    }

    /// Discovers schemas using the search path from [`SCHEMA_PATH_ENV`].
    pub fn from_env(root: &Path) -> Self {
        Self::discover(root, std::env::var_os(SCHEMA_PATH_ENV).as_deref())
    }

    /// Number of schemas found.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether no schema was found.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Path of the schema named `name`.
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.schemas.get(name).map(PathBuf::as_path)
    }

    /// The `schemaLocation` value mapping each schema namespace to its file.
    pub fn external_schema_location(&self) -> String {
        self.schemas
            .iter()
            .map(|(name, path)| {
                format!("urn:schemas-cosylab-com:{name}:1.0 {}", path.display())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn first_directory_wins() -> TestResult {
        let root = tempfile::tempdir()?;
        let extra = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join(SCHEMAS_DIR))?;
        fs::write(root.path().join("schemas/Manager.xsd"), "")?;
        fs::write(root.path().join("schemas/README"), "")?;
        fs::write(extra.path().join("Manager.xsd"), "")?;
        fs::write(extra.path().join("Container.xsd"), "")?;

        let search = std::env::join_paths([extra.path()])?;
        let schemas = SchemaLocations::discover(root.path(), Some(&search));
        assert_eq!(schemas.len(), 2);
        assert_eq!(
            schemas.get("Manager"),
            Some(root.path().join("schemas/Manager.xsd").as_path())
        );
        assert_eq!(
            schemas.external_schema_location(),
            format!(
                "urn:schemas-cosylab-com:Container:1.0 {} urn:schemas-cosylab-com:Manager:1.0 {}",
                extra.path().join("Container.xsd").display(),
                root.path().join("schemas/Manager.xsd").display(),
            )
        );
        Ok(())
    }

    #[test]
    fn missing_directories_are_skipped() {
        let schemas = SchemaLocations::discover(Path::new("/definitely/not/here"), None);
        assert!(schemas.is_empty());
        assert_eq!(schemas.external_schema_location(), "");
    }
}

use std::path::{Path, PathBuf};

/// Directory layout for one unit under the substrate base dir.
#[derive(Debug, Clone)]
pub struct UnitPaths {
    root: PathBuf,
}

impl UnitPaths {
    pub fn new(base_dir: &Path, id: &str) -> Self {
        Self {
            root: base_dir.join("units").join(id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writable scratch area the guest runs in.
    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn tmp(&self) -> PathBuf {
        self.scratch().join(".tmp")
    }
}

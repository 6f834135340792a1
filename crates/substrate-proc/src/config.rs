use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ProcConfig {
    /// Base directory for unit scratch areas.
    pub base_dir: PathBuf,
}

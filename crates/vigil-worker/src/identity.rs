//! Stable worker identity.
//!
//! A worker keeps the same id across restarts so the control plane sees a
//! returning worker rather than a new one.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

const ID_FILE: &str = "worker-id";

/// Default state directory: ~/.vigil
pub fn default_state_dir() -> io::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".vigil"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Cannot determine home directory"))
}

/// Read the worker id stored in `state_dir`, generating and storing one on
/// first use.
pub fn load_or_generate(state_dir: &Path) -> io::Result<String> {
    let path = state_dir.join(ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let id = format!("worker-{}", uuid::Uuid::new_v4());
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(&path, format!("{id}\n"))?;
    info!(worker_id = %id, path = %path.display(), "Generated worker id");
    Ok(id)
}

//! The `project.json` document.
//!
//! The document wraps a [`ProjectSnapshot`] in a small envelope carrying a
//! format number:
//!
//! ```json
//! { "format": 1, "project": { "id": "...", "name": "...", ... } }
//! ```
//!
//! Goals are stored once, in the project's goal set, and flight plans refer
//! to them by id. Loading drops references to goals that do not exist, so a
//! goal shared by several flight plans is still a single goal after a round
//! trip.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::SerializationError;
use crate::model::ProjectSnapshot;

/// File name of the project document inside a project directory.
pub const PROJECT_FILE: &str = "project.json";

/// Newest document format this build reads and the one it writes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    format: u32,
    project: &'a ProjectSnapshot,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default = "default_format")]
    format: u32,
    project: ProjectSnapshot,
}

fn default_format() -> u32 {
    FORMAT_VERSION
}

pub fn to_json_bytes(snapshot: &ProjectSnapshot) -> Result<Vec<u8>, SerializationError> {
    let document = DocumentRef {
        format: FORMAT_VERSION,
        project: snapshot,
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

pub fn from_json_slice(bytes: &[u8]) -> Result<ProjectSnapshot, SerializationError> {
    let document: Document = serde_json::from_slice(bytes)?;
    if document.format > FORMAT_VERSION {
        return Err(SerializationError::UnsupportedFormat {
            found: document.format,
            supported: FORMAT_VERSION,
        });
    }
    let mut snapshot = document.project;
    snapshot.prune_dangling_references();
    Ok(snapshot)
}

/// Read `project.json` from a project directory.
pub fn read_project_file(dir: &Path) -> Result<ProjectSnapshot, SerializationError> {
    let bytes = std::fs::read(dir.join(PROJECT_FILE))?;
    from_json_slice(&bytes)
}

/// Write `project.json` into a project directory, replacing any previous
/// document atomically.
pub fn write_project_file(dir: &Path, snapshot: &ProjectSnapshot) -> Result<(), SerializationError> {
    let bytes = to_json_bytes(snapshot)?;
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    file.persist(dir.join(PROJECT_FILE))
        .map_err(|e| SerializationError::Io(e.error))?;

    debug!(
        project_id = %snapshot.id,
        version = snapshot.version,
        bytes = bytes.len(),
        "project document written"
    );
    Ok(())
}

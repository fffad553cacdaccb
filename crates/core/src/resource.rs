//! Named resource attachments stored next to a project.
//!
//! A project refers to attachments by name only ([`ResourceRef`]); a
//! [`ResourceResolver`] maps such a name to a byte stream for one storage
//! backend.
//!
//! [`ResourceRef`]: crate::model::ResourceRef

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::RepositoryError;
use crate::serialization::PROJECT_FILE;

/// An output stream whose content only becomes visible on `commit`.
///
/// Dropping the writer without committing discards everything written.
pub trait ResourceWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Opens named resources of a single project.
pub trait ResourceResolver: Send + Sync {
    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>, RepositoryError>;

    fn open_output(&self, name: &str) -> Result<Box<dyn ResourceWriter>, RepositoryError>;

    fn exists(&self, name: &str) -> Result<bool, RepositoryError>;
}

// ---------------------------------------------------------------------------
// Filesystem resolver
// ---------------------------------------------------------------------------

/// Resolves resources as files inside a project directory.
#[derive(Debug, Clone)]
pub struct FsResourceResolver {
    dir: PathBuf,
}

impl FsResourceResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, RepositoryError> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain || relative == Path::new(PROJECT_FILE) {
            return Err(RepositoryError::InvalidResourceName(name.to_string()));
        }
        Ok(self.dir.join(relative))
    }
}

impl ResourceResolver for FsResourceResolver {
    fn open_input(&self, name: &str) -> Result<Box<dyn Read + Send>, RepositoryError> {
        let path = self.resolve(name)?;
        let file = File::open(&path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn open_output(&self, name: &str) -> Result<Box<dyn ResourceWriter>, RepositoryError> {
        let target = self.resolve(name)?;
        let parent = target.parent().unwrap_or(&self.dir);
        std::fs::create_dir_all(parent)?;
        let file = NamedTempFile::new_in(parent)?;
        Ok(Box::new(AtomicFileWriter { file, target }))
    }

    fn exists(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.resolve(name)?.is_file())
    }
}

/// Writes to a temporary file in the target's directory and renames it into
/// place on commit.
struct AtomicFileWriter {
    file: NamedTempFile,
    target: PathBuf,
}

impl Write for AtomicFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ResourceWriter for AtomicFileWriter {
    fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let AtomicFileWriter { mut file, target } = *self;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|e| RepositoryError::Io(e.error))?;
        debug!(path = %target.display(), "resource written");
        Ok(())
    }
}

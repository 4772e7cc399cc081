//! The Loader abstraction: how `#include`/`#parse`/`#evaluate` targets are
//! turned into source text, and how a caching file-backed implementation
//! tracks freshness so a long-lived [`crate::cache::Cache`] knows when to
//! reparse.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Error, Result};

/// A freshness token a [`crate::cache::Cache`] can compare cheaply against
/// what it last saw, without needing to diff source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// This text never changes underneath the loader (e.g. an in-memory
    /// string source); once cached, never reparsed.
    Static,
    Mtime(SystemTime),
}

#[derive(Debug, Clone)]
pub struct LoadedText {
    pub source: Arc<str>,
    pub freshness: Freshness,
}

/// Resolves a logical template name to source text. Implementations decide
/// what a "name" means -- a relative file path, a database key, a key into
/// an in-memory map -- the rest of the crate only ever calls `load_text`.
pub trait Loader: fmt::Debug + Send + Sync {
    fn load_text(&self, name: &str) -> Result<LoadedText>;
}

/// A loader that resolves nothing; `#include`/`#parse`/`#evaluate` all fail
/// with [`Error::NotFound`]. The default when a caller renders a template
/// with no configured loader.
#[derive(Debug, Default)]
pub struct NullLoader;

impl Loader for NullLoader {
    fn load_text(&self, name: &str) -> Result<LoadedText> {
        Err(Error::not_found(name))
    }
}

/// Resolves names as paths relative to a fixed root directory, rejecting
/// any name that would escape it (absolute paths, `..` components, or a
/// resolved path outside `root`). Freshness is the file's mtime via
/// [`filetime`], read on every lookup -- cheap relative to a reparse, and
/// exactly what [`crate::cache::Cache`] needs to decide whether to reuse
/// its cached AST.
#[derive(Debug)]
pub struct FileLoader {
    root: PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileLoader { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if rel.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))) {
            return Err(Error::not_found(name));
        }
        Ok(self.root.join(rel))
    }
}

impl Loader for FileLoader {
    fn load_text(&self, name: &str) -> Result<LoadedText> {
        let path = self.resolve(name)?;
        let source = std::fs::read_to_string(&path).map_err(|e| {
            log::debug!("FileLoader: {} ({})", path.display(), e);
            Error::not_found(name)
        })?;
        let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path).map_err(|_| Error::not_found(name))?);
        let freshness = Freshness::Mtime(SystemTime::UNIX_EPOCH + std::time::Duration::new(mtime.unix_seconds().max(0) as u64, mtime.nanoseconds()));
        Ok(LoadedText { source: Arc::from(source.as_str()), freshness })
    }
}

/// Serves pre-registered in-memory strings; used by tests and by hosts that
/// already hold template sources (e.g. bundled as `include_str!`). Entries
/// never change once inserted, so every lookup reports `Freshness::Static`.
#[derive(Debug, Default)]
pub struct StringLoader {
    entries: std::collections::HashMap<String, Arc<str>>,
}

impl StringLoader {
    pub fn new() -> Self {
        StringLoader::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<Arc<str>>) {
        self.entries.insert(name.into(), source.into());
    }
}

impl Loader for StringLoader {
    fn load_text(&self, name: &str) -> Result<LoadedText> {
        match self.entries.get(name) {
            Some(source) => Ok(LoadedText { source: source.clone(), freshness: Freshness::Static }),
            None => Err(Error::not_found(name)),
        }
    }
}

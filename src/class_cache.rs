//! Peer-side type resolution for an uploaded application.
//!
//! Names resolve against the in-memory cache first, then the platform types
//! the peer was built with, and only then against class files extracted
//! under the application directory. Platform types are never shadowed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::ClassLoadError;
use crate::queue::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOrigin {
    Platform,
    Application { path: PathBuf, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    pub name: String,
    pub origin: ClassOrigin,
}

impl LoadedClass {
    pub fn is_platform(&self) -> bool {
        matches!(self.origin, ClassOrigin::Platform)
    }
}

pub struct ClassCache {
    app_dir: PathBuf,
    platform: HashSet<String>,
    loaded: Mutex<HashMap<String, Arc<LoadedClass>>>,
}

impl ClassCache {
    pub fn new(app_dir: impl Into<PathBuf>, platform: HashSet<String>) -> Self {
        Self {
            app_dir: app_dir.into(),
            platform,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn cached(&self) -> usize {
        lock(&self.loaded).len()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<LoadedClass>, ClassLoadError> {
        if let Some(hit) = lock(&self.loaded).get(name) {
            return Ok(Arc::clone(hit));
        }

        let class = if self.platform.contains(name) {
            LoadedClass {
                name: name.to_string(),
                origin: ClassOrigin::Platform,
            }
        } else {
            let path = self.class_path(name)?;
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(ClassLoadError::NotFound(name.to_string()))
                }
                Err(source) => {
                    return Err(ClassLoadError::Io {
                        name: name.to_string(),
                        path,
                        source,
                    })
                }
            };
            debug!(class = name, bytes = bytes.len(), "loaded class from application directory");
            LoadedClass {
                name: name.to_string(),
                origin: ClassOrigin::Application { path, bytes },
            }
        };

        let class = Arc::new(class);
        let mut loaded = lock(&self.loaded);
        // A concurrent resolve may have won; keep the first entry.
        let entry = loaded
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&class));
        Ok(Arc::clone(entry))
    }

    /// `a.b.C` maps to `<app_dir>/a/b/C.class`.
    fn class_path(&self, name: &str) -> Result<PathBuf, ClassLoadError> {
        let invalid = || ClassLoadError::InvalidName(name.to_string());
        if name.is_empty() {
            return Err(invalid());
        }
        let mut path = self.app_dir.clone();
        let segments: Vec<&str> = name.split('.').collect();
        for (i, seg) in segments.iter().enumerate() {
            if seg.is_empty() || seg.contains(['/', '\\']) || *seg == ".." {
                return Err(invalid());
            }
            if i + 1 == segments.len() {
                path.push(format!("{seg}.class"));
            } else {
                path.push(seg);
            }
        }
        Ok(path)
    }
}

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

/// The offloaded application as the peer sees it: an opaque blob with an
/// identifier and a known size.
#[derive(Debug, Clone)]
pub struct AppPackage {
    pub app_id: String,
    pub size: u64,
    source: PayloadSource,
}

#[derive(Debug, Clone)]
enum PayloadSource {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl AppPackage {
    /// Package backed by a file on disk. The id is the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat application package '{}'", path.display()))?;
        if !meta.is_file() {
            return Err(anyhow!(
                "application package '{}' is not a file",
                path.display()
            ));
        }
        let app_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "cannot derive an application id from '{}'",
                    path.display()
                )
            })?
            .to_string();
        Ok(Self {
            app_id,
            size: meta.len(),
            source: PayloadSource::File(path.to_path_buf()),
        })
    }

    pub fn from_bytes(app_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            app_id: app_id.into(),
            size: bytes.len() as u64,
            source: PayloadSource::Memory(Arc::new(bytes)),
        }
    }

    /// Open a fresh reader over the payload.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            PayloadSource::File(path) => Ok(Box::new(File::open(path)?)),
            PayloadSource::Memory(bytes) => Ok(Box::new(Cursor::new(SharedBytes(Arc::clone(bytes))))),
        }
    }
}

#[derive(Debug)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

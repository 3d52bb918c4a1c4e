use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use super::ExternalLoader;
use crate::error::LoadError;
use crate::types::DatasetLocator;

/// Serves datasets from a directory tree: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FilesystemLoader {
    root: PathBuf,
}

impl FilesystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, LoadError> {
        check_component(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, locator: &DatasetLocator) -> Result<PathBuf, LoadError> {
        check_component(&locator.key)?;
        Ok(self.bucket_path(&locator.bucket)?.join(&*locator.key))
    }
}

/// Rejects names that would escape the bucket directory.
fn check_component(name: &str) -> Result<(), LoadError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => Err(LoadError::Malformed(format!("invalid path component {name:?}"))),
    }
}

impl ExternalLoader for FilesystemLoader {
    fn fetch_range(&self, locator: &DatasetLocator, low: u64, high: u64) -> Result<Bytes, LoadError> {
        let path = self.object_path(locator)?;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(low))?;

        let len = high.saturating_sub(low);
        let mut buf = BytesMut::with_capacity(len as usize).writer();
        io::copy(&mut file.take(len), &mut buf)?;
        Ok(buf.into_inner().freeze())
    }

    fn key_size(&self, locator: &DatasetLocator) -> Result<Option<u64>, LoadError> {
        let path = self.object_path(locator)?;
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, u64)>, LoadError> {
        let entries = match fs::read_dir(self.bucket_path(bucket)?) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with(prefix) {
                keys.push((name, metadata.len()));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

//! tar.gz packing of task artifacts

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::errors::CommonError;

/// A file or directory stored in an archive under `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: PathBuf,
}

impl ArchiveEntry {
    /// Entry named by the last component of `source`
    pub fn from_path(source: impl Into<PathBuf>) -> Result<Self, CommonError> {
        let source = source.into();
        let name = source
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| {
                CommonError::ArchiveError(format!("{} has no file name", source.display()))
            })?;
        Ok(Self { source, name })
    }
}

/// Entries for paths given relative to `base`, keeping their relative names
pub fn relative_entries(base: &Path, paths: &[String]) -> Result<Vec<ArchiveEntry>, CommonError> {
    paths
        .iter()
        .map(|path| {
            let name = PathBuf::from(path);
            if !is_relative_inside(&name) {
                return Err(CommonError::ArchiveError(format!(
                    "artifact path {:?} must be relative and stay inside the source directory",
                    path
                )));
            }
            Ok(ArchiveEntry {
                source: base.join(&name),
                name,
            })
        })
        .collect()
}

pub fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Pack entries into an in-memory tar.gz archive
pub fn pack(entries: &[ArchiveEntry]) -> Result<Vec<u8>, CommonError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in entries {
        let metadata = std::fs::metadata(&entry.source).map_err(|e| {
            CommonError::ArchiveError(format!("{}: {}", entry.source.display(), e))
        })?;
        if metadata.is_dir() {
            builder.append_dir_all(&entry.name, &entry.source)?;
        } else {
            builder.append_path_with_name(&entry.source, &entry.name)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Unpack a tar.gz archive into `dest`. Entries escaping `dest` are skipped.
pub fn unpack(archive: &[u8], dest: &Path) -> Result<(), CommonError> {
    std::fs::create_dir_all(dest)?;
    let mut tar = tar::Archive::new(GzDecoder::new(Cursor::new(archive)));
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .map_err(|e| CommonError::ArchiveError(format!("unpacking into {}: {}", dest.display(), e)))
}

pub async fn pack_async(entries: Vec<ArchiveEntry>) -> Result<Vec<u8>, CommonError> {
    tokio::task::spawn_blocking(move || pack(&entries))
        .await
        .map_err(|e| CommonError::ArchiveError(e.to_string()))?
}

pub async fn unpack_async(archive: Vec<u8>, dest: PathBuf) -> Result<(), CommonError> {
    tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .map_err(|e| CommonError::ArchiveError(e.to_string()))?
}

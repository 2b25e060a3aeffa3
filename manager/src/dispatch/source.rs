//! Artifact acquisition for orders

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dt_common::archive::{pack_async, ArchiveEntry};
use tracing::info;

use crate::errors::ManagerError;
use crate::storage::model::Source;
use crate::storage::Storage;

/// Artifacts of an order as a tar.gz archive, empty when there is no source
pub async fn fetch_artifacts(
    source: Option<&Source>,
    storage: &dyn Storage,
) -> Result<Vec<u8>, ManagerError> {
    let Some(source) = source else {
        return Ok(Vec::new());
    };

    if !source.paths.is_empty() {
        let entries = source
            .paths
            .iter()
            .map(|path| ArchiveEntry::from_path(path.trim_end_matches('/')))
            .collect::<Result<Vec<_>, _>>()?;
        let archive = pack_async(entries).await?;
        info!("Packed {} path(s) into {} bytes", source.paths.len(), archive.len());
        return Ok(archive);
    }

    if let Some(encoded) = &source.archive {
        let archive = STANDARD.decode(encoded.trim()).map_err(|e| {
            ManagerError::ValidationError(format!("source.archive is not valid base64: {}", e))
        })?;
        info!("Decoded source archive of {} bytes", archive.len());
        return Ok(archive);
    }

    if let Some(order) = &source.order {
        let package = storage.get_package(order).await?.ok_or_else(|| {
            ManagerError::ValidationError(format!("order {} has no build package", order))
        })?;
        info!(
            "Reusing package of order {} built by {}",
            order, package.assembler
        );
        return Ok(package.payload);
    }

    Ok(Vec::new())
}

//! Merging segment files into the destination file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::TransferSpec;
use crate::error::{EngineError, Result};
use crate::segment::Segment;
use crate::utils::get_unique_filepath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Segments were merged into this file.
    Merged(PathBuf),
    /// A file of the expected size was already at the destination; nothing was written.
    AlreadyPresent(PathBuf),
}

impl FinalizeOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FinalizeOutcome::Merged(path) | FinalizeOutcome::AlreadyPresent(path) => path,
        }
    }
}

/// Concatenates segment files in ascending id order into the destination.
///
/// On success the temp directory is removed. On failure the partially
/// written destination is deleted and the segment files are left intact.
pub async fn finalize(
    spec: &TransferSpec,
    temp_dir: &Path,
    segments: &[Segment],
    total_size: u64,
) -> Result<FinalizeOutcome> {
    fs::create_dir_all(&spec.directory)
        .await
        .map_err(|e| EngineError::io(&spec.directory, e))?;

    let mut destination = spec.destination();
    if let Some(existing) = existing_file_len(&destination).await? {
        if total_size > 0 && existing == total_size {
            info!(path = %destination.display(), "destination already complete, skipping merge");
            remove_temp_dir(temp_dir).await;
            return Ok(FinalizeOutcome::AlreadyPresent(destination));
        }
        destination = get_unique_filepath(&spec.directory, &spec.filename);
        debug!(path = %destination.display(), "destination taken, using alternative name");
    }

    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.id);
    for segment in &ordered {
        check_segment_file(temp_dir, segment).await?;
    }

    if let Err(e) = merge(&destination, temp_dir, &ordered).await {
        if let Err(remove) = fs::remove_file(&destination).await {
            if remove.kind() != ErrorKind::NotFound {
                warn!(path = %destination.display(), error = %remove, "failed to remove partial output");
            }
        }
        return Err(e);
    }

    info!(path = %destination.display(), segments = ordered.len(), "segments merged");
    remove_temp_dir(temp_dir).await;
    Ok(FinalizeOutcome::Merged(destination))
}

/// Length of a non-empty regular file at `path`, if there is one.
async fn existing_file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

async fn check_segment_file(temp_dir: &Path, segment: &Segment) -> Result<()> {
    let path = temp_dir.join(segment.file_name());
    let meta = match fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(EngineError::MissingSegment(path)),
        Err(e) => return Err(EngineError::io(&path, e)),
    };
    if meta.len() != segment.downloaded {
        return Err(EngineError::SegmentLength {
            id: segment.id,
            expected: segment.downloaded,
            actual: meta.len(),
        });
    }
    Ok(())
}

async fn merge(destination: &Path, temp_dir: &Path, segments: &[&Segment]) -> Result<()> {
    let output = File::create(destination)
        .await
        .map_err(|e| EngineError::io(destination, e))?;
    let mut output = BufWriter::new(output);

    for segment in segments {
        let path = temp_dir.join(segment.file_name());
        let mut input = File::open(&path)
            .await
            .map_err(|e| EngineError::io(&path, e))?;
        tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|e| EngineError::io(destination, e))?;
    }

    output
        .flush()
        .await
        .map_err(|e| EngineError::io(destination, e))?;
    output
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| EngineError::io(destination, e))
}

/// Removes a transfer's temp directory and every segment file in it.
pub async fn remove_temp_dir(temp_dir: &Path) {
    match fs::remove_dir_all(temp_dir).await {
        Ok(()) => debug!(path = %temp_dir.display(), "temp directory removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %temp_dir.display(), error = %e, "failed to remove temp directory"),
    }
}

//! Atomic artifact publication
//!
//! Artifacts are written to a temp file in the destination directory and
//! renamed into place. A reader therefore sees either the previous complete
//! file or the new complete file, never a partial one. Two workers publishing
//! the same key concurrently is harmless: the last rename wins and both
//! wrote identical bytes.

use std::io::Write;
use std::path::Path;

use crate::error::{RenderError, RenderResult};

/// Write `bytes` to `dest` atomically
pub fn publish_atomic(dest: &Path, bytes: &[u8]) -> RenderResult<()> {
    if bytes.is_empty() {
        return Err(RenderError::RenderFailure(format!(
            "refusing to publish empty artifact at {:?}",
            dest
        )));
    }

    let dir = dest
        .parent()
        .ok_or_else(|| RenderError::RenderFailure(format!("artifact path has no parent: {:?}", dest)))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".koda-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| RenderError::Io(e.error))?;

    log::debug!("[PUBLISH] {} bytes → {:?}", bytes.len(), dest);
    Ok(())
}

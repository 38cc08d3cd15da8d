use std::{
    fs::{self, File},
    io,
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use zip::ZipArchive;

use crate::{cancel::CancelToken, error::InstallError};

/// Unpack a wheel archive into `target_dir`.
///
/// Entry paths are resolved through the archive's enclosed-name check; any
/// entry that would escape the target directory aborts the extraction with
/// [`InstallError::PathEscape`]. Existing files are overwritten and unix mode
/// bits from the archive are applied when present. The cancellation token is
/// re-checked before each entry; a cancelled extraction stops with
/// [`InstallError::Cancelled`], leaving already-written entries in place.
pub fn extract_wheel(ctx: &CancelToken, blob_path: &Path, target_dir: &Path) -> Result<()> {
    let file = File::open(blob_path)
        .with_context(|| format!("failed to open {}", blob_path.display()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| {
        anyhow::Error::new(err).context(InstallError::ArchiveCorrupt {
            path: blob_path.to_path_buf(),
        })
    })?;

    for index in 0..archive.len() {
        if ctx.is_cancelled() {
            return Err(InstallError::Cancelled.into());
        }
        let mut entry = archive.by_index(index).map_err(|err| {
            anyhow::Error::new(err).context(InstallError::ArchiveCorrupt {
                path: blob_path.to_path_buf(),
            })
        })?;
        let Some(out_path) = entry.enclosed_name().map(|rel| target_dir.join(rel)) else {
            return Err(InstallError::PathEscape {
                entry: entry.name().to_string(),
            }
            .into());
        };
        if entry.name().ends_with('/') || entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        #[cfg(unix)]
        {
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("failed to chmod {}", out_path.display()))?;
            }
        }
    }
    Ok(())
}

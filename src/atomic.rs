use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::error::Result;

/// New file contents written next to their destination, not yet visible there.
/// Dropping it without [`StagedWrite::commit`] discards the temp file and leaves the
/// destination untouched.
pub struct StagedWrite {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically replace the destination with the staged contents.
    pub fn commit(self) -> Result<()> {
        self.temp.persist(&self.dest).map_err(|e| e.error)?;
        Ok(())
    }
}

/**
 * @brief Write `contents` to a temp file in the destination's directory and fsync it.
 * @param dest Final path.
 * @param contents File body.
 * @return Handle that performs the rename on commit.
 */
pub fn stage(dest: &Path, contents: &[u8]) -> Result<StagedWrite> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    // Keep the mode of the file being replaced (server configs are 0600).
    #[cfg(unix)]
    if let Ok(meta) = std::fs::metadata(dest) {
        temp.as_file().set_permissions(meta.permissions())?;
    }
    Ok(StagedWrite {
        temp,
        dest: dest.to_path_buf(),
    })
}

pub fn write(dest: &Path, contents: &[u8]) -> Result<()> {
    stage(dest, contents)?.commit()
}

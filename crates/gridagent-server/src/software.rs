//! Firmware image lookup.

use std::path::{Path, PathBuf};

use gridagent_protocol::SoftwareVersion;

use crate::error::CommandError;

/// Directory of firmware images named by hardware model and versions.
#[derive(Debug, Clone)]
pub struct SoftwareStore {
    dir: PathBuf,
}

impl SoftwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{model}-hw{MM}_{mm}_{rr}{extra}-sw{MM}_{mm}_{rr}{extra}.hex`, hardware first.
    pub fn file_name(
        hw_model: u8,
        target_hw_version: &SoftwareVersion,
        sw_version: &SoftwareVersion,
    ) -> String {
        format!(
            "{hw_model}-hw{}-sw{}.hex",
            name_part(target_hw_version),
            name_part(sw_version)
        )
    }

    /// Path of an image inside the store.
    ///
    /// Version suffixes come from the bus, so anything beyond ASCII letters,
    /// digits and `-_.+~` is refused before it reaches the file system.
    pub fn path(
        &self,
        hw_model: u8,
        target_hw_version: &SoftwareVersion,
        sw_version: &SoftwareVersion,
    ) -> Result<PathBuf, CommandError> {
        for version in [target_hw_version, sw_version] {
            if !is_safe_extra(&version.extra) {
                return Err(CommandError::InvalidVersionExtra(version.extra.clone()));
            }
        }
        Ok(self
            .dir
            .join(Self::file_name(hw_model, target_hw_version, sw_version)))
    }

    /// Read an image. The file content is sent to the agent unchanged.
    pub async fn load(
        &self,
        hw_model: u8,
        target_hw_version: &SoftwareVersion,
        sw_version: &SoftwareVersion,
    ) -> Result<Vec<u8>, CommandError> {
        let path = self.path(hw_model, target_hw_version, sw_version)?;
        match tokio::fs::read(&path).await {
            Ok(image) => {
                tracing::debug!(path = %path.display(), size = image.len(), "loaded software image");
                Ok(image)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CommandError::SoftwareImageMissing(path))
            }
            Err(source) => Err(CommandError::SoftwareImageRead { path, source }),
        }
    }
}

fn is_safe_extra(extra: &str) -> bool {
    extra
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '~'))
}

fn name_part(version: &SoftwareVersion) -> String {
    format!(
        "{:02}_{:02}_{:02}{}",
        version.major, version.minor, version.revision, version.extra
    )
}

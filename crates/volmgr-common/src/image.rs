//! Disk image lifecycle.
//!
//! Every volume is backed by a sparse qcow2 file at
//! `<disk_root>/<volume>.qcow2`. Creation and resizing go through
//! `qemu-img`; deletion removes the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::channel::commands::IMAGE_FORMAT;
use crate::error::{VolumeError, VolumeResult};
use crate::shell::{self, shellquote, QEMU_IMG_CMD};
use crate::types::VolumeName;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Default backing directory.
pub const DEFAULT_DISK_ROOT: &str = "/fs/trust/vm/csi";

/// Capacity advertised to the orchestrator and enforced on create/resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapacityLimits {
    /// Total bytes available for new volumes
    pub available: u64,
    /// Largest volume accepted
    pub maximum_volume_size: u64,
    /// Smallest volume accepted
    pub minimum_volume_size: u64,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            available: 2 * TIB,
            maximum_volume_size: 100 * GIB,
            minimum_volume_size: 10 * MIB,
        }
    }
}

impl CapacityLimits {
    /// Checks a requested size against the volume size bounds.
    pub fn check(&self, size: u64) -> VolumeResult<()> {
        if size < self.minimum_volume_size || size > self.maximum_volume_size {
            return Err(VolumeError::InvalidSize {
                size,
                min: self.minimum_volume_size,
                max: self.maximum_volume_size,
            });
        }
        Ok(())
    }
}

/// Creates, resizes and deletes backing images.
#[derive(Debug, Clone)]
pub struct ImageManager {
    disk_root: PathBuf,
    limits: CapacityLimits,
    tool: String,
}

impl ImageManager {
    /// Creates a manager rooted at `disk_root`.
    pub fn new(disk_root: impl Into<PathBuf>, limits: CapacityLimits) -> Self {
        Self {
            disk_root: disk_root.into(),
            limits,
            tool: QEMU_IMG_CMD.to_string(),
        }
    }

    /// Overrides the image utility binary.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Returns the configured capacity limits.
    pub fn limits(&self) -> &CapacityLimits {
        &self.limits
    }

    /// Returns the backing directory.
    pub fn disk_root(&self) -> &Path {
        &self.disk_root
    }

    /// Returns the backing image path of a volume.
    pub fn image_path(&self, volume: &VolumeName) -> PathBuf {
        self.disk_root.join(format!("{}.{}", volume, IMAGE_FORMAT))
    }

    /// Creates a sparse image of `size` bytes.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn create_image(&self, volume: &VolumeName, size: u64) -> VolumeResult<PathBuf> {
        self.limits.check(size)?;
        let path = self.image_path(volume);
        let cmd = format!(
            "{} create -f {} {} {}",
            self.tool,
            IMAGE_FORMAT,
            shellquote(&path.to_string_lossy()),
            size
        );
        let out = shell::exec_or_throw(&cmd)
            .await
            .map_err(|e| image_error("create", &path, e))?;
        info!(path = %path.display(), size, output = %out, "Created image");
        Ok(path)
    }

    /// Grows or shrinks an image to `size` bytes.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn resize_image(&self, volume: &VolumeName, size: u64) -> VolumeResult<()> {
        self.limits.check(size)?;
        let path = self.image_path(volume);
        let cmd = format!(
            "{} resize {} {}",
            self.tool,
            shellquote(&path.to_string_lossy()),
            size
        );
        shell::exec_or_throw(&cmd)
            .await
            .map_err(|e| image_error("resize", &path, e))?;
        info!(path = %path.display(), size, "Resized image");
        Ok(())
    }

    /// Removes an image. A missing file is an error.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn delete_image(&self, volume: &VolumeName) -> VolumeResult<()> {
        let path = self.image_path(volume);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| VolumeError::image("delete", path.display().to_string(), e.to_string()))?;
        info!(path = %path.display(), "Removed image");
        Ok(())
    }
}

fn image_error(operation: &str, path: &Path, err: VolumeError) -> VolumeError {
    let message = match err {
        VolumeError::ShellCommandFailed { output, exit_code, .. } => {
            format!("exit code {}: {}", exit_code, output)
        }
        other => other.to_string(),
    };
    VolumeError::image(operation, path.display().to_string(), message)
}

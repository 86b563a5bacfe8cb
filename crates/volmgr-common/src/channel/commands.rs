//! Monitor command builders for attach/detach operations
//!
//! Commands use the QEMU human monitor dialect. The volume name doubles as
//! the backend drive id and the guest device id.

use std::path::Path;

use crate::types::{Serial, VolumeName};

/// Image format of every backing store
pub const IMAGE_FORMAT: &str = "qcow2";

/// Guest device model exposing the drive
pub const DEVICE_DRIVER: &str = "virtio-blk-pci";

/// Build attach backend store command
///
/// Adds the image as a drive with no guest-visible interface yet
pub fn build_attach_backend_cmd(image_path: &Path, volume: &VolumeName) -> String {
    format!(
        "drive_add 0 if=none,format={},file={},id={}",
        IMAGE_FORMAT,
        image_path.display(),
        volume
    )
}

/// Build attach guest device command
///
/// The serial becomes the device's externally visible identifier
pub fn build_attach_device_cmd(volume: &VolumeName, serial: Serial) -> String {
    format!(
        "device_add {},drive={},id={},serial={}",
        DEVICE_DRIVER, volume, volume, serial
    )
}

/// Build detach guest device command
pub fn build_detach_device_cmd(volume: &VolumeName) -> String {
    format!("device_del {}", volume)
}

/// Build detach backend store command
pub fn build_detach_backend_cmd(volume: &VolumeName) -> String {
    format!("drive_del {}", volume)
}

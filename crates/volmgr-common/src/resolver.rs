//! Guest device path derivation.
//!
//! virtio-blk exposes the drive serial through udev as
//! `/dev/disk/by-id/virtio-<serial>`, so the path follows from the serial
//! alone with no call into the guest.

use crate::types::Serial;

/// udev by-id prefix for virtio block devices.
pub const DEVICE_PATH_PREFIX: &str = "/dev/disk/by-id/virtio-";

/// Returns the guest device path for a serial.
pub fn resolve_path(serial: Serial) -> String {
    format!("{}{}", DEVICE_PATH_PREFIX, serial)
}

//! Validated identifiers shared by every component.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VolumeError, VolumeResult};

/// Names end up inside HMP option lists (`id=<name>`), `qemu-img` arguments
/// and file paths, so commas, spaces, slashes and leading dots are out.
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,62}$").expect("Invalid regex pattern"));

fn validate(kind: &'static str, value: &str) -> VolumeResult<()> {
    if NAME_RE.is_match(value) {
        Ok(())
    } else {
        Err(VolumeError::InvalidName {
            kind,
            value: value.to_string(),
            message: "must match [A-Za-z0-9][A-Za-z0-9_.-]{0,62}".to_string(),
        })
    }
}

/// Caller supplied volume name, also used as the backend drive id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VolumeName(String);

impl VolumeName {
    /// Validates and wraps a volume name.
    pub fn new(name: impl Into<String>) -> VolumeResult<Self> {
        let name = name.into();
        validate("volume name", &name)?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VolumeName {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifies the VM whose control channel receives commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostId(String);

impl HostId {
    /// Validates and wraps a host id.
    pub fn new(host: impl Into<String>) -> VolumeResult<Self> {
        let host = host.into();
        validate("host id", &host)?;
        Ok(Self(host))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostId {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Globally unique volume serial, drawn from the shared counter.
///
/// Stored and transmitted as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(u64);

impl Serial {
    /// The value handed out by the very first allocation.
    pub const FIRST: Serial = Serial(1);

    /// Wraps a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next serial, or `None` once the counter space is exhausted.
    pub fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Serial {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

//! Hypervisor control channel.
//!
//! A channel delivers one free-text monitor command to one VM and reports
//! either an ack, a definite rejection ([`VolumeError::CommandRejected`]) or
//! an unknown outcome ([`VolumeError::ChannelUnreachable`]). It never retries:
//! each command kind has different rollback rules, so that decision belongs
//! to the orchestrator.
//!
//! [`VolumeError::CommandRejected`]: crate::error::VolumeError::CommandRejected
//! [`VolumeError::ChannelUnreachable`]: crate::error::VolumeError::ChannelUnreachable

pub mod commands;
mod qmp;

pub use qmp::{QmpChannel, QmpChannelConfig};

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{VolumeError, VolumeResult};
use crate::types::HostId;

/// Default bound on a single control-channel command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends imperative commands to a VM's control endpoint.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Sends `command` to `host`, returning the remote's ack text.
    async fn send_command(&self, host: &HostId, command: &str) -> VolumeResult<String>;
}

/// Runs a channel call under a timeout. Expiry means the outcome is unknown.
pub async fn bounded<T, F>(host: &HostId, timeout: Duration, op: F) -> VolumeResult<T>
where
    F: Future<Output = VolumeResult<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(VolumeError::unreachable(
            host.as_str(),
            format!("no answer within {:?}", timeout),
        )),
    }
}

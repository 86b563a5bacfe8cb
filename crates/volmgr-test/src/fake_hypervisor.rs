//! In-process stand-in for a fleet of QEMU monitors
//!
//! Keeps per-host drive and device tables and answers the four monitor
//! commands the orchestrator sends the way QEMU does, including its
//! rejection texts. Faults can be injected per host and command prefix.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;
use volmgr_common::{ControlChannel, HostId, VolumeError, VolumeResult};

/// One command as received by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub host: String,
    pub command: String,
}

/// Injected failure mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the command without applying it
    Reject,
    /// Drop the command without applying it and report no answer
    Unreachable,
    /// Apply the command but lose the answer
    LostReply,
}

#[derive(Debug, Clone)]
struct FaultRule {
    host: String,
    prefix: String,
    fault: Fault,
}

/// Guest device as attached by `device_add`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub drive: String,
    pub serial: String,
}

#[derive(Debug, Default)]
struct HostState {
    /// drive id -> image file
    drives: HashMap<String, String>,
    /// device id -> device
    devices: HashMap<String, Device>,
}

#[derive(Debug, Default)]
struct State {
    hosts: HashMap<String, HostState>,
    log: Vec<SentCommand>,
    faults: Vec<FaultRule>,
    offline: HashSet<String>,
    latency: Option<Duration>,
}

/// Fake hypervisor control channel
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<State>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every command by `latency` before it is applied
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Makes every command to `host` fail as unreachable
    pub fn set_offline(&self, host: &str, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(host.to_string());
        } else {
            state.offline.remove(host);
        }
    }

    /// Injects `fault` for commands to `host` starting with `prefix`
    pub fn inject(&self, host: &str, prefix: &str, fault: Fault) {
        self.state.lock().faults.push(FaultRule {
            host: host.to_string(),
            prefix: prefix.to_string(),
            fault,
        });
    }

    pub fn fail_reject(&self, host: &str, prefix: &str) {
        self.inject(host, prefix, Fault::Reject);
    }

    pub fn fail_unreachable(&self, host: &str, prefix: &str) {
        self.inject(host, prefix, Fault::Unreachable);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Every command received, in arrival order
    pub fn command_log(&self) -> Vec<SentCommand> {
        self.state.lock().log.clone()
    }

    /// Commands received by one host, in arrival order
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn has_drive(&self, host: &str, drive: &str) -> bool {
        self.state
            .lock()
            .hosts
            .get(host)
            .is_some_and(|h| h.drives.contains_key(drive))
    }

    pub fn has_device(&self, host: &str, device: &str) -> bool {
        self.device(host, device).is_some()
    }

    pub fn device(&self, host: &str, device: &str) -> Option<Device> {
        self.state
            .lock()
            .hosts
            .get(host)
            .and_then(|h| h.devices.get(device).cloned())
    }

    fn apply(state: &mut HostState, host: &str, command: &str) -> VolumeResult<String> {
        let reject = |detail: String| Err(VolumeError::rejected(host, command, detail));
        let (verb, args) = command.split_once(' ').unwrap_or((command, ""));

        match verb {
            "drive_add" => {
                // drive_add <bus> <opts>
                let opts = parse_opts(args.split_once(' ').map_or("", |(_, o)| o));
                let Some(id) = opts.get("id") else {
                    return reject("Parameter 'id' is missing".to_string());
                };
                if state.drives.contains_key(*id) {
                    return reject(format!("Duplicate ID '{}' for drive", id));
                }
                let file = opts.get("file").copied().unwrap_or_default();
                state.drives.insert(id.to_string(), file.to_string());
                Ok("OK".to_string())
            }
            "device_add" => {
                let opts = parse_opts(args);
                let (Some(id), Some(drive)) = (opts.get("id"), opts.get("drive")) else {
                    return reject("Parameter 'id' or 'drive' is missing".to_string());
                };
                if state.devices.contains_key(*id) {
                    return reject(format!("Duplicate ID '{}' for device", id));
                }
                if !state.drives.contains_key(*drive) {
                    return reject(format!(
                        "Property 'virtio-blk-device.drive' can't find value '{}'",
                        drive
                    ));
                }
                if state.devices.values().any(|d| d.drive == *drive) {
                    return reject(format!("Drive '{}' is already in use", drive));
                }
                state.devices.insert(
                    id.to_string(),
                    Device {
                        drive: drive.to_string(),
                        serial: opts.get("serial").copied().unwrap_or_default().to_string(),
                    },
                );
                Ok(String::new())
            }
            "device_del" => match state.devices.remove(args) {
                Some(_) => Ok(String::new()),
                None => reject(format!("Device '{}' not found", args)),
            },
            "drive_del" => match state.drives.remove(args) {
                Some(_) => Ok(String::new()),
                None => reject(format!("Device '{}' not found", args)),
            },
            _ => reject(format!("unknown command: '{}'", verb)),
        }
    }
}

/// Parses `driver,key=value,...`; a bare leading word is the driver.
fn parse_opts(s: &str) -> HashMap<&str, &str> {
    s.split(',')
        .filter_map(|kv| kv.split_once('='))
        .collect()
}

#[async_trait]
impl ControlChannel for FakeHypervisor {
    async fn send_command(&self, host: &HostId, command: &str) -> VolumeResult<String> {
        let latency = {
            let mut state = self.state.lock();
            state.log.push(SentCommand {
                host: host.to_string(),
                command: command.to_string(),
            });
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let host = host.as_str();
        if state.offline.contains(host) {
            return Err(VolumeError::unreachable(host, "connection refused"));
        }

        let fault = state
            .faults
            .iter()
            .find(|f| f.host == host && command.starts_with(&f.prefix))
            .map(|f| f.fault);
        debug!(host, command, ?fault, "Fake hypervisor received command");

        match fault {
            Some(Fault::Reject) => Err(VolumeError::rejected(host, command, "injected rejection")),
            Some(Fault::Unreachable) => Err(VolumeError::unreachable(host, "injected timeout")),
            Some(Fault::LostReply) => {
                let _ = Self::apply(state.hosts.entry(host.to_string()).or_default(), host, command);
                Err(VolumeError::unreachable(host, "injected lost reply"))
            }
            None => Self::apply(state.hosts.entry(host.to_string()).or_default(), host, command),
        }
    }
}

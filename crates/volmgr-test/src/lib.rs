//! Integration test infrastructure for volume orchestration
//!
//! Provides:
//! - [`FakeHypervisor`]: QEMU-like monitor fleet with fault injection
//! - [`fixtures`]: multi-instance clusters and expected commands
//! - [`RedisTestEnv`]: containerised Redis for store tests

pub mod fake_hypervisor;
pub mod fixtures;
mod redis_env;

pub use fake_hypervisor::{Device, FakeHypervisor, Fault, SentCommand};
pub use fixtures::{host, volume, Cluster};
pub use redis_env::{RedisTestEnv, TestEnvError};

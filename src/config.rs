// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use test_infra::{Arch, RetryPolicy, DEFAULT_SSH_PORT_BASE};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot determine the home directory")]
    NoHomeDir,
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        key: &'static str,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

pub const ENV_MONITOR: &str = "NATS_MONITOR";
pub const ENV_WORKLOADS: &str = "NATS_WORKLOADS";
pub const ENV_BIOS: &str = "NATS_BIOS";
pub const ENV_FLASH_FIRMWARE: &str = "NATS_FLASH_FIRMWARE";
pub const ENV_CLOUD_INIT: &str = "NATS_CLOUD_INIT";
pub const ENV_SSH_PORT_BASE: &str = "NATS_SSH_PORT_BASE";
pub const ENV_TIMEOUT_SECS: &str = "NATS_TIMEOUT_SECS";

const DEFAULT_FLASH_FIRMWARE: &str = "/usr/share/qemu-efi/QEMU_EFI.fd";

/// Waits and retry policies of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Upper bound on the whole lifetime of one instance.
    pub instance_timeout: Duration,
    /// Delay between the control socket handoff and dialling it.
    pub settle: Duration,
    /// Wait between scenario steps, giving the guest time to boot or react.
    pub step: Duration,
    pub ssh: RetryPolicy,
    /// Read/write timeout on the control socket.
    pub control_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            instance_timeout: Duration::from_secs(4 * 60),
            settle: Duration::from_secs(5),
            step: Duration::from_secs(15),
            ssh: RetryPolicy::default(),
            control_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub arch: Arch,
    pub monitor_binary: PathBuf,
    pub workloads: PathBuf,
    /// Firmware passed with `-bios` on x86_64.
    pub bios: PathBuf,
    /// Firmware seeding the first pflash image on aarch64.
    pub flash_firmware: PathBuf,
    pub cloud_init_dir: PathBuf,
    pub port_base: u16,
    pub timings: Timings,
}

impl HarnessConfig {
    pub fn from_env(arch: Arch) -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Self::from_lookup(arch, &home, |key| env::var(key).ok())
    }

    /// Builds the configuration from `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(arch: Arch, home: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let monitor_binary = path(ENV_MONITOR, default_monitor_binary(arch, home));
        let workloads = path(ENV_WORKLOADS, home.join("workloads"));
        let bios = path(ENV_BIOS, workloads.join("OVMF.fd"));
        let flash_firmware = path(ENV_FLASH_FIRMWARE, PathBuf::from(DEFAULT_FLASH_FIRMWARE));
        let cloud_init_dir = path(
            ENV_CLOUD_INIT,
            Path::new(env!("CARGO_MANIFEST_DIR")).join("cloud-init"),
        );

        let port_base = match lookup(ENV_SSH_PORT_BASE) {
            Some(value) => parse_value(ENV_SSH_PORT_BASE, &value)?,
            None => DEFAULT_SSH_PORT_BASE,
        };

        let mut timings = Timings::default();
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            timings.instance_timeout = Duration::from_secs(parse_value(ENV_TIMEOUT_SECS, &value)?);
        }

        Ok(HarnessConfig {
            arch,
            monitor_binary,
            workloads,
            bios,
            flash_firmware,
            cloud_init_dir,
            port_base,
            timings,
        })
    }
}

pub fn default_monitor_binary(arch: Arch, home: &Path) -> PathBuf {
    match arch {
        Arch::X86_64 => home.join("build-x86_64/x86_64-softmmu/qemu-system-x86_64"),
        Arch::Aarch64 => home.join("build-aarch64/aarch64-softmmu/qemu-system-aarch64"),
    }
}

pub fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            source,
        })
}

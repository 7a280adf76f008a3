// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::ArtifactSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }

    pub fn machines(self) -> &'static [MachineType] {
        match self {
            Arch::X86_64 => &[MachineType::Pc, MachineType::Q35, MachineType::Virt],
            Arch::Aarch64 => &[MachineType::Virt],
        }
    }

    pub fn needs_flash_images(self) -> bool {
        matches!(profile(self).firmware, Firmware::Pflash)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    Pc,
    Q35,
    Virt,
}

impl MachineType {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineType::Pc => "pc",
            MachineType::Q35 => "q35",
            MachineType::Virt => "virt",
        }
    }

    /// Number of `ACPI:.*BOCHS.*` lines the guest kernel logs on this machine.
    pub fn expected_acpi_tables(self) -> usize {
        match self {
            MachineType::Pc => 8,
            MachineType::Q35 => 9,
            MachineType::Virt => 8,
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown machine type '{0}'")]
pub struct UnknownMachine(pub String);

impl FromStr for MachineType {
    type Err = UnknownMachine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(MachineType::Pc),
            "q35" => Ok(MachineType::Q35),
            "virt" => Ok(MachineType::Virt),
            _ => Err(UnknownMachine(s.to_string())),
        }
    }
}

enum Firmware {
    Bios,
    Pflash,
}

struct ArchProfile {
    machine_options: &'static str,
    smp: Option<&'static str>,
    memory: &'static str,
    firmware: Firmware,
    // Suffix of the virtio transport: "pci" or "device" (MMIO).
    bus: &'static str,
    extra_objects: &'static [(&'static str, &'static str)],
    debug_console: bool,
}

const X86_64_PROFILE: ArchProfile = ArchProfile {
    machine_options: "accel=kvm,kernel_irqchip,nvdimm",
    smp: Some("2,cores=1,threads=1,sockets=2,maxcpus=32"),
    memory: "512,slots=4,maxmem=16384M",
    firmware: Firmware::Bios,
    bus: "pci",
    extra_objects: &[
        ("-device", "virtio-rng-pci,rng=rng0"),
        ("-object", "rng-random,filename=/dev/random,id=rng0"),
        ("-device", "virtio-balloon-pci"),
        ("-object", "cryptodev-backend-builtin,id=cryptodev0"),
        ("-device", "virtio-crypto-pci,id=crypto0,cryptodev=cryptodev0"),
    ],
    debug_console: true,
};

const AARCH64_PROFILE: ArchProfile = ArchProfile {
    machine_options: "accel=kvm,gic-version=host",
    smp: None,
    memory: "512",
    firmware: Firmware::Pflash,
    bus: "device",
    extra_objects: &[],
    debug_console: false,
};

fn profile(arch: Arch) -> &'static ArchProfile {
    match arch {
        Arch::X86_64 => &X86_64_PROFILE,
        Arch::Aarch64 => &AARCH64_PROFILE,
    }
}

/// Everything needed to build a monitor command line for one instance.
pub struct LaunchSpec<'a> {
    pub arch: Arch,
    pub machine: MachineType,
    pub artifacts: &'a ArtifactSet,
    pub ssh_port: u16,
    pub bios: Option<&'a Path>,
    pub qmp_socket: Option<&'a Path>,
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn monitor_args(spec: &LaunchSpec) -> Result<Vec<String>, crate::Error> {
    let profile = profile(spec.arch);
    let artifacts = spec.artifacts;
    let osdisk = artifacts
        .osdisk()
        .ok_or(crate::Error::MissingArtifact("osdisk"))?;
    let cloudinit = artifacts
        .cloudinit()
        .ok_or(crate::Error::MissingArtifact("cloudinit"))?;
    let bus = profile.bus;

    let mut args: Vec<String> = vec![
        "-machine".into(),
        format!("{},{}", spec.machine, profile.machine_options),
    ];

    match profile.firmware {
        Firmware::Bios => {
            let bios = spec.bios.ok_or(crate::Error::MissingArtifact("bios"))?;
            args.extend(["-bios".into(), path_str(bios)]);
        }
        Firmware::Pflash => {}
    }

    if let Some(smp) = profile.smp {
        args.extend(["-smp".into(), smp.into()]);
    }

    args.extend(
        [
            "-m",
            profile.memory,
            "-cpu",
            "host",
            "-nographic",
            "-no-user-config",
            "-nodefaults",
        ]
        .map(String::from),
    );

    if let Firmware::Pflash = profile.firmware {
        let (flash0, flash1) = artifacts
            .flash()
            .ok_or(crate::Error::MissingArtifact("flash"))?;
        args.extend([
            "-pflash".into(),
            path_str(flash0),
            "-pflash".into(),
            path_str(flash1),
        ]);
    }

    args.extend([
        "-drive".into(),
        format!(
            "file={},if=none,id=drive-virtio-disk0,format=qcow2",
            osdisk.display()
        ),
        "-device".into(),
        format!("virtio-blk-{bus},scsi=off,drive=drive-virtio-disk0,id=virtio-disk0"),
        "-device".into(),
        format!("virtio-blk-{bus},drive=cloud"),
        "-drive".into(),
        format!("if=none,id=cloud,file={},format=raw", cloudinit.display()),
        "-netdev".into(),
        format!(
            "user,id=mynet0,hostfwd=tcp::{}-:22,hostname=nemuvm",
            spec.ssh_port
        ),
        "-device".into(),
        format!("virtio-net-{bus},netdev=mynet0"),
        "-device".into(),
        format!("virtio-serial-{bus},id=virtio-serial0"),
        "-device".into(),
        "virtconsole,chardev=charconsole0,id=console0".into(),
        "-chardev".into(),
        format!(
            "file,id=charconsole0,path={},server,nowait",
            artifacts.console_log().display()
        ),
    ]);

    for (flag, value) in profile.extra_objects {
        args.extend([flag.to_string(), value.to_string()]);
    }

    if profile.debug_console {
        if spec.machine == MachineType::Virt {
            args.extend([
                "-device".into(),
                "sysbus-debugcon,iobase=0x402,chardev=debugcon".into(),
                "-chardev".into(),
                format!("file,path={},id=debugcon", artifacts.debug_log().display()),
            ]);
        } else {
            args.extend([
                "-device".into(),
                "isa-debugcon,iobase=0x402,chardev=debugcon".into(),
                "-chardev".into(),
                format!("file,path={},id=debugcon", artifacts.debug_log().display()),
                "-device".into(),
                "isa-debugcon,iobase=0x3f8,chardev=serialcon".into(),
                "-chardev".into(),
                format!("file,path={},id=serialcon", artifacts.serial_log().display()),
            ]);
        }
    }

    if let Some(socket) = spec.qmp_socket {
        args.extend([
            "-qmp".into(),
            format!("unix:{},server,nowait", socket.display()),
        ]);
    }

    Ok(args)
}

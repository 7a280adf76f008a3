// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest-visible behaviours checked against a running monitor.

use std::fmt;
use std::io::{Read, Write};
use std::sync::LazyLock;

use log::{error, info};
use qmp_client::QmpClient;
use regex::Regex;
use test_infra::{
    Arch, CloudInitFlavor, Deadline, DeadlineExpired, GuestDistribution, GuestTransport,
    MachineType, SshExecutor,
};
use thiserror::Error;

use crate::config::Timings;
use crate::instance::Failure;

pub const XENIAL: GuestDistribution = GuestDistribution {
    name: "xenial",
    image: "xenial-server-cloudimg-amd64-uefi1.img",
    cloud_init: CloudInitFlavor::Ubuntu,
};

pub const CLEAR: GuestDistribution = GuestDistribution {
    name: "clear",
    image: "clear-24740-cloud.img",
    cloud_init: CloudInitFlavor::Clear,
};

pub const XENIAL_ARM: GuestDistribution = GuestDistribution {
    name: "xenial-arm",
    image: "xenial-server-cloudimg-arm64-uefi1.img",
    cloud_init: CloudInitFlavor::Ubuntu,
};

const X86_64_DISTROS: &[GuestDistribution] = &[XENIAL, CLEAR];
const CLEAR_ONLY: &[GuestDistribution] = &[CLEAR];
const AARCH64_DISTROS: &[GuestDistribution] = &[XENIAL_ARM];

const SHUTDOWN_COMMAND: &str = "sudo shutdown -h now";
const REBOOT_COMMAND: &str = "sudo reboot";
const DMESG_COMMAND: &str = "sudo dmesg";
static ACPI_TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("ACPI:.*BOCHS.*").expect("ACPI table pattern must compile"));
const MEM_TOTAL_COMMAND: &str =
    r#"cat /proc/meminfo  | grep MemTotal | sed "s/.*: *\([0-9]*\) kB/\1/""#;
const ONLINE_CPUS_COMMAND: &str = "cat /sys/devices/system/cpu/online";
const ONLINE_CPU2_COMMAND: &str = r#"sudo sh -c "echo 1 > /sys/devices/system/cpu/cpu2/online""#;

const HOTPLUG_MEMORY_MIB: u64 = 512;

// CPU hotplug only runs on x86_64.
const HOTPLUG_CPU_DRIVER: &str = "host-x86_64-cpu";

/// Monitor-side commands issued by scenarios.
pub trait ControlChannel {
    fn quit(&mut self) -> Result<(), qmp_client::Error>;

    fn cpu_device_add(
        &mut self,
        driver: &str,
        id: &str,
        socket_id: u32,
        core_id: u32,
        thread_id: u32,
    ) -> Result<(), qmp_client::Error>;

    fn hotplug_memory(
        &mut self,
        qom_type: &str,
        id: &str,
        mem_path: Option<&str>,
        size_mib: u64,
    ) -> Result<(), qmp_client::Error>;
}

impl<S: Read + Write> ControlChannel for QmpClient<S> {
    fn quit(&mut self) -> Result<(), qmp_client::Error> {
        QmpClient::quit(self)
    }

    fn cpu_device_add(
        &mut self,
        driver: &str,
        id: &str,
        socket_id: u32,
        core_id: u32,
        thread_id: u32,
    ) -> Result<(), qmp_client::Error> {
        QmpClient::cpu_device_add(self, driver, id, socket_id, core_id, thread_id)
    }

    fn hotplug_memory(
        &mut self,
        qom_type: &str,
        id: &str,
        mem_path: Option<&str>,
        size_mib: u64,
    ) -> Result<(), qmp_client::Error> {
        QmpClient::hotplug_memory(self, qom_type, id, mem_path, size_mib)
    }
}

/// Runs a command inside the guest. An empty string means the command could
/// not be run.
pub trait GuestShell {
    fn run(&self, command: &str) -> String;
}

impl<T: GuestTransport> GuestShell for SshExecutor<T> {
    fn run(&self, command: &str) -> String {
        SshExecutor::run(self, command)
    }
}

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("control channel rejected '{command}'")]
    Control {
        command: &'static str,
        #[source]
        source: qmp_client::Error,
    },
    #[error("instance deadline expired")]
    Timeout(#[from] DeadlineExpired),
}

/// What a scenario gets to work with.
pub struct ScenarioContext<'a> {
    pub name: &'a str,
    pub arch: Arch,
    pub machine: MachineType,
    pub control: &'a mut dyn ControlChannel,
    pub guest: &'a dyn GuestShell,
    pub deadline: &'a Deadline,
    pub timings: &'a Timings,
    failures: Vec<Failure>,
}

impl<'a> ScenarioContext<'a> {
    pub fn new(
        name: &'a str,
        arch: Arch,
        machine: MachineType,
        control: &'a mut dyn ControlChannel,
        guest: &'a dyn GuestShell,
        deadline: &'a Deadline,
        timings: &'a Timings,
    ) -> Self {
        ScenarioContext {
            name,
            arch,
            machine,
            control,
            guest,
            deadline,
            timings,
            failures: Vec::new(),
        }
    }

    /// Gives the guest one step period to settle.
    pub fn wait(&self) -> Result<(), ScenarioError> {
        Ok(self.deadline.sleep(self.timings.step)?)
    }

    pub fn run(&self, command: &str) -> String {
        self.guest.run(command)
    }

    /// Records an assertion failure. The scenario carries on.
    pub fn fail(&mut self, message: String) {
        error!("{}: {message}", self.name);
        self.failures.push(Failure::Assertion(message));
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }

    fn quit(&mut self) -> Result<(), ScenarioError> {
        self.control
            .quit()
            .map_err(|source| ScenarioError::Control {
                command: "quit",
                source,
            })
    }
}

pub type Behavior = fn(&mut ScenarioContext<'_>) -> Result<(), ScenarioError>;

#[derive(Clone, Copy)]
pub struct ScenarioDefinition {
    pub name: &'static str,
    pub behavior: Behavior,
    pub distros: &'static [GuestDistribution],
    pub machines: &'static [MachineType],
}

impl ScenarioDefinition {
    /// Machine type and distribution pairs this scenario runs against.
    pub fn combinations(&self) -> impl Iterator<Item = (MachineType, GuestDistribution)> + '_ {
        self.distros.iter().flat_map(move |distro| {
            self.machines.iter().map(move |machine| (*machine, *distro))
        })
    }
}

impl fmt::Debug for ScenarioDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioDefinition")
            .field("name", &self.name)
            .field("distros", &self.distros)
            .field("machines", &self.machines)
            .finish()
    }
}

pub fn scenarios(arch: Arch) -> Vec<ScenarioDefinition> {
    let machines = arch.machines();
    let scenario = |name, behavior: Behavior, distros| ScenarioDefinition {
        name,
        behavior,
        distros,
        machines,
    };

    match arch {
        Arch::X86_64 => vec![
            scenario("Shutdown", shutdown, X86_64_DISTROS),
            scenario("Reboot", reboot, X86_64_DISTROS),
            scenario("CheckACPITables", check_acpi_tables, X86_64_DISTROS),
            scenario("QMPQuit", qmp_quit, X86_64_DISTROS),
            scenario("CPUHotplug", cpu_hotplug, CLEAR_ONLY),
            scenario("MemoryHotplug", memory_hotplug, CLEAR_ONLY),
        ],
        Arch::Aarch64 => vec![
            scenario("Shutdown", shutdown, AARCH64_DISTROS),
            scenario("Reboot", reboot, AARCH64_DISTROS),
            scenario("QMPQuit", qmp_quit, AARCH64_DISTROS),
        ],
    }
}

pub fn shutdown(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    ctx.wait()?;
    ctx.run(SHUTDOWN_COMMAND);
    Ok(())
}

pub fn reboot(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    ctx.wait()?;
    ctx.run(REBOOT_COMMAND);
    ctx.wait()?;
    ctx.run(SHUTDOWN_COMMAND);
    Ok(())
}

pub fn qmp_quit(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    ctx.wait()?;
    ctx.quit()
}

pub fn count_acpi_tables(dmesg: &str) -> usize {
    ACPI_TABLE_RE.find_iter(dmesg).count()
}

pub fn check_acpi_tables(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    ctx.wait()?;
    let dmesg = ctx.run(DMESG_COMMAND);

    let expected = ctx.machine.expected_acpi_tables();
    let found = count_acpi_tables(&dmesg);
    if found != expected {
        ctx.fail(format!(
            "Unexpected number of ACPI tables from monitor: {found}, expected {expected}"
        ));
        error!(
            "\n\n==== Start {} dmesg output ====\n\n{dmesg}\n\n==== End {} dmesg output ====\n\n",
            ctx.name, ctx.name
        );
    }

    ctx.wait()?;
    ctx.run(SHUTDOWN_COMMAND);
    Ok(())
}

/// Guest `MemTotal` in KiB.
fn total_memory(ctx: &mut ScenarioContext) -> Option<u64> {
    let output = ctx.run(MEM_TOTAL_COMMAND);
    match output.trim().parse() {
        Ok(kib) => Some(kib),
        Err(e) => {
            ctx.fail(format!(
                "Error converting memory value '{}' to int: {e}",
                output.trim()
            ));
            None
        }
    }
}

pub fn memory_hotplug(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    let before = total_memory(ctx);
    ctx.control
        .hotplug_memory("memory-backend-ram", "memslot1", None, HOTPLUG_MEMORY_MIB)
        .map_err(|source| ScenarioError::Control {
            command: "object-add/device_add",
            source,
        })?;
    let after = total_memory(ctx);

    if let (Some(before), Some(after)) = (before, after) {
        match before.checked_add(HOTPLUG_MEMORY_MIB * 1024) {
            None => ctx.fail(format!(
                "Guest memory before hotplug is out of range: before: {before} after: {after}"
            )),
            Some(expected) if after != expected => ctx.fail(format!(
                "Hotplugging memory did not result in expected values: before: {before} after: {after} expected: {expected}"
            )),
            Some(_) => info!("{}: guest memory grew from {before} to {after} KiB", ctx.name),
        }
    }

    ctx.wait()?;
    ctx.quit()
}

fn online_cpus(ctx: &ScenarioContext) -> String {
    ctx.run(ONLINE_CPUS_COMMAND).trim().to_string()
}

pub fn cpu_hotplug(ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
    let before = online_cpus(ctx);
    if before != "0-1" {
        ctx.fail(format!("Unexpected online cpus: {before}"));
    }

    ctx.control
        .cpu_device_add(HOTPLUG_CPU_DRIVER, "core2", 2, 0, 0)
        .map_err(|source| ScenarioError::Control {
            command: "device_add",
            source,
        })?;

    ctx.wait()?;
    ctx.run(ONLINE_CPU2_COMMAND);
    ctx.wait()?;

    let after = online_cpus(ctx);
    if after != "0-2" {
        ctx.fail(format!("Unexpected online cpus: {after}"));
    }

    ctx.wait()?;
    ctx.quit()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct FakeShell {
        replies: RefCell<HashMap<&'static str, VecDeque<String>>>,
        commands: RefCell<Vec<String>>,
    }

    impl FakeShell {
        fn reply(self, command: &'static str, output: &str) -> Self {
            self.replies
                .borrow_mut()
                .entry(command)
                .or_default()
                .push_back(output.to_string());
            self
        }

        fn commands(&self) -> Vec<String> {
            self.commands.borrow().clone()
        }
    }

    impl GuestShell for FakeShell {
        fn run(&self, command: &str) -> String {
            self.commands.borrow_mut().push(command.to_string());
            self.replies
                .borrow_mut()
                .get_mut(command)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default()
        }
    }

    #[derive(Default)]
    struct FakeControl {
        calls: Vec<String>,
        reject: bool,
    }

    impl FakeControl {
        fn result(&self) -> Result<(), qmp_client::Error> {
            if self.reject {
                return Err(qmp_client::Error::ServerResponse {
                    class: "GenericError".to_string(),
                    desc: "rejected".to_string(),
                });
            }
            Ok(())
        }
    }

    impl ControlChannel for FakeControl {
        fn quit(&mut self) -> Result<(), qmp_client::Error> {
            self.calls.push("quit".to_string());
            self.result()
        }

        fn cpu_device_add(
            &mut self,
            driver: &str,
            id: &str,
            socket_id: u32,
            core_id: u32,
            thread_id: u32,
        ) -> Result<(), qmp_client::Error> {
            self.calls.push(format!(
                "device_add {driver} {id} {socket_id} {core_id} {thread_id}"
            ));
            self.result()
        }

        fn hotplug_memory(
            &mut self,
            qom_type: &str,
            id: &str,
            mem_path: Option<&str>,
            size_mib: u64,
        ) -> Result<(), qmp_client::Error> {
            self.calls
                .push(format!("hotplug_memory {qom_type} {id} {mem_path:?} {size_mib}"));
            self.result()
        }
    }

    fn timings() -> Timings {
        Timings {
            step: Duration::ZERO,
            ..Default::default()
        }
    }

    fn run_scenario(
        behavior: Behavior,
        machine: MachineType,
        control: &mut FakeControl,
        shell: &FakeShell,
    ) -> (Result<(), ScenarioError>, Vec<Failure>) {
        let deadline = Deadline::after(Duration::from_secs(60));
        let timings = timings();
        let mut ctx = ScenarioContext::new(
            "test",
            Arch::X86_64,
            machine,
            control,
            shell,
            &deadline,
            &timings,
        );
        let res = behavior(&mut ctx);
        (res, ctx.into_failures())
    }

    fn dmesg(tables: usize) -> String {
        let mut log = String::from("[    0.000000] Linux version 4.14.0\n");
        for i in 0..tables {
            log.push_str(&format!(
                "[    0.000000] ACPI: TBL{i} 0x000000007FFE{i:04X} 000040 (v01 BOCHS  BXPCFACP 00000001)\n"
            ));
        }
        log.push_str("[    0.100000] ACPI: Added _OSI(Module Device)\n");
        log
    }

    #[test]
    fn test_acpi_q35_nine_tables_pass() {
        let shell = FakeShell::default().reply(DMESG_COMMAND, &dmesg(9));
        let mut control = FakeControl::default();
        let (res, failures) =
            run_scenario(check_acpi_tables, MachineType::Q35, &mut control, &shell);

        res.unwrap();
        assert!(failures.is_empty());
        assert_eq!(shell.commands(), [DMESG_COMMAND, SHUTDOWN_COMMAND]);
    }

    #[test]
    fn test_acpi_q35_eight_tables_fail_once() {
        let shell = FakeShell::default().reply(DMESG_COMMAND, &dmesg(8));
        let mut control = FakeControl::default();
        let (res, failures) =
            run_scenario(check_acpi_tables, MachineType::Q35, &mut control, &shell);

        res.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Failure::Assertion(_)));
        // The guest is still shut down after a mismatch.
        assert_eq!(shell.commands().last().unwrap(), SHUTDOWN_COMMAND);
    }

    #[test]
    fn test_acpi_pc_expects_eight() {
        let shell = FakeShell::default().reply(DMESG_COMMAND, &dmesg(8));
        let mut control = FakeControl::default();
        let (_, failures) = run_scenario(check_acpi_tables, MachineType::Pc, &mut control, &shell);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_acpi_unreachable_guest_is_a_failure() {
        let shell = FakeShell::default();
        let mut control = FakeControl::default();
        let (res, failures) =
            run_scenario(check_acpi_tables, MachineType::Virt, &mut control, &shell);
        res.unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_memory_hotplug_expected_delta() {
        let shell = FakeShell::default()
            .reply(MEM_TOTAL_COMMAND, "1048576\n")
            .reply(MEM_TOTAL_COMMAND, "1572864\n");
        let mut control = FakeControl::default();
        let (res, failures) =
            run_scenario(memory_hotplug, MachineType::Q35, &mut control, &shell);

        res.unwrap();
        assert!(failures.is_empty());
        assert_eq!(
            control.calls,
            [
                "hotplug_memory memory-backend-ram memslot1 None 512",
                "quit"
            ]
        );
    }

    #[test]
    fn test_memory_hotplug_wrong_delta() {
        for after in ["1048576", "1572863", "1572865", "2097152"] {
            let shell = FakeShell::default()
                .reply(MEM_TOTAL_COMMAND, "1048576")
                .reply(MEM_TOTAL_COMMAND, after);
            let mut control = FakeControl::default();
            let (res, failures) =
                run_scenario(memory_hotplug, MachineType::Pc, &mut control, &shell);

            res.unwrap();
            assert_eq!(failures.len(), 1, "after={after}");
        }
    }

    #[test]
    fn test_memory_hotplug_rejected_is_fatal() {
        let shell = FakeShell::default().reply(MEM_TOTAL_COMMAND, "1048576");
        let mut control = FakeControl {
            reject: true,
            ..Default::default()
        };
        let (res, _) = run_scenario(memory_hotplug, MachineType::Q35, &mut control, &shell);
        assert!(matches!(res, Err(ScenarioError::Control { .. })));
    }

    #[test]
    fn test_memory_hotplug_out_of_range_total() {
        let shell = FakeShell::default()
            .reply(MEM_TOTAL_COMMAND, "18446744073709551615")
            .reply(MEM_TOTAL_COMMAND, "1");
        let mut control = FakeControl::default();
        let (res, failures) =
            run_scenario(memory_hotplug, MachineType::Q35, &mut control, &shell);

        res.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], Failure::Assertion(_)));
        assert_eq!(control.calls.last().unwrap(), "quit");
    }

    #[test]
    fn test_count_acpi_tables_in_lossy_output() {
        let mut raw = dmesg(9).into_bytes();
        raw.extend_from_slice(b"\xff\xfe garbage\n");
        assert_eq!(count_acpi_tables(&String::from_utf8_lossy(&raw)), 9);
        assert_eq!(count_acpi_tables(""), 0);
    }

    #[test]
    fn test_cpu_hotplug() {
        let shell = FakeShell::default()
            .reply(ONLINE_CPUS_COMMAND, "0-1\n")
            .reply(ONLINE_CPUS_COMMAND, "0-2\n");
        let mut control = FakeControl::default();
        let (res, failures) = run_scenario(cpu_hotplug, MachineType::Q35, &mut control, &shell);

        res.unwrap();
        assert!(failures.is_empty());
        assert_eq!(
            control.calls,
            ["device_add host-x86_64-cpu core2 2 0 0", "quit"]
        );
        assert_eq!(
            shell.commands(),
            [ONLINE_CPUS_COMMAND, ONLINE_CPU2_COMMAND, ONLINE_CPUS_COMMAND]
        );
    }

    #[test]
    fn test_cpu_hotplug_cpu_not_onlined() {
        let shell = FakeShell::default()
            .reply(ONLINE_CPUS_COMMAND, "0-1")
            .reply(ONLINE_CPUS_COMMAND, "0-1");
        let mut control = FakeControl::default();
        let (res, failures) = run_scenario(cpu_hotplug, MachineType::Pc, &mut control, &shell);

        res.unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_qmp_quit_rejected() {
        let shell = FakeShell::default();
        let mut control = FakeControl {
            reject: true,
            ..Default::default()
        };
        let (res, _) = run_scenario(qmp_quit, MachineType::Pc, &mut control, &shell);
        assert!(matches!(
            res,
            Err(ScenarioError::Control {
                command: "quit",
                ..
            })
        ));
    }

    #[test]
    fn test_reboot_then_shutdown() {
        let shell = FakeShell::default();
        let mut control = FakeControl::default();
        let (res, _) = run_scenario(reboot, MachineType::Virt, &mut control, &shell);
        res.unwrap();
        assert_eq!(shell.commands(), [REBOOT_COMMAND, SHUTDOWN_COMMAND]);
        assert!(control.calls.is_empty());
    }

    #[test]
    fn test_wait_stops_at_deadline() {
        let shell = FakeShell::default();
        let mut control = FakeControl::default();
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.cancel();
        let timings = Timings::default();
        let mut ctx = ScenarioContext::new(
            "test",
            Arch::X86_64,
            MachineType::Pc,
            &mut control,
            &shell,
            &deadline,
            &timings,
        );

        assert!(matches!(shutdown(&mut ctx), Err(ScenarioError::Timeout(_))));
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn test_scenario_matrix() {
        let x86 = scenarios(Arch::X86_64);
        let names: Vec<_> = x86.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "Shutdown",
                "Reboot",
                "CheckACPITables",
                "QMPQuit",
                "CPUHotplug",
                "MemoryHotplug"
            ]
        );
        let total: usize = x86.iter().map(|s| s.combinations().count()).sum();
        assert_eq!(total, 4 * 2 * 3 + 2 * 3);

        let arm = scenarios(Arch::Aarch64);
        assert_eq!(arm.len(), 3);
        assert!(!arm
            .iter()
            .any(|s| s.name == "CPUHotplug" || s.name == "MemoryHotplug"));
        for scenario in &arm {
            assert_eq!(
                scenario.combinations().collect::<Vec<_>>(),
                [(MachineType::Virt, XENIAL_ARM)]
            );
        }
    }
}

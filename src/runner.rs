// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Drives test instances through their lifecycle.
//!
//! Each instance provisions its artifacts, starts the monitor on a helper
//! thread, waits for the control socket handoff, runs its scenario and then
//! always waits for the monitor to be reaped before releasing its artifacts.
//! Instances share nothing but the port allocator.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use qmp_client::QmpClient;
use serde::Serialize;
use test_infra::{
    monitor_args, Arch, ArtifactSet, Deadline, GuestDistribution, Launch, LaunchSpec, MachineType,
    MonitorCommand, MonitorExit, PortAllocator, Provisioner, Ssh2Transport, SshExecutor,
};

use crate::config::{HarnessConfig, Timings};
use crate::error_chain;
use crate::instance::{Failure, LifecycleState, TestInstance};
use crate::scenarios::{
    scenarios, ControlChannel, GuestShell, ScenarioContext, ScenarioDefinition, ScenarioError,
};

/// What the launcher needs to know about an instance.
pub struct LaunchRequest<'a> {
    pub name: &'a str,
    pub machine: MachineType,
    pub artifacts: &'a ArtifactSet,
    pub port: u16,
}

/// Host side of an instance: artifacts, monitor, control channel and guest.
pub trait Platform: Sync {
    type Control: ControlChannel;
    type Guest: GuestShell;

    fn provision(&self, distro: &GuestDistribution) -> Result<ArtifactSet, test_infra::Error>;

    /// Runs the monitor until it exits or the deadline kills it. The control
    /// socket path is sent on `handoff` once it accepts connections.
    fn launch(
        &self,
        request: &LaunchRequest,
        handoff: flume::Sender<PathBuf>,
        deadline: Deadline,
    ) -> MonitorExit;

    /// Dials the control socket and negotiates capabilities.
    fn connect(&self, socket: &Path) -> Result<Self::Control, qmp_client::Error>;

    fn guest(&self, port: u16, deadline: &Deadline) -> Self::Guest;
}

pub struct QemuPlatform {
    config: HarnessConfig,
    provisioner: Provisioner,
}

impl QemuPlatform {
    pub fn new(config: HarnessConfig) -> Self {
        let mut provisioner =
            Provisioner::new(config.workloads.clone(), config.cloud_init_dir.clone());
        if config.arch.needs_flash_images() {
            provisioner = provisioner.with_flash_firmware(config.flash_firmware.clone());
        }

        QemuPlatform {
            config,
            provisioner,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }
}

impl Platform for QemuPlatform {
    type Control = QmpClient;
    type Guest = SshExecutor;

    fn provision(&self, distro: &GuestDistribution) -> Result<ArtifactSet, test_infra::Error> {
        self.provisioner.provision(distro)
    }

    fn launch(
        &self,
        request: &LaunchRequest,
        handoff: flume::Sender<PathBuf>,
        deadline: Deadline,
    ) -> MonitorExit {
        let artifacts = request.artifacts;
        let qmp_socket = artifacts.qmp_socket();
        let args = match monitor_args(&LaunchSpec {
            arch: self.config.arch,
            machine: request.machine,
            artifacts,
            ssh_port: request.port,
            bios: Some(&self.config.bios),
            qmp_socket: Some(qmp_socket),
        }) {
            Ok(args) => args,
            Err(e) => {
                error!("{}: {}", request.name, error_chain(&e));
                return MonitorExit::SpawnFailed {
                    error: e.to_string(),
                };
            }
        };

        let mut command = MonitorCommand::new(&self.config.monitor_binary);
        command.args(args);

        test_infra::launch(
            Launch {
                name: request.name,
                command,
                qmp_socket: Some(qmp_socket),
                captures: artifacts.captures(),
                deadline,
            },
            Some(handoff),
        )
    }

    fn connect(&self, socket: &Path) -> Result<QmpClient, qmp_client::Error> {
        let mut client = QmpClient::connect(socket, self.config.timings.control_timeout)?;
        client.capabilities()?;
        Ok(client)
    }

    fn guest(&self, port: u16, deadline: &Deadline) -> SshExecutor {
        SshExecutor::new(
            Ssh2Transport::default(),
            port,
            self.config.timings.ssh,
            deadline.clone(),
        )
    }
}

/// Outcome of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub name: String,
    pub scenario: &'static str,
    pub machine: MachineType,
    pub distro: &'static str,
    pub states: Vec<LifecycleState>,
    pub failures: Vec<Failure>,
    pub monitor_exit: Option<MonitorExit>,
    pub port: Option<u16>,
    pub elapsed: Duration,
    pub passed: bool,
}

impl InstanceReport {
    fn new(
        scenario: &ScenarioDefinition,
        instance: TestInstance,
        monitor_exit: Option<MonitorExit>,
        elapsed: Duration,
    ) -> Self {
        InstanceReport {
            name: instance.name().to_string(),
            scenario: scenario.name,
            machine: instance.machine(),
            distro: instance.distro().name,
            states: instance.history().to_vec(),
            failures: instance.failures().to_vec(),
            monitor_exit,
            port: instance.port(),
            elapsed,
            passed: instance.passed(),
        }
    }
}

fn transition(instance: &mut TestInstance, to: LifecycleState) {
    if let Err(e) = instance.advance(to) {
        warn!("{}: {e}", instance.name());
    }
}

fn scenario_failure(e: ScenarioError) -> Failure {
    let message = error_chain(&e);
    match e {
        ScenarioError::Control { .. } => Failure::ControlChannel(message),
        ScenarioError::Timeout(_) => Failure::Timeout(message),
    }
}

/// Everything between the launch and the wait for the monitor to exit.
/// Failures are recorded on `instance`.
#[allow(clippy::too_many_arguments)]
fn drive<P: Platform>(
    platform: &P,
    instance: &mut TestInstance,
    scenario: &ScenarioDefinition,
    arch: Arch,
    handoff: &flume::Receiver<PathBuf>,
    deadline: &Deadline,
    timings: &Timings,
    port: u16,
) {
    let socket = match handoff.recv_timeout(deadline.remaining()) {
        Ok(socket) => socket,
        Err(flume::RecvTimeoutError::Timeout) => {
            instance.fail(Failure::Timeout(
                "control socket was not ready before the deadline".to_string(),
            ));
            return;
        }
        Err(flume::RecvTimeoutError::Disconnected) => {
            instance.fail(Failure::ControlChannel(
                "monitor ended before its control socket was ready".to_string(),
            ));
            return;
        }
    };

    // The monitor may not accept connections as soon as the socket exists
    if deadline.sleep(timings.settle).is_err() {
        instance.fail(Failure::Timeout(
            "deadline expired before dialling the control socket".to_string(),
        ));
        return;
    }

    let mut control = match platform.connect(&socket) {
        Ok(control) => control,
        Err(e) => {
            instance.fail(Failure::ControlChannel(error_chain(&e)));
            return;
        }
    };
    transition(instance, LifecycleState::ControlReady);

    transition(instance, LifecycleState::RunningScenario);
    let guest = platform.guest(port, deadline);
    let name = instance.name().to_string();
    let mut ctx = ScenarioContext::new(
        &name,
        arch,
        instance.machine(),
        &mut control,
        &guest,
        deadline,
        timings,
    );
    let res = (scenario.behavior)(&mut ctx);
    instance.record(ctx.into_failures());

    if let Err(e) = res {
        instance.fail(scenario_failure(e));
    }
}

/// Runs one scenario against one machine type and distribution.
pub fn run_instance<P: Platform>(
    platform: &P,
    ports: &PortAllocator,
    scenario: &ScenarioDefinition,
    arch: Arch,
    machine: MachineType,
    distro: GuestDistribution,
    timings: &Timings,
) -> InstanceReport {
    let start = Instant::now();
    let mut instance = TestInstance::new(scenario.name, machine, distro);
    let deadline = Deadline::after(timings.instance_timeout);
    info!("{}: starting", instance.name());

    transition(&mut instance, LifecycleState::Provisioning);
    let artifacts = match platform.provision(&distro) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            instance.fail(Failure::Setup(error_chain(&e)));
            return InstanceReport::new(scenario, instance, None, start.elapsed());
        }
    };

    let port = ports.allocate();
    instance.set_port(port);
    transition(&mut instance, LifecycleState::Launching);

    let name = instance.name().to_string();
    let request = &LaunchRequest {
        name: &name,
        machine,
        artifacts: &artifacts,
        port,
    };
    let (handoff_tx, handoff_rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded(1);

    let monitor_exit = thread::scope(|s| {
        let monitor_deadline = deadline.clone();
        s.spawn(move || {
            let exit = platform.launch(request, handoff_tx, monitor_deadline);
            let _ = done_tx.send(exit);
        });

        transition(&mut instance, LifecycleState::AwaitingControlChannel);
        drive(
            platform,
            &mut instance,
            scenario,
            arch,
            &handoff_rx,
            &deadline,
            timings,
            port,
        );

        if instance.state() == LifecycleState::Error {
            // Nothing left to wait for, have the launcher stop the monitor
            deadline.cancel();
        } else {
            transition(&mut instance, LifecycleState::AwaitingProcessExit);
        }

        done_rx.recv().ok()
    });

    match &monitor_exit {
        None => instance.fail(Failure::Setup(
            "monitor task ended without reporting an exit".to_string(),
        )),
        Some(exit) if exit.success() => {}
        Some(MonitorExit::SpawnFailed { error }) => {
            instance.fail(Failure::Setup(format!("failed to launch monitor: {error}")))
        }
        Some(MonitorExit::Killed) => {
            if instance.state() != LifecycleState::Error {
                instance.fail(Failure::Timeout(
                    "monitor did not exit before the deadline".to_string(),
                ));
            }
        }
        Some(exit @ MonitorExit::Exited { .. }) => instance.fail(Failure::Assertion(format!(
            "monitor exited abnormally: {exit:?}"
        ))),
    }

    drop(artifacts);
    if instance.state() != LifecycleState::Error {
        transition(&mut instance, LifecycleState::Done);
    }

    let report = InstanceReport::new(scenario, instance, monitor_exit, start.elapsed());
    if report.passed {
        info!("{}: passed in {:?}", report.name, report.elapsed);
    } else {
        error!(
            "{}: failed in {:?} with {} failure(s)",
            report.name,
            report.elapsed,
            report.failures.len()
        );
    }
    report
}

/// Narrows the instance matrix. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct MatrixFilter {
    pub scenarios: Vec<String>,
    pub machines: Vec<MachineType>,
    pub distros: Vec<String>,
}

impl MatrixFilter {
    pub fn matches(
        &self,
        scenario: &ScenarioDefinition,
        machine: MachineType,
        distro: &GuestDistribution,
    ) -> bool {
        (self.scenarios.is_empty() || self.scenarios.iter().any(|s| s == scenario.name))
            && (self.machines.is_empty() || self.machines.contains(&machine))
            && (self.distros.is_empty() || self.distros.iter().any(|d| d == distro.name))
    }
}

/// Every (scenario, machine, distribution) combination selected by `filter`.
pub fn plan(
    arch: Arch,
    filter: &MatrixFilter,
) -> Vec<(ScenarioDefinition, MachineType, GuestDistribution)> {
    scenarios(arch)
        .into_iter()
        .flat_map(|scenario| {
            scenario
                .combinations()
                .map(move |(machine, distro)| (scenario, machine, distro))
                .collect::<Vec<_>>()
        })
        .filter(|(scenario, machine, distro)| filter.matches(scenario, *machine, distro))
        .collect()
}

/// Runs every planned instance concurrently and returns their reports in
/// plan order.
pub fn run_matrix<P: Platform>(
    platform: &P,
    ports: &PortAllocator,
    arch: Arch,
    plan: &[(ScenarioDefinition, MachineType, GuestDistribution)],
    timings: &Timings,
) -> Vec<InstanceReport> {
    thread::scope(|s| {
        let handles: Vec<_> = plan
            .iter()
            .map(|(scenario, machine, distro)| {
                s.spawn(move || {
                    run_instance(platform, ports, scenario, arch, *machine, *distro, timings)
                })
            })
            .collect();

        handles
            .into_iter()
            .zip(plan)
            .filter_map(|(handle, (scenario, machine, distro))| match handle.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    error!(
                        "{}/{machine}/{}: instance thread panicked",
                        scenario.name, distro.name
                    );
                    None
                }
            })
            .collect()
    })
}

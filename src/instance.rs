// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use log::{debug, error};
use serde::Serialize;
use test_infra::{GuestDistribution, MachineType};
use thiserror::Error;

/// Lifecycle of one test instance. Every state but `Error` is entered in
/// declaration order, at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Created,
    Provisioning,
    Launching,
    AwaitingControlChannel,
    ControlReady,
    RunningScenario,
    AwaitingProcessExit,
    Done,
    Error,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Error)
    }

    fn successor(self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Created => Some(Provisioning),
            Provisioning => Some(Launching),
            Launching => Some(AwaitingControlChannel),
            AwaitingControlChannel => Some(ControlReady),
            ControlReady => Some(RunningScenario),
            RunningScenario => Some(AwaitingProcessExit),
            AwaitingProcessExit => Some(Done),
            Done | LifecycleState::Error => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Why an instance failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    /// Artifact creation or monitor launch failed.
    Setup(String),
    /// Dialling, negotiating or commanding the control channel failed.
    ControlChannel(String),
    /// The instance deadline expired.
    Timeout(String),
    /// A guest-visible check did not hold.
    Assertion(String),
}

impl Failure {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Failure::Assertion(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Setup(s) => write!(f, "setup failure: {s}"),
            Failure::ControlChannel(s) => write!(f, "control channel failure: {s}"),
            Failure::Timeout(s) => write!(f, "timeout: {s}"),
            Failure::Assertion(s) => write!(f, "assertion failure: {s}"),
        }
    }
}

/// One run of a scenario against one machine type and one distribution.
pub struct TestInstance {
    name: String,
    machine: MachineType,
    distro: GuestDistribution,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    failures: Vec<Failure>,
    port: Option<u16>,
}

impl TestInstance {
    pub fn new(scenario: &str, machine: MachineType, distro: GuestDistribution) -> Self {
        TestInstance {
            name: format!("{scenario}/{machine}/{}", distro.name),
            machine,
            distro,
            state: LifecycleState::Created,
            history: vec![LifecycleState::Created],
            failures: Vec::new(),
            port: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    pub fn distro(&self) -> &GuestDistribution {
        &self.distro
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn passed(&self) -> bool {
        self.state == LifecycleState::Done && self.failures.is_empty()
    }

    /// Moves to `to`, which must be the direct successor of the current
    /// state. `Error` may only be entered through [`TestInstance::fail`].
    pub fn advance(&mut self, to: LifecycleState) -> Result<(), InvalidTransition> {
        if self.state.successor() != Some(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("{}: {} -> {}", self.name, self.state, to);
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Records a failure. Fatal failures move the instance to `Error`.
    pub fn fail(&mut self, failure: Failure) {
        error!("{}: {failure}", self.name);
        self.push(failure);
    }

    /// Records failures that were already reported.
    pub fn record(&mut self, failures: impl IntoIterator<Item = Failure>) {
        for failure in failures {
            self.push(failure);
        }
    }

    fn push(&mut self, failure: Failure) {
        if failure.is_fatal() && !self.state.is_terminal() {
            self.state = LifecycleState::Error;
            self.history.push(LifecycleState::Error);
        }
        self.failures.push(failure);
    }
}

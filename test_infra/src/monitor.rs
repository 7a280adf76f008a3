// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use wait_timeout::ChildExt;

use crate::Deadline;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Command line of a monitor process.
pub struct MonitorCommand {
    command: Command,
    print_cmd: bool,
}

impl MonitorCommand {
    pub fn new<S: AsRef<OsStr>>(binary_path: S) -> Self {
        Self {
            command: Command::new(binary_path),
            print_cmd: true,
        }
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn set_print_cmd(&mut self, print_cmd: bool) -> &mut Self {
        self.print_cmd = print_cmd;
        self
    }

    pub fn spawn(&mut self) -> io::Result<Child> {
        if self.print_cmd {
            info!(
                "\n\n==== Start monitor command-line ====\n\n\
                     {:?}\n\
                     \n==== End monitor command-line ====\n\n",
                self.command
            );
        }

        // The caller should call .wait() on the returned child
        #[allow(unknown_lints)]
        #[allow(clippy::zombie_processes)]
        self.command
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
    }
}

/// How a monitor process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorExit {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Killed by the harness once the instance deadline expired.
    Killed,
    SpawnFailed {
        error: String,
    },
}

impl MonitorExit {
    pub fn success(&self) -> bool {
        matches!(
            self,
            MonitorExit::Exited {
                code: Some(0),
                ..
            }
        )
    }
}

impl From<ExitStatus> for MonitorExit {
    fn from(status: ExitStatus) -> Self {
        MonitorExit::Exited {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A monitor to run for the lifetime of one instance.
pub struct Launch<'a> {
    pub name: &'a str,
    pub command: MonitorCommand,
    pub qmp_socket: Option<&'a Path>,
    pub captures: Vec<(&'static str, &'a Path)>,
    pub deadline: Deadline,
}

/// Logs the content of every capture file.
pub fn dump_captures(name: &str, captures: &[(&'static str, &Path)]) {
    for (title, path) in captures {
        match fs::read(path) {
            Ok(data) => error!(
                "\n\n==== Start {name} {title} ====\n\n{}\n\n==== End {name} {title} ====\n\n",
                String::from_utf8_lossy(&data)
            ),
            Err(e) => error!("{name}: failed to read {title} from {path:?}: {e}"),
        }
    }
}

fn stream_lines<R: Read + Send + 'static>(name: String, stream: R) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => info!(target: "monitor", "{name}: {line}"),
                Err(e) => {
                    debug!(target: "monitor", "{name}: output stream closed: {e}");
                    break;
                }
            }
        }
    })
}

fn is_socket(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Waits for `socket` to accept connections, the child to exit, or the
/// deadline. Returns the exit status if the child went away first.
fn wait_for_socket(
    child: &mut Child,
    socket: &Path,
    deadline: &Deadline,
) -> io::Result<Option<ExitStatus>> {
    loop {
        if is_socket(socket) {
            return Ok(None);
        }
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.sleep(SOCKET_POLL_INTERVAL).is_err() {
            return Ok(None);
        }
    }
}

/// Runs a monitor process to completion.
///
/// Blocks for the whole lifetime of the process. When a control socket is
/// requested, its path is sent on `handoff` only once the socket exists;
/// the sender is dropped without a value if the process exits or the
/// deadline expires first. At the deadline the process is killed, and it is
/// always reaped before returning.
pub fn launch(mut launch: Launch, handoff: Option<flume::Sender<PathBuf>>) -> MonitorExit {
    let name = launch.name;

    let mut child = match launch.command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("{name}: failed to spawn monitor: {e}");
            dump_captures(name, &launch.captures);
            return MonitorExit::SpawnFailed {
                error: e.to_string(),
            };
        }
    };
    info!("{name}: monitor running as pid {}", child.id());

    let mut streams = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        streams.push(stream_lines(name.to_string(), stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        streams.push(stream_lines(name.to_string(), stderr));
    }

    let mut exited = None;
    if let (Some(socket), Some(handoff)) = (launch.qmp_socket, handoff) {
        match wait_for_socket(&mut child, socket, &launch.deadline) {
            Ok(None) if !launch.deadline.is_expired() => {
                debug!("{name}: control socket {socket:?} ready");
                if handoff.send(socket.to_path_buf()).is_err() {
                    warn!("{name}: nobody is waiting for the control socket");
                }
            }
            Ok(None) => warn!("{name}: deadline expired before control socket was ready"),
            Ok(Some(status)) => {
                warn!("{name}: monitor exited before control socket was ready");
                exited = Some(status);
            }
            Err(e) => error!("{name}: failed to poll monitor: {e}"),
        }
    }

    let exit = match exited {
        Some(status) => MonitorExit::from(status),
        None => supervise(name, &mut child, &launch.deadline),
    };

    for stream in streams {
        let _ = stream.join();
    }

    match &exit {
        MonitorExit::Exited {
            code: Some(0), ..
        } => info!("{name}: monitor exited"),
        exit => {
            error!("{name}: monitor ended abnormally: {exit:?}");
            dump_captures(name, &launch.captures);
        }
    }

    exit
}

fn supervise(name: &str, child: &mut Child, deadline: &Deadline) -> MonitorExit {
    loop {
        if deadline.is_expired() {
            warn!("{name}: deadline reached, killing monitor");
            kill_child(child);
            return MonitorExit::Killed;
        }

        let slice = deadline.remaining().min(EXIT_POLL_INTERVAL);
        match child.wait_timeout(slice) {
            Ok(Some(status)) => return MonitorExit::from(status),
            Ok(None) => {}
            Err(e) => {
                error!("{name}: failed to wait for monitor: {e}");
                kill_child(child);
                return MonitorExit::Killed;
            }
        }
    }
}

/// Terminates `child`, escalating to SIGKILL, and reaps it.
pub fn kill_child(child: &mut Child) {
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill child with SIGTERM: {e:?}");
        }
    }

    // The timeout period elapsed without the child exiting
    match child.wait_timeout(Duration::new(10, 0)) {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => warn!("Failed to wait for child after SIGTERM: {e:?}"),
    }

    if let Err(e) = child.kill() {
        warn!("Failed to kill child with SIGKILL: {e:?}");
    }
    if let Err(e) = child.wait() {
        error!("Failed to reap child: {e:?}");
    }
}

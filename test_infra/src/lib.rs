// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#![allow(clippy::undocumented_unsafe_blocks)]

mod machine;
mod monitor;

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::Serialize;
use ssh2::{ExtendedData, Session};
use thiserror::Error;
use vmm_sys_util::tempdir::TempDir;

pub use crate::machine::{monitor_args, Arch, LaunchSpec, MachineType, UnknownMachine};
pub use crate::monitor::{dump_captures, kill_child, launch, Launch, MonitorCommand, MonitorExit};

#[derive(Error, Debug)]
pub enum Error {
    #[error("source disk image {0:?} does not exist")]
    MissingSourceImage(PathBuf),
    #[error("cloud-init source {0:?} does not exist")]
    MissingCloudInitSource(PathBuf),
    #[error("failed to create temporary directory")]
    TempDir(#[source] vmm_sys_util::errno::Error),
    #[error("failed to create {0:?}")]
    CreateFile(PathBuf, #[source] io::Error),
    #[error("copying of OS source disk image failed")]
    CopyDisk(#[source] io::Error),
    #[error("failed to run '{0}'")]
    SpawnHostTool(String, #[source] io::Error),
    #[error("'{tool}' exited with {status}: {output}")]
    HostTool {
        tool: String,
        status: std::process::ExitStatus,
        output: String,
    },
    #[error("failed to create flash image")]
    FlashImage(#[source] io::Error),
    #[error("launch artifact '{0}' is missing")]
    MissingArtifact(&'static str),
}

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("ssh connection failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh session creation failed")]
    Session(#[source] ssh2::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh session is not authenticated")]
    NotAuthenticated,
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("ssh command failed")]
    Command(#[source] ssh2::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deadline expired")]
pub struct DeadlineExpired;

const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-instance cancellation context.
///
/// Every blocking step of an instance sleeps through its `Deadline`, so that
/// expiry or an explicit [`Deadline::cancel`] interrupts the wait. Clones
/// share the cancellation flag.
#[derive(Clone, Debug)]
pub struct Deadline {
    expires: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            expires: Instant::now() + timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || Instant::now() >= self.expires
    }

    pub fn remaining(&self) -> Duration {
        if self.is_cancelled() {
            return Duration::ZERO;
        }
        self.expires.saturating_duration_since(Instant::now())
    }

    /// Sleeps for `duration`, or fails as soon as the deadline is reached.
    pub fn sleep(&self, duration: Duration) -> Result<(), DeadlineExpired> {
        let end = Instant::now() + duration;
        loop {
            if self.is_expired() {
                return Err(DeadlineExpired);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            thread::sleep((end - now).min(self.remaining()).min(DEADLINE_POLL_INTERVAL));
        }
    }
}

#[derive(Debug, Clone)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl Default for PasswordAuth {
    fn default() -> Self {
        PasswordAuth {
            username: String::from(GUEST_USERNAME),
            password: String::from(GUEST_PASSWORD),
        }
    }
}

pub const GUEST_USERNAME: &str = "nemu";
pub const GUEST_PASSWORD: &str = "nemu123";

pub const DEFAULT_SSH_RETRIES: u8 = 5;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;
pub const DEFAULT_SSH_PORT_BASE: u16 = 2222;

/// Fixed-delay retry policy for guest connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u8,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: DEFAULT_SSH_RETRIES,
            delay: Duration::from_secs(DEFAULT_SSH_TIMEOUT.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr.
    pub output: String,
    /// `None` when the remote side went away before reporting a status.
    pub exit_status: Option<i32>,
}

/// Remote command transport into a guest.
///
/// A session is opened per command and consumed by [`GuestTransport::exec`].
pub trait GuestTransport: Send + Sync {
    type Session;

    fn connect(&self, port: u16, auth: &PasswordAuth) -> Result<Self::Session, SshCommandError>;

    fn exec(
        &self,
        session: Self::Session,
        command: &str,
    ) -> Result<CommandOutput, SshCommandError>;
}

/// SSH transport to a guest port forwarded on the loopback interface.
///
/// The guest's host key is never verified: guests are ephemeral and only
/// reachable locally.
#[derive(Debug, Clone)]
pub struct Ssh2Transport {
    pub timeout: Duration,
}

impl Default for Ssh2Transport {
    fn default() -> Self {
        Ssh2Transport {
            timeout: Duration::from_secs(60),
        }
    }
}

impl GuestTransport for Ssh2Transport {
    type Session = Session;

    fn connect(&self, port: u16, auth: &PasswordAuth) -> Result<Session, SshCommandError> {
        let tcp = TcpStream::connect(("127.0.0.1", port)).map_err(SshCommandError::Connection)?;
        let mut sess = Session::new().map_err(SshCommandError::Session)?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(self.timeout.as_millis().try_into().unwrap_or(u32::MAX));
        sess.handshake().map_err(SshCommandError::Handshake)?;

        sess.userauth_password(&auth.username, &auth.password)
            .map_err(SshCommandError::Authentication)?;
        if !sess.authenticated() {
            return Err(SshCommandError::NotAuthenticated);
        }

        Ok(sess)
    }

    fn exec(&self, sess: Session, command: &str) -> Result<CommandOutput, SshCommandError> {
        let mut channel = sess
            .channel_session()
            .map_err(SshCommandError::ChannelSession)?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(SshCommandError::ChannelSession)?;
        channel.exec(command).map_err(SshCommandError::Command)?;

        let output = read_output(&mut channel);
        // Intentionally ignore these results here as their failure
        // does not precipitate a repeat
        let _ = channel.close();
        let _ = channel.wait_close();

        Ok(CommandOutput {
            output,
            exit_status: channel.exit_status().ok(),
        })
    }
}

/// Reads a command's output to the end. Bytes that are not valid UTF-8 are
/// replaced, and whatever was read before an error is kept.
fn read_output<R: Read>(reader: &mut R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf) {
        warn!("Failed to read command output after {} bytes: {e}", buf.len());
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Runs one command per connection against a guest, retrying only the
/// connection.
pub struct SshExecutor<T = Ssh2Transport> {
    transport: T,
    port: u16,
    auth: PasswordAuth,
    policy: RetryPolicy,
    deadline: Deadline,
}

impl<T: GuestTransport> SshExecutor<T> {
    pub fn new(transport: T, port: u16, policy: RetryPolicy, deadline: Deadline) -> Self {
        SshExecutor {
            transport,
            port,
            auth: PasswordAuth::default(),
            policy,
            deadline,
        }
    }

    pub fn with_auth(mut self, auth: PasswordAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the combined output of `command`, or an empty string when the
    /// guest could not be reached.
    pub fn run(&self, command: &str) -> String {
        let mut counter = 0;
        let session = loop {
            match self.transport.connect(self.port, &self.auth) {
                Ok(session) => break session,
                Err(e) => {
                    counter += 1;
                    if counter >= self.policy.attempts {
                        error!(
                            "\n\n==== Start ssh command output (FAILED) ====\n\n\
                             command=\"{command}\"\n\
                             port=\"{}\"\n\
                             attempts=\"{counter}\"\n\
                             error=\"{e:?}\"\n\
                             \n==== End ssh command output ====\n\n",
                            self.port
                        );
                        return String::new();
                    }
                    warn!(
                        "Failed to dial guest on port {} (attempt {counter} of {}): {e}",
                        self.port, self.policy.attempts
                    );
                }
            }

            if self.deadline.sleep(self.policy.delay).is_err() {
                error!(
                    "Deadline expired while dialing guest on port {} for \"{command}\"",
                    self.port
                );
                return String::new();
            }
        };

        match self.transport.exec(session, command) {
            Ok(CommandOutput {
                output,
                exit_status,
            }) => {
                match exit_status {
                    Some(0) => {}
                    Some(status) => {
                        info!("SSH command \"{command}\" exited with status {status}")
                    }
                    None => info!("SSH command \"{command}\" did not report an exit status"),
                }
                output
            }
            Err(e) => {
                error!("Failed to run \"{command}\" on port {}: {e:?}", self.port);
                String::new()
            }
        }
    }
}

/// Hands out SSH forwarding ports, never reusing one within a process.
#[derive(Debug)]
pub struct PortAllocator {
    next: Mutex<u16>,
}

impl PortAllocator {
    pub const fn new(base: u16) -> Self {
        PortAllocator {
            next: Mutex::new(base),
        }
    }

    pub fn allocate(&self) -> u16 {
        let mut guard = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let port = *guard;
        *guard = port.wrapping_add(1);
        port
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_PORT_BASE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudInitFlavor {
    Clear,
    Ubuntu,
}

impl CloudInitFlavor {
    pub fn volume_label(self) -> &'static str {
        match self {
            CloudInitFlavor::Clear => "config-2",
            CloudInitFlavor::Ubuntu => "cidata",
        }
    }

    /// Entries, relative to the cloud-init root, copied onto the volume.
    pub fn sources(self) -> &'static [&'static str] {
        match self {
            CloudInitFlavor::Clear => &["clear/openstack"],
            CloudInitFlavor::Ubuntu => &["ubuntu/user-data", "ubuntu/meta-data"],
        }
    }
}

impl fmt::Display for CloudInitFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudInitFlavor::Clear => write!(f, "clear"),
            CloudInitFlavor::Ubuntu => write!(f, "ubuntu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GuestDistribution {
    pub name: &'static str,
    pub image: &'static str,
    pub cloud_init: CloudInitFlavor,
}

pub const CLOUD_INIT_VOLUME_SIZE: u64 = 2 << 20;
pub const FLASH_IMAGE_SIZE: u64 = 64 << 20;

/// Disposable files backing one test instance.
///
/// Everything lives under a single temporary directory which is removed
/// when the set is dropped, whichever way the instance ended.
pub struct ArtifactSet {
    tmp_dir: TempDir,
    osdisk: Option<PathBuf>,
    cloudinit: Option<PathBuf>,
    flash: Option<(PathBuf, PathBuf)>,
    debug_log: PathBuf,
    serial_log: PathBuf,
    console_log: PathBuf,
    qmp_socket: PathBuf,
}

impl ArtifactSet {
    pub fn new() -> Result<Self, Error> {
        let prefix = std::env::temp_dir().join("nats");
        let tmp_dir = TempDir::new_with_prefix(prefix).map_err(Error::TempDir)?;

        let root = tmp_dir.as_path().to_path_buf();
        let debug_log = root.join("debug.log");
        let serial_log = root.join("serial.log");
        let console_log = root.join("console.log");
        for path in [&debug_log, &serial_log, &console_log] {
            File::create(path).map_err(|e| Error::CreateFile(path.clone(), e))?;
        }

        Ok(ArtifactSet {
            tmp_dir,
            osdisk: None,
            cloudinit: None,
            flash: None,
            debug_log,
            serial_log,
            console_log,
            qmp_socket: root.join("qmp.sock"),
        })
    }

    pub fn root(&self) -> &Path {
        self.tmp_dir.as_path()
    }

    pub fn osdisk(&self) -> Option<&Path> {
        self.osdisk.as_deref()
    }

    pub fn cloudinit(&self) -> Option<&Path> {
        self.cloudinit.as_deref()
    }

    pub fn flash(&self) -> Option<(&Path, &Path)> {
        self.flash.as_ref().map(|(f0, f1)| (f0.as_path(), f1.as_path()))
    }

    pub fn debug_log(&self) -> &Path {
        &self.debug_log
    }

    pub fn serial_log(&self) -> &Path {
        &self.serial_log
    }

    pub fn console_log(&self) -> &Path {
        &self.console_log
    }

    pub fn qmp_socket(&self) -> &Path {
        &self.qmp_socket
    }

    /// Captured monitor output, titled for diagnostic dumps.
    pub fn captures(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("sysbus (OVMF) debug output", self.debug_log.as_path()),
            ("serial console output", self.serial_log.as_path()),
            ("virt console output", self.console_log.as_path()),
        ]
    }

    /// Every path this set may have created, the directory itself first.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![
            self.root().to_path_buf(),
            self.debug_log.clone(),
            self.serial_log.clone(),
            self.console_log.clone(),
            self.qmp_socket.clone(),
        ];
        paths.extend(self.osdisk.clone());
        paths.extend(self.cloudinit.clone());
        if let Some((f0, f1)) = &self.flash {
            paths.push(f0.clone());
            paths.push(f1.clone());
        }
        paths
    }

    pub fn create_primary_disk(&mut self, source: &Path) -> Result<&Path, Error> {
        let osdisk = self.root().join("osdisk.img");
        rate_limited_copy(source, &osdisk).map_err(Error::CopyDisk)?;
        Ok(self.osdisk.insert(osdisk).as_path())
    }

    pub fn create_cloud_init(
        &mut self,
        flavor: CloudInitFlavor,
        cloud_init_root: &Path,
    ) -> Result<&Path, Error> {
        let cloudinit = self.root().join("cloudinit.img");
        File::create(&cloudinit)
            .and_then(|f| f.set_len(CLOUD_INIT_VOLUME_SIZE))
            .map_err(|e| Error::CreateFile(cloudinit.clone(), e))?;

        run_host_tool(
            Command::new("mkfs.vfat")
                .args(["-n", flavor.volume_label()])
                .arg(&cloudinit),
        )?;

        for entry in flavor.sources() {
            let source = cloud_init_root.join(entry);
            if !source.exists() {
                return Err(Error::MissingCloudInitSource(source));
            }
            run_host_tool(
                Command::new("mcopy")
                    .arg("-oi")
                    .arg(&cloudinit)
                    .arg("-s")
                    .arg(&source)
                    .arg("::"),
            )?;
        }

        Ok(self.cloudinit.insert(cloudinit).as_path())
    }

    /// Creates the two pflash images: the first one seeded with `firmware`,
    /// the second one empty.
    pub fn create_flash_images(&mut self, firmware: &Path) -> Result<(), Error> {
        let flash0 = self.root().join("flash0.img");
        let flash1 = self.root().join("flash1.img");

        let mut source = File::open(firmware).map_err(Error::FlashImage)?;
        let mut dest = File::create(&flash0).map_err(Error::FlashImage)?;
        dest.set_len(FLASH_IMAGE_SIZE).map_err(Error::FlashImage)?;
        io::copy(&mut source, &mut dest).map_err(Error::FlashImage)?;

        File::create(&flash1)
            .and_then(|f| f.set_len(FLASH_IMAGE_SIZE))
            .map_err(Error::FlashImage)?;

        self.flash = Some((flash0, flash1));
        Ok(())
    }
}

/// Builds the artifact set of an instance from host-side sources.
#[derive(Debug, Clone)]
pub struct Provisioner {
    workloads: PathBuf,
    cloud_init_root: PathBuf,
    flash_firmware: Option<PathBuf>,
}

impl Provisioner {
    pub fn new(workloads: PathBuf, cloud_init_root: PathBuf) -> Self {
        Provisioner {
            workloads,
            cloud_init_root,
            flash_firmware: None,
        }
    }

    pub fn with_flash_firmware(mut self, firmware: PathBuf) -> Self {
        self.flash_firmware = Some(firmware);
        self
    }

    pub fn source_image(&self, distro: &GuestDistribution) -> PathBuf {
        self.workloads.join(distro.image)
    }

    pub fn provision(&self, distro: &GuestDistribution) -> Result<ArtifactSet, Error> {
        let source = self.source_image(distro);
        if !source.is_file() {
            return Err(Error::MissingSourceImage(source));
        }

        let mut artifacts = ArtifactSet::new()?;
        artifacts.create_cloud_init(distro.cloud_init, &self.cloud_init_root)?;
        artifacts.create_primary_disk(&source)?;
        if let Some(firmware) = &self.flash_firmware {
            artifacts.create_flash_images(firmware)?;
        }

        Ok(artifacts)
    }
}

fn free_bytes(path: &Path) -> Option<u64> {
    let fs_name = CString::new(path.as_os_str().as_bytes()).ok()?;
    unsafe {
        let mut stats = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
        if libc::statvfs(fs_name.as_ptr(), stats.as_mut_ptr()) != 0 {
            return None;
        }
        let stats = stats.assume_init();
        Some(stats.f_bavail as u64 * stats.f_bsize as u64)
    }
}

pub fn rate_limited_copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> io::Result<u64> {
    let needed = fs::metadata(&from)?.len();
    let dest_dir = to
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);

    for i in 0..10 {
        // Make sure the image fits before copying it
        if let Some(free) = free_bytes(&dest_dir) {
            if free < needed {
                warn!("Not enough space on disk ({free} < {needed}). Attempt {i} of 10. Sleeping.");
                thread::sleep(Duration::from_secs(60));
                continue;
            }
        }

        match fs::copy(&from, &to) {
            Err(e) => {
                if e.raw_os_error() == Some(libc::ENOSPC) {
                    warn!("Copy returned ENOSPC. Attempt {i} of 10. Sleeping.");
                    thread::sleep(Duration::from_secs(60));
                    continue;
                }
                return Err(e);
            }
            Ok(i) => return Ok(i),
        }
    }
    Err(io::Error::from_raw_os_error(libc::ENOSPC))
}

fn run_host_tool(command: &mut Command) -> Result<(), Error> {
    let tool = command.get_program().to_string_lossy().into_owned();
    let output = command
        .output()
        .map_err(|e| Error::SpawnHostTool(tool.clone(), e))?;

    if !output.status.success() {
        return Err(Error::HostTool {
            tool,
            status: output.status,
            output: format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use super::*;

    struct FlakyTransport {
        failures: Mutex<VecDeque<bool>>,
        dials: Mutex<u32>,
        output: CommandOutput,
    }

    impl FlakyTransport {
        fn failing_first(failures: usize, total: usize) -> Self {
            FlakyTransport {
                failures: Mutex::new((0..total).map(|i| i < failures).collect()),
                dials: Mutex::new(0),
                output: CommandOutput {
                    output: String::from("0-1\n"),
                    exit_status: Some(0),
                },
            }
        }

        fn dials(&self) -> u32 {
            *self.dials.lock().unwrap()
        }
    }

    impl GuestTransport for FlakyTransport {
        type Session = ();

        fn connect(&self, _port: u16, _auth: &PasswordAuth) -> Result<(), SshCommandError> {
            *self.dials.lock().unwrap() += 1;
            if self.failures.lock().unwrap().pop_front().unwrap_or(true) {
                return Err(SshCommandError::Connection(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                )));
            }
            Ok(())
        }

        fn exec(&self, _session: (), _command: &str) -> Result<CommandOutput, SshCommandError> {
            Ok(self.output.clone())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_ssh_retry_succeeds_on_fifth_attempt() {
        let transport = FlakyTransport::failing_first(4, 5);
        let policy = fast_policy();
        let start = Instant::now();
        let executor = SshExecutor::new(
            transport,
            2222,
            policy,
            Deadline::after(Duration::from_secs(60)),
        );

        let output = executor.run("cat /sys/devices/system/cpu/online");

        assert_eq!(output, "0-1\n");
        assert_eq!(executor.transport.dials(), 5);
        assert!(start.elapsed() >= policy.delay * 4);
    }

    #[test]
    fn test_ssh_retry_gives_up_with_empty_output() {
        let transport = FlakyTransport::failing_first(5, 5);
        let executor = SshExecutor::new(
            transport,
            2223,
            fast_policy(),
            Deadline::after(Duration::from_secs(60)),
        );

        assert_eq!(executor.run("sudo dmesg"), "");
        assert_eq!(executor.transport.dials(), 5);
    }

    #[test]
    fn test_ssh_retry_stops_at_deadline() {
        let transport = FlakyTransport::failing_first(5, 5);
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.cancel();
        let executor = SshExecutor::new(transport, 2224, fast_policy(), deadline);

        assert_eq!(executor.run("sudo reboot"), "");
        assert_eq!(executor.transport.dials(), 1);
    }

    #[test]
    fn test_ssh_non_zero_exit_keeps_output() {
        let mut transport = FlakyTransport::failing_first(0, 1);
        transport.output = CommandOutput {
            output: String::from("permission denied\n"),
            exit_status: Some(1),
        };
        let executor = SshExecutor::new(
            transport,
            2225,
            fast_policy(),
            Deadline::after(Duration::from_secs(60)),
        );

        assert_eq!(executor.run("cat /root/secret"), "permission denied\n");
    }

    /// Yields `data`, then fails.
    struct BrokenPipe<'a> {
        data: &'a [u8],
    }

    impl Read for BrokenPipe<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn test_read_output_keeps_invalid_utf8() {
        let raw = b"ACPI: FACP 0x000000007FFE1234 (v01 BOCHS  BXPCFACP)\n\xff\xfe\n";
        let output = read_output(&mut &raw[..]);
        assert!(output.starts_with("ACPI: FACP"));
        assert!(output.contains("BOCHS"));
        assert!(output.ends_with("\u{fffd}\u{fffd}\n"));
    }

    #[test]
    fn test_read_output_keeps_partial_output_on_error() {
        let mut reader = BrokenPipe {
            data: b"0-1\n",
        };
        assert_eq!(read_output(&mut reader), "0-1\n");
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(10));
        // Sleeps happen between attempts only.
        assert_eq!(
            policy.delay * u32::from(policy.attempts - 1),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_port_allocator_is_monotonic() {
        let ports = PortAllocator::new(2222);
        assert_eq!(ports.allocate(), 2222);
        assert_eq!(ports.allocate(), 2223);
        assert_eq!(ports.allocate(), 2224);
    }

    #[test]
    fn test_port_allocator_concurrent_uniqueness() {
        let ports = Arc::new(PortAllocator::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                thread::spawn(move || (0..32).map(|_| ports.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(ports.allocate(), DEFAULT_SSH_PORT_BASE + 256);
    }

    #[test]
    fn test_deadline_sleep() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(deadline.sleep(Duration::from_millis(10)).is_ok());

        let short = Deadline::after(Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(short.sleep(Duration::from_secs(30)), Err(DeadlineExpired));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(short.is_expired());
        assert_eq!(short.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_deadline_cancel_is_shared() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let clone = deadline.clone();
        let waiter = thread::spawn(move || clone.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        deadline.cancel();
        assert_eq!(waiter.join().unwrap(), Err(DeadlineExpired));
    }

    #[test]
    fn test_cloud_init_flavors() {
        assert_eq!(CloudInitFlavor::Clear.volume_label(), "config-2");
        assert_eq!(CloudInitFlavor::Ubuntu.volume_label(), "cidata");
        assert_eq!(CloudInitFlavor::Clear.sources(), &["clear/openstack"]);
        assert_eq!(
            CloudInitFlavor::Ubuntu.sources(),
            &["ubuntu/user-data", "ubuntu/meta-data"]
        );
    }

    #[test]
    fn test_artifact_set_removed_on_drop() {
        let source_dir = TempDir::new_with_prefix("/tmp/nats-src").unwrap();
        let source = source_dir.as_path().join("golden.img");
        fs::write(&source, b"golden image").unwrap();
        let firmware = source_dir.as_path().join("QEMU_EFI.fd");
        fs::write(&firmware, b"firmware").unwrap();

        let mut artifacts = ArtifactSet::new().unwrap();
        let osdisk = artifacts.create_primary_disk(&source).unwrap().to_path_buf();
        assert_eq!(fs::read(&osdisk).unwrap(), b"golden image");
        artifacts.create_flash_images(&firmware).unwrap();
        let (flash0, flash1) = artifacts.flash().unwrap();
        assert_eq!(fs::metadata(flash0).unwrap().len(), FLASH_IMAGE_SIZE);
        assert_eq!(fs::metadata(flash1).unwrap().len(), FLASH_IMAGE_SIZE);

        let paths = artifacts.paths();
        assert!(paths.contains(&osdisk));
        assert!(artifacts.debug_log().exists());
        drop(artifacts);

        for path in paths {
            assert!(!path.exists(), "{path:?} leaked");
        }
    }

    fn host_tools_available(tools: &[&str]) -> bool {
        tools
            .iter()
            .all(|tool| Command::new(tool).arg("--version").output().is_ok())
    }

    // FAT12/16 keep the volume label at offset 43 of the boot sector.
    fn volume_label(volume: &Path) -> String {
        let data = fs::read(volume).unwrap();
        String::from_utf8_lossy(&data[43..54]).trim_end().to_string()
    }

    fn mtype(volume: &Path, file: &str) -> String {
        let output = Command::new("mtype")
            .arg("-i")
            .arg(volume)
            .arg(format!("::/{file}"))
            .output()
            .unwrap();
        assert!(output.status.success(), "mtype {file}: {output:?}");
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    #[test]
    fn test_provision_builds_and_releases_artifacts() {
        if !host_tools_available(&["mkfs.vfat", "mcopy", "mtype"]) {
            eprintln!("mkfs.vfat or mtools not available, skipping");
            return;
        }

        let workloads = TempDir::new_with_prefix("/tmp/nats-workloads").unwrap();
        fs::write(workloads.as_path().join("guest.img"), b"golden image").unwrap();
        let cloud_init = workloads.as_path().join("cloud-init");
        fs::create_dir_all(cloud_init.join("ubuntu")).unwrap();
        fs::create_dir_all(cloud_init.join("clear/openstack/latest")).unwrap();
        fs::write(cloud_init.join("ubuntu/user-data"), "#cloud-config\n").unwrap();
        fs::write(cloud_init.join("ubuntu/meta-data"), "instance-id: nats\n").unwrap();
        fs::write(
            cloud_init.join("clear/openstack/latest/user_data"),
            "#cloud-config\nusers:\n  - name: nemu\n",
        )
        .unwrap();

        let provisioner = Provisioner::new(workloads.as_path().to_path_buf(), cloud_init);
        for (flavor, label, file, content) in [
            (
                CloudInitFlavor::Ubuntu,
                "cidata",
                "user-data",
                "#cloud-config\n",
            ),
            (
                CloudInitFlavor::Clear,
                "config-2",
                "openstack/latest/user_data",
                "#cloud-config\nusers:\n  - name: nemu\n",
            ),
        ] {
            let distro = GuestDistribution {
                name: "guest",
                image: "guest.img",
                cloud_init: flavor,
            };
            let artifacts = provisioner.provision(&distro).unwrap();

            assert_eq!(fs::read(artifacts.osdisk().unwrap()).unwrap(), b"golden image");
            let volume = artifacts.cloudinit().unwrap();
            assert_eq!(fs::metadata(volume).unwrap().len(), CLOUD_INIT_VOLUME_SIZE);
            assert!(volume_label(volume).eq_ignore_ascii_case(label));
            assert_eq!(mtype(volume, file), content);
            assert!(artifacts.flash().is_none());

            let paths = artifacts.paths();
            drop(artifacts);
            for path in paths {
                assert!(!path.exists(), "{path:?} leaked");
            }
        }
    }

    #[test]
    fn test_provision_missing_source_image() {
        let workloads = TempDir::new_with_prefix("/tmp/nats-workloads").unwrap();
        let provisioner = Provisioner::new(
            workloads.as_path().to_path_buf(),
            workloads.as_path().join("cloud-init"),
        );
        let distro = GuestDistribution {
            name: "clear",
            image: "missing.img",
            cloud_init: CloudInitFlavor::Clear,
        };

        match provisioner.provision(&distro) {
            Err(Error::MissingSourceImage(path)) => {
                assert_eq!(path, workloads.as_path().join("missing.img"))
            }
            Err(e) => panic!("unexpected error: {e:?}"),
            Ok(_) => panic!("provisioning without a source image succeeded"),
        }
    }
}

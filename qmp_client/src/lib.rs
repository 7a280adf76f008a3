// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal client for the QEMU Machine Protocol.
//!
//! Messages are newline-delimited JSON objects. The server greets first, the
//! client negotiates capabilities, and every command then gets exactly one
//! `return` or `error` reply. Asynchronous `event` messages may be interleaved
//! and are skipped.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error connecting to QMP socket")]
    Connect(#[source] std::io::Error),
    #[error("Error writing to or reading from QMP socket")]
    Socket(#[source] std::io::Error),
    #[error("Error serializing QMP command")]
    Serialize(#[source] serde_json::Error),
    #[error("Error parsing QMP message")]
    Parse(#[source] serde_json::Error),
    #[error("QMP server did not send a greeting")]
    MissingGreeting,
    #[error("QMP connection closed")]
    Disconnected,
    #[error("Server responded with an error: {class}: {desc}")]
    ServerResponse { class: String, desc: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QmpVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VersionInfo {
    qemu: QmpVersion,
    #[serde(default)]
    package: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Greeting {
    version: VersionInfo,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

impl Greeting {
    pub fn version(&self) -> &QmpVersion {
        &self.version.qemu
    }

    pub fn package(&self) -> &str {
        &self.version.package
    }
}

#[derive(Deserialize)]
struct ErrorReply {
    class: String,
    desc: String,
}

pub struct QmpClient<S: Read + Write = UnixStream> {
    stream: BufReader<S>,
    greeting: Greeting,
}

impl QmpClient<UnixStream> {
    /// Dials the control socket at `path` and reads the server greeting.
    pub fn connect<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self, Error> {
        let socket = UnixStream::connect(path).map_err(Error::Connect)?;
        socket
            .set_read_timeout(Some(timeout))
            .map_err(Error::Connect)?;
        socket
            .set_write_timeout(Some(timeout))
            .map_err(Error::Connect)?;
        Self::new(socket)
    }
}

impl<S: Read + Write> QmpClient<S> {
    pub fn new(socket: S) -> Result<Self, Error> {
        let mut stream = BufReader::new(socket);
        let message = match read_message(&mut stream) {
            Ok(message) => message,
            Err(Error::Disconnected) => return Err(Error::MissingGreeting),
            Err(e) => return Err(e),
        };
        let greeting = message
            .get("QMP")
            .cloned()
            .ok_or(Error::MissingGreeting)
            .and_then(|g| serde_json::from_value::<Greeting>(g).map_err(Error::Parse))?;

        let version = greeting.version();
        info!(
            "QMP version {}.{}.{} {}",
            version.major,
            version.minor,
            version.micro,
            greeting.package()
        );

        Ok(QmpClient { stream, greeting })
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Leaves capability negotiation mode. Must precede any other command.
    pub fn capabilities(&mut self) -> Result<(), Error> {
        self.execute("qmp_capabilities", None).map(|_| ())
    }

    /// Sends one command and returns the content of its `return` reply.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, Error> {
        let mut request = Map::new();
        request.insert("execute".to_string(), Value::from(command));
        if let Some(arguments) = arguments {
            request.insert("arguments".to_string(), arguments);
        }

        let mut data = serde_json::to_string(&request).map_err(Error::Serialize)?;
        data.push('\n');
        debug!("QMP request: {}", data.trim_end());

        let socket = self.stream.get_mut();
        socket.write_all(data.as_bytes()).map_err(Error::Socket)?;
        socket.flush().map_err(Error::Socket)?;

        loop {
            let mut message = read_message(&mut self.stream)?;
            if let Some(value) = message.get_mut("return") {
                return Ok(value.take());
            }
            if let Some(error) = message.get("error") {
                let reply: ErrorReply =
                    serde_json::from_value(error.clone()).map_err(Error::Parse)?;
                return Err(Error::ServerResponse {
                    class: reply.class,
                    desc: reply.desc,
                });
            }
            if let Some(event) = message.get("event") {
                debug!("QMP event: {event}");
            }
        }
    }

    /// Asks the monitor to exit. The connection dropping before the reply
    /// arrives counts as success.
    pub fn quit(&mut self) -> Result<(), Error> {
        match self.execute("quit", None) {
            Ok(_) | Err(Error::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn cpu_device_add(
        &mut self,
        driver: &str,
        id: &str,
        socket_id: u32,
        core_id: u32,
        thread_id: u32,
    ) -> Result<(), Error> {
        self.execute(
            "device_add",
            Some(json!({
                "driver": driver,
                "id": id,
                "socket-id": socket_id,
                "core-id": core_id,
                "thread-id": thread_id,
            })),
        )
        .map(|_| ())
    }

    pub fn object_add(&mut self, qom_type: &str, id: &str, props: Value) -> Result<(), Error> {
        self.execute(
            "object-add",
            Some(json!({
                "qom-type": qom_type,
                "id": id,
                "props": props,
            })),
        )
        .map(|_| ())
    }

    /// Adds a memory backend of `size_mib` MiB and plugs a DIMM on it.
    pub fn hotplug_memory(
        &mut self,
        qom_type: &str,
        id: &str,
        mem_path: Option<&str>,
        size_mib: u64,
    ) -> Result<(), Error> {
        let mut props = json!({ "size": size_mib << 20 });
        if let Some(mem_path) = mem_path {
            props["mem-path"] = Value::from(mem_path);
        }
        self.object_add(qom_type, id, props)?;

        self.execute(
            "device_add",
            Some(json!({
                "driver": "pc-dimm",
                "id": format!("dimm{id}"),
                "memdev": id,
            })),
        )
        .map(|_| ())
    }
}

fn read_message<R: BufRead>(stream: &mut R) -> Result<Value, Error> {
    let mut line = String::new();
    loop {
        line.clear();
        let count = stream.read_line(&mut line).map_err(Error::Socket)?;
        if count == 0 {
            return Err(Error::Disconnected);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(&line).map_err(Error::Parse)
}

//! Device-bridge client
//!
//! Speaks the bridge server's smart-socket protocol over TCP. Each operation
//! opens its own connection, selects the target device, then requests one
//! service:
//!
//! ```text
//! request:  4 hex digits (payload length) | payload
//! reply:    "OKAY" | "FAIL" 4 hex digits message
//! ```
//!
//! File pushes use the `sync:` sub-protocol, where every frame is a 4-byte
//! id followed by a little-endian u32:
//!
//! ```text
//! SEND len "path,mode" | DATA len bytes ... | DONE mtime  ->  OKAY 0 | FAIL len msg
//! ```
//!
//! Socket read/write timeouts bound every operation.

use super::install::{parse_install_output, InstallResult, InstallStatus};
use super::{shell_quote, DeviceChannel};
use crate::core::error::DeviceError;
use regex::Regex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 5037;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum payload of one sync DATA frame
const SYNC_CHUNK: usize = 64 * 1024;
const SYNC_MAX_PATH: usize = 1024;
/// Request lengths are four hex digits
const MAX_REQUEST: usize = 0xFFFF;
/// Regular file, rw-r--r--
const PUSH_FILE_MODE: u32 = 0o100644;

/// [`DeviceChannel`] backed by a device-bridge server
#[derive(Debug, Clone)]
pub struct AdbChannel {
    server: SocketAddr,
    serial: Option<String>,
    timeout: Duration,
}

impl AdbChannel {
    /// Target the device `serial` (or the only attached device) through
    /// the server at `server`
    pub fn new(server: SocketAddr, serial: Option<String>) -> Self {
        AdbChannel {
            server,
            serial,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Server on the loopback interface
    pub fn local(port: u16, serial: Option<String>) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), serial)
    }

    /// Per-operation socket timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Connect, select the device, and open `service`
    fn open(&self, service: &str) -> Result<TcpStream, DeviceError> {
        let mut stream = TcpStream::connect_timeout(&self.server, self.timeout)
            .map_err(|e| DeviceError::from_io("connect", e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| DeviceError::from_io("connect", e))?;

        let transport = match &self.serial {
            Some(serial) => format!("host:transport:{}", serial),
            None => "host:transport-any".to_string(),
        };
        request(&mut stream, &transport)?;
        request(&mut stream, service)?;
        Ok(stream)
    }

    fn shell_text(&self, command: &str) -> Result<String, DeviceError> {
        let output = self.shell(command, None)?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    fn install_session(
        &self,
        packages: &[String],
        options: &[String],
    ) -> Result<InstallResult, DeviceError> {
        let create = command_line(["pm", "install-create"], options, []);
        let output = self.shell_text(&create)?;
        let session = match session_id(&output) {
            Some(session) => session,
            None => return Ok(parse_install_output(&output)),
        };
        debug!("Opened install session {}", session);

        let written = (|| -> Result<Option<InstallResult>, DeviceError> {
            for (index, package) in packages.iter().enumerate() {
                let split = format!("{}_{}", index, base_name(package));
                let write = command_line(
                    ["pm", "install-write", session.as_str()],
                    &[],
                    [split.as_str(), package.as_str()],
                );
                let result = parse_install_output(&self.shell_text(&write)?);
                if result.status != InstallStatus::Ok {
                    return Ok(Some(result));
                }
            }
            Ok(None)
        })();

        match written {
            Ok(None) => {
                let commit = command_line(["pm", "install-commit", session.as_str()], &[], []);
                Ok(parse_install_output(&self.shell_text(&commit)?))
            }
            Ok(Some(failure)) => {
                self.abandon(&session);
                Ok(failure)
            }
            Err(e) => {
                self.abandon(&session);
                Err(e)
            }
        }
    }

    fn abandon(&self, session: &str) {
        let abandon = command_line(["pm", "install-abandon", session], &[], []);
        if let Err(e) = self.shell(&abandon, None) {
            warn!("Failed to abandon install session {}: {}", session, e);
        }
    }
}

impl DeviceChannel for AdbChannel {
    fn push(&self, data: &[u8], remote_path: &str) -> Result<(), DeviceError> {
        let spec = format!("{},{}", remote_path, PUSH_FILE_MODE);
        if spec.len() > SYNC_MAX_PATH {
            return Err(DeviceError::Protocol(format!(
                "remote path too long: {}",
                remote_path
            )));
        }

        let mut stream = self.open("sync:")?;
        let io = |e| DeviceError::from_io("push", e);

        write_frame(&mut stream, b"SEND", spec.as_bytes()).map_err(io)?;
        for chunk in data.chunks(SYNC_CHUNK) {
            write_frame(&mut stream, b"DATA", chunk).map_err(io)?;
        }
        let mtime = chrono::Utc::now().timestamp() as u32;
        stream.write_all(b"DONE").map_err(io)?;
        stream.write_all(&mtime.to_le_bytes()).map_err(io)?;

        let mut header = [0u8; 8];
        stream.read_exact(&mut header).map_err(io)?;
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        match &header[..4] {
            b"OKAY" => {}
            b"FAIL" => {
                let mut reason = vec![0u8; len];
                stream.read_exact(&mut reason).map_err(io)?;
                return Err(DeviceError::Rejected {
                    request: format!("push {}", remote_path),
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                });
            }
            other => {
                return Err(DeviceError::Protocol(format!(
                    "unexpected sync reply {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        }

        stream.write_all(b"QUIT").ok();
        stream.write_all(&0u32.to_le_bytes()).ok();
        debug!("Pushed {} bytes to {}", data.len(), remote_path);
        Ok(())
    }

    fn shell(&self, command: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>, DeviceError> {
        let mut stream = self.open(&format!("exec:{}", command))?;
        let io = |e| DeviceError::from_io("shell", e);

        if let Some(input) = stdin {
            stream.write_all(input).map_err(io)?;
        }
        stream.shutdown(Shutdown::Write).map_err(io)?;

        let mut output = Vec::new();
        stream.read_to_end(&mut output).map_err(io)?;
        debug!("Shell '{}' returned {} bytes", command, output.len());
        Ok(output)
    }

    fn install(
        &self,
        packages: &[String],
        options: &[String],
    ) -> Result<InstallResult, DeviceError> {
        match packages {
            [] => Err(DeviceError::Protocol("no packages to install".to_string())),
            [package] => {
                let install = command_line(["pm", "install"], options, [package.as_str()]);
                Ok(parse_install_output(&self.shell_text(&install)?))
            }
            _ => self.install_session(packages, options),
        }
    }

    fn uninstall(&self, package_id: &str) -> Result<bool, DeviceError> {
        let uninstall = command_line(["pm", "uninstall"], &[], [package_id]);
        let output = self.shell_text(&uninstall)?;
        Ok(output.trim() == "Success")
    }
}

/// Send one smart-socket request and consume its status reply
fn request(stream: &mut TcpStream, payload: &str) -> Result<(), DeviceError> {
    let io = |e| DeviceError::from_io(payload, e);
    let framed = frame_request(payload)?;
    stream.write_all(framed.as_bytes()).map_err(io)?;

    let mut status = [0u8; 4];
    stream.read_exact(&mut status).map_err(io)?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let reason = read_hex_string(stream).map_err(io)?;
            if reason.contains("not found") {
                Err(DeviceError::NotFound(reason))
            } else {
                Err(DeviceError::Rejected {
                    request: payload.to_string(),
                    reason,
                })
            }
        }
        other => Err(DeviceError::Protocol(format!(
            "unexpected status {:?} for '{}'",
            String::from_utf8_lossy(other),
            payload
        ))),
    }
}

fn frame_request(payload: &str) -> Result<String, DeviceError> {
    if payload.len() > MAX_REQUEST {
        return Err(DeviceError::Protocol(format!(
            "request of {} bytes exceeds {}",
            payload.len(),
            MAX_REQUEST
        )));
    }
    Ok(format!("{:04x}{}", payload.len(), payload))
}

fn read_hex_string(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = std::str::from_utf8(&len)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length"))?;
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message)?;
    Ok(String::from_utf8_lossy(&message).into_owned())
}

fn write_frame(stream: &mut TcpStream, id: &[u8; 4], payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(id)?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)
}

fn command_line<'a, const N: usize, const M: usize>(
    program: [&'a str; N],
    options: &'a [String],
    args: [&'a str; M],
) -> String {
    let mut parts: Vec<String> = program.iter().map(|p| p.to_string()).collect();
    parts.extend(options.iter().map(|o| shell_quote(o)));
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn session_id(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("static regex is valid"));
    if !output.trim_start().starts_with("Success") {
        return None;
    }
    pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

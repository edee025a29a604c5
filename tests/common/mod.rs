//! Shared fixtures for integration tests
#![allow(dead_code)]

use deltadeploy::core::archive::SIGNATURE_BLOCK_MAGIC;
use deltadeploy::core::redefine::{Redefinition, UnitHandle};
use deltadeploy::{
    BundleSplitter, DeviceChannel, DeviceError, InstallResult, RedefineError, VmConnector,
    VmSession,
};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

struct PendingEntry {
    name: String,
    data: Vec<u8>,
    deflate: bool,
}

/// Writes real zip bytes
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<PendingEntry>,
    comment: Vec<u8>,
    signature: Option<Vec<u8>>,
}

/// Offsets of a built archive
#[derive(Debug, Clone, Copy)]
pub struct BuiltLayout {
    pub central_directory_offset: u64,
    pub central_directory_size: u64,
    pub signature_block: Option<(u64, u64)>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            data: data.to_vec(),
            deflate: false,
        });
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            data: data.to_vec(),
            deflate: true,
        });
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Add a signature block carrying `payload`
    pub fn signed(mut self, payload: &[u8]) -> Self {
        self.signature = Some(payload.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_with_layout().0
    }

    pub fn build_with_layout(&self) -> (Vec<u8>, BuiltLayout) {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for entry in &self.entries {
            let crc = crc32fast::hash(&entry.data);
            let (method, body) = if entry.deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&entry.data).unwrap();
                (8u16, encoder.finish().unwrap())
            } else {
                (0u16, entry.data.clone())
            };
            let offset = out.len() as u32;

            out.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(&body);

            central.extend_from_slice(&CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes());
            central.extend_from_slice(&method.to_le_bytes());
            central.extend_from_slice(&[0u8; 4]);
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&(body.len() as u32).to_le_bytes());
            central.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0u8; 4]); // extra, comment
            central.extend_from_slice(&[0u8; 8]); // disk, internal, external attrs
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(entry.name.as_bytes());
        }

        let signature_block = self.signature.as_ref().map(|payload| {
            let size = (payload.len() + 8 + SIGNATURE_BLOCK_MAGIC.len()) as u64;
            let offset = out.len() as u64;
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(payload);
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(SIGNATURE_BLOCK_MAGIC);
            (offset, size + 8)
        });

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);

        out.extend_from_slice(&END_OF_DIRECTORY_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // disk numbers
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);

        let layout = BuiltLayout {
            central_directory_offset: cd_offset as u64,
            central_directory_size: central.len() as u64,
            signature_block,
        };
        (out, layout)
    }

    pub fn write_to(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

/// Encode a code container
pub fn bundle(units: &[(&str, &[u8])]) -> Vec<u8> {
    BundleSplitter::encode(units.iter().map(|(name, payload)| (*name, *payload)))
}

/// Operation observed by [`RecordingDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Push { path: String, bytes: Vec<u8> },
    Shell(String),
    Install { packages: Vec<String>, options: Vec<String> },
    Uninstall(String),
}

/// In-memory device that records every call
pub struct RecordingDevice {
    ops: Mutex<Vec<DeviceOp>>,
    install_result: Mutex<InstallResult>,
    fail_pushes: Mutex<bool>,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingDevice {
            ops: Mutex::new(Vec::new()),
            install_result: Mutex::new(InstallResult::ok()),
            fail_pushes: Mutex::new(false),
        })
    }

    pub fn set_install_result(&self, result: InstallResult) {
        *self.install_result.lock() = result;
    }

    /// Make every push time out
    pub fn fail_pushes(&self) {
        *self.fail_pushes.lock() = true;
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.ops.lock().clone()
    }

    pub fn pushed_paths(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                DeviceOp::Push { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn installs(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                DeviceOp::Install { packages, options } => Some((packages, options)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }
}

impl DeviceChannel for RecordingDevice {
    fn push(&self, data: &[u8], remote_path: &str) -> Result<(), DeviceError> {
        if *self.fail_pushes.lock() {
            return Err(DeviceError::Timeout(format!("push {}", remote_path)));
        }
        self.ops.lock().push(DeviceOp::Push {
            path: remote_path.to_string(),
            bytes: data.to_vec(),
        });
        Ok(())
    }

    fn shell(&self, command: &str, _stdin: Option<&[u8]>) -> Result<Vec<u8>, DeviceError> {
        self.ops.lock().push(DeviceOp::Shell(command.to_string()));
        Ok(Vec::new())
    }

    fn install(
        &self,
        packages: &[String],
        options: &[String],
    ) -> Result<InstallResult, DeviceError> {
        self.ops.lock().push(DeviceOp::Install {
            packages: packages.to_vec(),
            options: options.to_vec(),
        });
        Ok(self.install_result.lock().clone())
    }

    fn uninstall(&self, package_id: &str) -> Result<bool, DeviceError> {
        self.ops.lock().push(DeviceOp::Uninstall(package_id.to_string()));
        Ok(true)
    }
}

#[derive(Default)]
struct VmState {
    breadcrumb: Option<u32>,
    loaded: HashMap<String, UnitHandle>,
    attaches: usize,
    batches: Vec<Vec<(String, Vec<u8>)>>,
    reject: Option<String>,
}

/// Target process double for live swap
#[derive(Clone, Default)]
pub struct SimulatedVm {
    state: Arc<Mutex<VmState>>,
}

impl SimulatedVm {
    pub fn new(loaded: &[&str]) -> Self {
        let vm = SimulatedVm::default();
        vm.load(loaded);
        vm
    }

    pub fn load(&self, names: &[&str]) {
        let mut state = self.state.lock();
        for name in names {
            let handle = state.loaded.len() as UnitHandle + 1;
            state.loaded.insert(name.to_string(), handle);
        }
    }

    /// Pretend a different agent attached earlier
    pub fn set_breadcrumb(&self, checksum: u32) {
        self.state.lock().breadcrumb = Some(checksum);
    }

    pub fn breadcrumb(&self) -> Option<u32> {
        self.state.lock().breadcrumb
    }

    /// Reject every redefinition with `reason`
    pub fn reject_with(&self, reason: &str) {
        self.state.lock().reject = Some(reason.to_string());
    }

    /// Accept redefinitions again
    pub fn accept(&self) {
        self.state.lock().reject = None;
    }

    pub fn attaches(&self) -> usize {
        self.state.lock().attaches
    }

    /// Unit names of every applied batch
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .batches
            .iter()
            .map(|batch| batch.iter().map(|(name, _)| name.clone()).collect())
            .collect()
    }

    pub fn connector(&self) -> Arc<dyn VmConnector> {
        Arc::new(self.clone())
    }
}

impl VmConnector for SimulatedVm {
    fn breadcrumb(&self, _endpoint: &str) -> Result<Option<u32>, RedefineError> {
        Ok(self.state.lock().breadcrumb)
    }

    fn attach(
        &self,
        _endpoint: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn VmSession>, RedefineError> {
        self.state.lock().attaches += 1;
        Ok(Box::new(self.clone()))
    }
}

impl VmSession for SimulatedVm {
    fn record_breadcrumb(&mut self, checksum: u32) -> Result<(), RedefineError> {
        self.state.lock().breadcrumb = Some(checksum);
        Ok(())
    }

    fn resolve(&mut self, name: &str) -> Result<Option<UnitHandle>, RedefineError> {
        Ok(self.state.lock().loaded.get(name).copied())
    }

    fn redefine(&mut self, batch: &[Redefinition]) -> Result<(), RedefineError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.reject {
            return Err(RedefineError::Rejected(reason.clone()));
        }
        state.batches.push(
            batch
                .iter()
                .map(|r| (r.name.clone(), r.payload.clone()))
                .collect(),
        );
        Ok(())
    }
}

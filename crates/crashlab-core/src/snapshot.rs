//! Snapshot artifacts
//!
//! Serializes the faulting thread's state to a named file next to the
//! build identity, so the artifact can be matched to its build later.
//! Persistence is best-effort: [`SnapshotWriter::capture`] reports failure
//! through the returned [`SnapshotArtifact`] and never panics.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fault::{AccessKind, FaultCode, FaultDescriptor, RegisterSet};
use crate::identity::BuildIdentity;
use crate::sanitize::sanitize;

/// Snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Snapshot already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Not a crashlab snapshot (format {0:?})")]
    Format(String),
}

/// What to do when the artifact file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPolicy {
    /// Atomically replace the existing artifact
    #[default]
    Replace,
    /// Keep the existing artifact and report a failure
    Keep,
}

/// Result of a capture attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    pub path: PathBuf,
    pub success: bool,
    pub error: Option<String>,
}

impl SnapshotArtifact {
    fn written(path: PathBuf) -> Self {
        Self {
            path,
            success: true,
            error: None,
        }
    }

    fn failed(path: PathBuf, error: String) -> Self {
        Self {
            path,
            success: false,
            error: Some(error),
        }
    }
}

/// Build identity as stored in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub revision: String,
    pub branch: String,
    pub timestamp: String,
}

/// Fault fields as stored in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub code: u32,
    pub code_name: String,
    pub signal: Option<i32>,
    pub instruction_address: u64,
    pub access: Option<AccessKind>,
    pub target_address: Option<u64>,
}

/// Contents of a snapshot artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub format: String,
    pub format_version: u32,
    /// Sentinel-delimited build tag, stored verbatim
    pub build_tag: String,
    pub build: BuildRecord,
    pub process_id: u32,
    pub thread_id: u64,
    /// Seconds since the Unix epoch
    pub captured_at: u64,
    pub fault: FaultRecord,
    pub registers: RegisterSet,
}

impl SnapshotRecord {
    pub const FORMAT: &'static str = "crashlab-snapshot";
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new(d: &FaultDescriptor, identity: &BuildIdentity) -> Self {
        Self {
            format: Self::FORMAT.to_string(),
            format_version: Self::FORMAT_VERSION,
            build_tag: identity.tag().to_string(),
            build: BuildRecord {
                revision: identity.revision().to_string(),
                branch: identity.branch().to_string(),
                timestamp: identity.timestamp().to_string(),
            },
            process_id: std::process::id(),
            thread_id: d.thread_id,
            captured_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            fault: FaultRecord {
                code: d.code.raw(),
                code_name: d.code.name().to_string(),
                signal: d.signal,
                instruction_address: d.instruction_address,
                access: d.access,
                target_address: d.target_address,
            },
            registers: d.registers.clone(),
        }
    }

    pub fn fault_code(&self) -> FaultCode {
        FaultCode::from_raw(self.fault.code)
    }

    pub fn identity(&self) -> BuildIdentity {
        BuildIdentity::new(
            self.build.revision.as_str(),
            self.build.branch.as_str(),
            self.build.timestamp.as_str(),
        )
    }

    /// Rebuild the descriptor this record was written from
    pub fn descriptor(&self) -> FaultDescriptor {
        FaultDescriptor {
            code: self.fault_code(),
            instruction_address: self.fault.instruction_address,
            access: self.fault.access,
            target_address: self.fault.target_address,
            signal: self.fault.signal,
            registers: self.registers.clone(),
            thread_id: self.thread_id,
        }
    }
}

/// Per-process counter keeping temporary file names unique across threads
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes snapshot artifacts named after the build identity
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    prefix: String,
    extension: String,
    max_component_len: usize,
    existing: ExistingPolicy,
}

impl Default for SnapshotWriter {
    fn default() -> Self {
        Self {
            prefix: "CrashDump".into(),
            extension: "dmp".into(),
            max_component_len: 128,
            existing: ExistingPolicy::Replace,
        }
    }
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Bound applied to each sanitized identity component
    pub fn with_max_component_len(mut self, max_len: usize) -> Self {
        self.max_component_len = max_len;
        self
    }

    pub fn with_existing_policy(mut self, existing: ExistingPolicy) -> Self {
        self.existing = existing;
        self
    }

    pub fn existing_policy(&self) -> ExistingPolicy {
        self.existing
    }

    /// `<prefix>_<revision>_<branch>.<ext>` with both identity parts sanitized
    pub fn file_name(&self, identity: &BuildIdentity) -> String {
        format!(
            "{}_{}_{}.{}",
            sanitize(&self.prefix, self.max_component_len),
            sanitize(identity.revision(), self.max_component_len),
            sanitize(identity.branch(), self.max_component_len),
            sanitize(&self.extension, self.max_component_len),
        )
    }

    /// Full artifact path; `None` means the current directory
    pub fn path_for(&self, identity: &BuildIdentity, out_dir: Option<&Path>) -> PathBuf {
        let name = self.file_name(identity);
        match out_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Write a snapshot of `d`. Failures are reported, never raised.
    pub fn capture(
        &self,
        d: &FaultDescriptor,
        identity: &BuildIdentity,
        out_dir: Option<&Path>,
    ) -> SnapshotArtifact {
        let path = self.path_for(identity, out_dir);
        match self.write(&path, d, identity) {
            Ok(len) => {
                log::info!("Snapshot written: {} ({} bytes)", path.display(), len);
                SnapshotArtifact::written(path)
            }
            Err(e) => {
                log::warn!("Snapshot not written to {}: {}", path.display(), e);
                SnapshotArtifact::failed(path, e.to_string())
            }
        }
    }

    fn write(
        &self,
        path: &Path,
        d: &FaultDescriptor,
        identity: &BuildIdentity,
    ) -> Result<usize, SnapshotError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let record = SnapshotRecord::new(d, identity);
        let bytes = serde_json::to_vec_pretty(&record)?;

        // Write to a private temporary file first so concurrent writers
        // never interleave, then publish it under the final name.
        let temp = temp_path(path);
        let written = create_exclusive(&temp).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        let published = match self.existing {
            ExistingPolicy::Replace => fs::rename(&temp, path).map_err(SnapshotError::from),
            ExistingPolicy::Keep => match fs::hard_link(&temp, path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Err(SnapshotError::AlreadyExists(path.to_path_buf()))
                }
                Err(e) => Err(e.into()),
            },
        };
        if temp.exists() {
            let _ = fs::remove_file(&temp);
        }

        published.map(|()| bytes.len())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), unique))
}

fn create_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Load a snapshot artifact written by [`SnapshotWriter::capture`]
pub fn read_snapshot(path: &Path) -> Result<SnapshotRecord, SnapshotError> {
    let bytes = fs::read(path)?;
    let record: SnapshotRecord = serde_json::from_slice(&bytes)?;
    if record.format != SnapshotRecord::FORMAT {
        return Err(SnapshotError::Format(record.format));
    }
    log::debug!(
        "Read snapshot {}: {} on thread {}",
        path.display(),
        record.fault.code_name,
        record.thread_id
    );
    Ok(record)
}

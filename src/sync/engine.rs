//! Sync engine that pushes changed layout tests to the device.
//!
//! A sync pass lists the remote test tree, compares it against the host tree by
//! modification time and ships every stale file in a single archive that the
//! device-side helper expands in place.
//!
//! # Failure model
//!
//! A failure while archiving, pushing or extracting aborts the whole pass with
//! [`SyncError::FailedSync`]. Nothing is retried; the next pass recomputes the
//! plan from scratch, so a partially applied archive is harmless.
//!
//! # Example
//!
//! ```rust,ignore
//! use drt_device::sync::{DeviceFileSync, PrefixFilter};
//!
//! let engine = DeviceFileSync::new(&bridge, helper_path);
//! let report = engine.sync_test_files(&tests_dir, "/data/webkit/layout-tests", &PrefixFilter::default())?;
//! println!("pushed {} files", report.files_transferred);
//! ```

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use super::archive::{ARCHIVE_NAME, build_archive};
use super::filter::{PathFilter, SyncFilter};
use super::listing::{RemoteFileInventory, parse_listing_line, parse_recursive_listing};
use crate::bridge::{Bridge, BridgeError};

/// Location of the archive extractor on the device.
pub const REMOTE_HELPER_PATH: &str = "/system/bin/drtunzip";

/// Printed by the extraction command only when every step succeeded.
pub const EXTRACT_OK_MARKER: &str = "===DRT_SYNC_OK===";

/// Stage of a sync pass, used in failure diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Archive,
    HelperPush,
    ArchivePush,
    Extract,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Archive => write!(f, "building archive"),
            Self::HelperPush => write!(f, "pushing unpack helper"),
            Self::ArchivePush => write!(f, "pushing archive"),
            Self::Extract => write!(f, "extracting archive on device"),
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync failed while {stage}: {reason}. Re-run the sync")]
    FailedSync { stage: SyncStage, reason: String },

    #[error("Test directory {} does not exist", .0.display())]
    MissingTestRoot(PathBuf),

    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] BridgeError),
}

impl SyncError {
    fn failed(stage: SyncStage, reason: impl Into<String>) -> Self {
        Self::FailedSync {
            stage,
            reason: reason.into(),
        }
    }
}

/// Turn a bridge failure during a transfer step into a staged sync failure.
fn at_stage(stage: SyncStage) -> impl Fn(BridgeError) -> SyncError {
    move |e| SyncError::failed(stage, e.to_string())
}

/// A host file selected for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Path relative to the test root, `/`-separated.
    pub relative_path: String,
    pub host_path: PathBuf,
}

/// Host files to transfer, ordered by full host path.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    files: Vec<PlannedFile>,
    considered: usize,
}

impl SyncPlan {
    pub fn files(&self) -> &[PlannedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Host files that passed the filter.
    pub fn considered(&self) -> usize {
        self.considered
    }

    pub fn relative_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.relative_path.as_str())
    }
}

/// One file found on the host side.
#[derive(Debug, Clone)]
pub struct HostFile {
    pub relative_path: String,
    pub host_path: PathBuf,
    pub mtime: SystemTime,
}

/// Whether a host file must be pushed given the device's copy (if any).
///
/// Equal timestamps count as current.
pub fn needs_transfer(device_mtime: Option<i64>, host_mtime: SystemTime) -> bool {
    match device_mtime {
        None => true,
        Some(device) => {
            let device = UNIX_EPOCH + Duration::from_secs(device.max(0) as u64);
            host_mtime > device
        }
    }
}

/// Select the stale files among `host_files`.
///
/// The result depends only on the set of inputs, not on their order.
pub fn select_stale(
    host_files: impl IntoIterator<Item = HostFile>,
    inventory: &RemoteFileInventory,
    filter: &dyn PathFilter,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for file in host_files {
        if filter.excludes(&file.relative_path) {
            continue;
        }
        plan.considered += 1;
        let device_mtime = inventory.get(&file.relative_path).map(|e| e.mtime);
        if needs_transfer(device_mtime, file.mtime) {
            plan.files.push(PlannedFile {
                relative_path: file.relative_path,
                host_path: file.host_path,
            });
        }
    }
    plan.files
        .sort_by(|a, b| a.host_path.as_os_str().cmp(b.host_path.as_os_str()));
    plan.files.dedup();
    plan
}

/// Walk `host_root` and plan the transfer against `inventory`.
pub fn plan_sync(
    host_root: &Path,
    inventory: &RemoteFileInventory,
    filter: &dyn PathFilter,
) -> SyncPlan {
    let host_files = WalkDir::new(host_root)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative_path = relative_name(host_root, entry.path())?;
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some(HostFile {
                relative_path,
                host_path: entry.into_path(),
                mtime,
            })
        });
    select_stale(host_files, inventory, filter)
}

/// `path` relative to `root` with `/` separators.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Result of comparing a host file with its device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    SizeDiffers,
    HashDiffers,
    Current,
}

impl Freshness {
    pub fn exists(self) -> bool {
        self != Freshness::Missing
    }

    pub fn needs_update(self) -> bool {
        self != Freshness::Current
    }
}

/// Compare a host file with a device file: size first, content hash only when
/// the sizes agree.
///
/// The device is asked for a SHA-256 digest and, on builds whose toolbox lacks
/// `sha256sum`, for an MD5 digest. A device offering neither reports
/// [`Freshness::HashDiffers`].
pub fn check_freshness(
    bridge: &impl Bridge,
    local: &Path,
    remote: &str,
) -> Result<Freshness, SyncError> {
    let Some(remote_size) = remote_file_size(bridge, remote)? else {
        return Ok(Freshness::Missing);
    };

    let local_size = std::fs::metadata(local)
        .map_err(|source| SyncError::Io {
            path: local.to_path_buf(),
            source,
        })?
        .len();
    if local_size != remote_size {
        return Ok(Freshness::SizeDiffers);
    }

    let Some((algorithm, remote_hash)) = remote_digest(bridge, remote)? else {
        tracing::warn!(remote = %remote, "device offers no content digest; assuming stale");
        return Ok(Freshness::HashDiffers);
    };
    let local_hash = match algorithm {
        HashAlgorithm::Sha256 => hash_file::<Sha256>(local)?,
        HashAlgorithm::Md5 => hash_file::<Md5>(local)?,
    };

    if remote_hash.eq_ignore_ascii_case(&local_hash) {
        Ok(Freshness::Current)
    } else {
        Ok(Freshness::HashDiffers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlgorithm {
    Sha256,
    Md5,
}

impl HashAlgorithm {
    fn command(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256sum",
            Self::Md5 => "md5",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Md5 => 32,
        }
    }
}

/// First digest the device can compute for `remote`, strongest first.
fn remote_digest(
    bridge: &impl Bridge,
    remote: &str,
) -> Result<Option<(HashAlgorithm, String)>, BridgeError> {
    let quoted = shell_words::quote(remote);
    for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Md5] {
        let output = bridge.shell(&[algorithm.command(), quoted.as_ref(), "2>/dev/null"])?;
        let token = output.split_whitespace().next().unwrap_or_default();
        if token.len() == algorithm.hex_len() && token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(Some((algorithm, token.to_string())));
        }
        tracing::debug!(command = algorithm.command(), "digest unavailable on device");
    }
    Ok(None)
}

fn remote_file_size(bridge: &impl Bridge, remote: &str) -> Result<Option<u64>, BridgeError> {
    let quoted = shell_words::quote(remote);
    let output = bridge.shell(&["ls", "-l", quoted.as_ref(), "2>/dev/null"])?;
    Ok(output
        .lines()
        .find_map(parse_listing_line)
        .filter(|line| !line.is_dir)
        .map(|line| line.size))
}

fn hash_file<D: Digest + io::Write>(path: &Path) -> Result<String, SyncError> {
    let io_err = |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = D::new();
    io::copy(&mut file, &mut hasher).map_err(io_err)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub remote_root: String,
    pub files_considered: usize,
    pub files_transferred: usize,
    pub archive_bytes: u64,
    pub helper_updated: bool,
    pub duration_ms: u64,
}

/// Keeps the device's copy of the test tree current.
pub struct DeviceFileSync<'a, B: Bridge> {
    bridge: &'a B,
    helper_local: PathBuf,
    helper_remote: String,
}

impl<'a, B: Bridge> DeviceFileSync<'a, B> {
    /// Create an engine that uses `helper_local` as the host copy of the
    /// device-side extractor.
    pub fn new(bridge: &'a B, helper_local: impl Into<PathBuf>) -> Self {
        Self {
            bridge,
            helper_local: helper_local.into(),
            helper_remote: REMOTE_HELPER_PATH.to_string(),
        }
    }

    /// Override where the extractor lives on the device.
    pub fn with_remote_helper(mut self, remote: impl Into<String>) -> Self {
        self.helper_remote = remote.into();
        self
    }

    /// Fetch the device inventory of `remote_root` under `filter`.
    pub fn remote_inventory(
        &self,
        remote_root: &str,
        filter: &dyn PathFilter,
    ) -> Result<RemoteFileInventory, SyncError> {
        let quoted = shell_words::quote(remote_root);
        let listing = self.bridge.shell(&["ls", "-Rl", quoted.as_ref()])?;
        Ok(parse_recursive_listing(remote_root, &listing, filter))
    }

    /// Push every stale, non-excluded file under `host_root` to `remote_root`.
    pub fn sync_test_files(
        &self,
        host_root: &Path,
        remote_root: &str,
        exclude: &dyn PathFilter,
    ) -> Result<SyncReport, SyncError> {
        if !host_root.is_dir() {
            return Err(SyncError::MissingTestRoot(host_root.to_path_buf()));
        }

        let start = Instant::now();
        let remote_root = remote_root.trim_end_matches('/');
        let filter = SyncFilter::new(exclude);

        let inventory = self.remote_inventory(remote_root, &filter)?;
        let plan = plan_sync(host_root, &inventory, &filter);

        tracing::debug!(
            remote_root = %remote_root,
            device_files = inventory.len(),
            host_files = plan.considered(),
            stale = plan.len(),
            "sync plan computed"
        );

        let mut report = SyncReport {
            remote_root: remote_root.to_string(),
            files_considered: plan.considered(),
            ..Default::default()
        };

        if !plan.is_empty() {
            tracing::info!(
                files = plan.len(),
                remote_root = %remote_root,
                "pushing layout test files to device (use --no-sync to disable)"
            );
            let (archive_bytes, helper_updated) = self.transfer(&plan, remote_root)?;
            report.files_transferred = plan.len();
            report.archive_bytes = archive_bytes;
            report.helper_updated = helper_updated;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn transfer(&self, plan: &SyncPlan, remote_root: &str) -> Result<(u64, bool), SyncError> {
        let staging = tempfile::Builder::new()
            .prefix("drt-sync-")
            .tempdir()
            .map_err(|e| SyncError::failed(SyncStage::Archive, e.to_string()))?;
        let archive = staging.path().join(ARCHIVE_NAME);

        let archive_bytes = build_archive(&archive, plan.files())
            .map_err(|e| SyncError::failed(SyncStage::Archive, e.to_string()))?;

        let helper_updated = self.ensure_helper()?;

        let quoted_root = shell_words::quote(remote_root);
        self.bridge
            .shell(&["mkdir", "-p", quoted_root.as_ref()])
            .map_err(at_stage(SyncStage::ArchivePush))?;
        let nomedia = shell_words::quote(&format!("{remote_root}/.nomedia")).into_owned();
        self.bridge
            .shell(&["touch", nomedia.as_str()])
            .map_err(at_stage(SyncStage::ArchivePush))?;

        let code = self
            .bridge
            .push(&archive, &format!("{remote_root}/"))
            .map_err(at_stage(SyncStage::ArchivePush))?;
        if code != 0 {
            return Err(SyncError::failed(
                SyncStage::ArchivePush,
                format!("adb push exited with {code}"),
            ));
        }

        let helper = shell_words::quote(&self.helper_remote);
        let output = self
            .bridge
            .shell(&[
                "cd",
                quoted_root.as_ref(),
                "&&",
                helper.as_ref(),
                ARCHIVE_NAME,
                "&&",
                "rm",
                ARCHIVE_NAME,
                "&&",
                "echo",
                EXTRACT_OK_MARKER,
            ])
            .map_err(at_stage(SyncStage::Extract))?;
        if !output.contains(EXTRACT_OK_MARKER) {
            return Err(SyncError::failed(SyncStage::Extract, output.trim()));
        }

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "failed to remove host archive");
        }

        Ok((archive_bytes, helper_updated))
    }

    /// Push the extractor when the device copy is missing or differs.
    fn ensure_helper(&self) -> Result<bool, SyncError> {
        if !self.helper_local.is_file() {
            return Err(SyncError::failed(
                SyncStage::HelperPush,
                format!("unpack helper not found at {}", self.helper_local.display()),
            ));
        }

        let freshness = check_freshness(self.bridge, &self.helper_local, &self.helper_remote)
            .map_err(|e| match e {
                SyncError::Transport(e) => at_stage(SyncStage::HelperPush)(e),
                other => other,
            })?;
        if !freshness.needs_update() {
            return Ok(false);
        }

        tracing::info!(
            helper = %self.helper_remote,
            reason = ?freshness,
            "updating unpack helper on device"
        );

        let remount = self
            .bridge
            .run(&["remount"])
            .map_err(at_stage(SyncStage::HelperPush))?;
        if !remount.success() {
            tracing::warn!(exit_code = remount.exit_code, "adb remount failed");
        }

        let code = self
            .bridge
            .push(&self.helper_local, &self.helper_remote)
            .map_err(at_stage(SyncStage::HelperPush))?;
        if code != 0 {
            return Err(SyncError::failed(
                SyncStage::HelperPush,
                format!("adb push exited with {code}"),
            ));
        }
        Ok(true)
    }
}

/// Set the device clock to the host's UTC time so mtime comparisons line up.
pub fn align_device_clock(bridge: &impl Bridge) -> Result<(), BridgeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();
    bridge.shell(&["date", "-u", now.as_str()])?;
    Ok(())
}

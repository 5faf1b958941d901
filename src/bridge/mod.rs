//! Command-relay bridge to the attached device.
//!
//! Every interaction with the device goes through the [`Bridge`] trait: plain
//! adb invocations, `adb shell` commands, socket forwards and file pushes. The
//! bridge is slow and occasionally flaky, so callers treat each call as a
//! blocking round-trip and check exit codes explicitly.
//!
//! # Target selection
//!
//! A bridge carries the serial of the device it talks to. [`AdbBridge`] passes
//! it as `-s <serial>` on every invocation. The serial is committed by
//! [`crate::device::ensure_target_device`], which takes the bridge by `&mut`;
//! every component that runs after resolution receives the same bridge value,
//! so nothing depends on process-wide environment state.
//!
//! # Example
//!
//! ```rust,ignore
//! use drt_device::bridge::{AdbBridge, Bridge};
//!
//! let mut bridge = AdbBridge::locate()?;
//! drt_device::device::ensure_target_device(&mut bridge, None, Some("prod1"))?;
//! let listing = bridge.shell(&["ls", "-l", "/data/local/tmp"])?;
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::config::EnvironmentError;

pub mod mock;

pub use mock::MockBridge;

/// Oldest adb release whose `forward local:` and `devices -l` behave as we need.
pub const MIN_ADB_VERSION: AdbVersion = AdbVersion {
    major: 1,
    minor: 0,
    patch: 31,
};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"version (\d+)\.(\d+)\.(\d+)").expect("valid version regex"));

/// Errors raised by the transport itself.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },
}

/// Captured result of one bridge invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command-relay transport to a single device.
///
/// Implementations only need [`Bridge::run`] and the target accessors; the
/// remaining operations are expressed in terms of `run`.
pub trait Bridge {
    /// Run `adb <args>` against the current target.
    fn run(&self, args: &[&str]) -> Result<CommandOutput, BridgeError>;

    /// Serial of the device this bridge is bound to, if any.
    fn target(&self) -> Option<&str>;

    /// Bind all subsequent invocations to `serial`.
    fn set_target(&mut self, serial: &str);

    /// Run `adb <args>` and fail unless it exits cleanly.
    fn run_checked(&self, args: &[&str]) -> Result<String, BridgeError> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(BridgeError::CommandFailed {
                command: render_command(args),
                code: output.exit_code,
                output: output.stdout.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Run a command in the device shell and return its stdout.
    ///
    /// The device shell does not reliably propagate exit codes, so callers
    /// inspect the output instead.
    fn shell(&self, args: &[&str]) -> Result<String, BridgeError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        Ok(self.run(&full)?.stdout)
    }

    /// Forward a local socket spec to a device socket spec.
    fn forward(&self, local: &str, remote: &str) -> Result<i32, BridgeError> {
        Ok(self.run(&["forward", local, remote])?.exit_code)
    }

    /// Copy a host file to the device.
    fn push(&self, local: &Path, remote: &str) -> Result<i32, BridgeError> {
        let local = local.to_string_lossy();
        Ok(self.run(&["push", local.as_ref(), remote])?.exit_code)
    }
}

/// Production bridge that shells out to the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb: PathBuf,
    serial: Option<String>,
}

impl AdbBridge {
    pub fn new(adb: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            serial: None,
        }
    }

    /// Find `adb` on `PATH`.
    pub fn locate() -> Result<Self, EnvironmentError> {
        let adb = which::which("adb").map_err(|_| EnvironmentError::AdbNotFound)?;
        Ok(Self::new(adb))
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }
}

impl Bridge for AdbBridge {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, BridgeError> {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd.args(args);

        let command = render_command(args);
        tracing::debug!(
            serial = self.serial.as_deref().unwrap_or("-"),
            command = %command,
            "adb"
        );

        let output = cmd.output().map_err(|source| BridgeError::Spawn {
            command: command.clone(),
            source,
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn target(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn set_target(&mut self, serial: &str) {
        self.serial = Some(serial.to_string());
    }
}

/// Parsed `adb version` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AdbVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for AdbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Extract the version triple from `adb version` output.
pub fn parse_adb_version(output: &str) -> Option<AdbVersion> {
    let caps = VERSION_RE.captures(output)?;
    Some(AdbVersion {
        major: caps[1].parse().ok()?,
        minor: caps[2].parse().ok()?,
        patch: caps[3].parse().ok()?,
    })
}

/// Verify the adb client is new enough.
pub fn check_adb_version(bridge: &impl Bridge) -> Result<AdbVersion, EnvironmentError> {
    let output = bridge.run_checked(&["version"])?;
    let version = parse_adb_version(&output).ok_or_else(|| EnvironmentError::AdbVersionUnknown {
        output: output.trim().to_string(),
    })?;

    if version < MIN_ADB_VERSION {
        return Err(EnvironmentError::AdbTooOld {
            required: MIN_ADB_VERSION.to_string(),
            found: version.to_string(),
        });
    }
    Ok(version)
}

/// Render an argument vector for logs and error messages.
pub fn render_command(args: &[&str]) -> String {
    format!("adb {}", shell_words::join(args))
}

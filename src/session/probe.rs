//! Liveness queries for the remote runtime process.

use crate::bridge::{Bridge, BridgeError};

/// Process-name prefix of the test runtime on the device.
pub const RUNTIME_PROCESS_PREFIX: &str = crate::device::RUNTIME_PACKAGE;

/// Finds the remote runtime's process id.
///
/// Sessions use it for liveness checks and to find the process to kill.
pub trait ProcessProbe {
    fn find_pid(&self, bridge: &dyn Bridge) -> Result<Option<u32>, BridgeError>;
}

/// Scans the device's `ps` output for a process name prefix.
#[derive(Debug, Clone)]
pub struct PsProbe {
    prefix: String,
}

impl PsProbe {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PsProbe {
    fn default() -> Self {
        Self::new(RUNTIME_PROCESS_PREFIX)
    }
}

impl ProcessProbe for PsProbe {
    fn find_pid(&self, bridge: &dyn Bridge) -> Result<Option<u32>, BridgeError> {
        let output = bridge.shell(&["ps"])?;
        Ok(find_pid_in_ps(&output, &self.prefix))
    }
}

/// First pid whose process name starts with `prefix`.
///
/// Only rows with exactly nine columns are considered:
///
/// ```text
/// USER     PID   PPID  VSIZE  RSS     WCHAN    PC         NAME
/// app_35   1302  127   214964 31872 ffffffff 00000000 S org.webkit.dumprendertree
/// ```
pub fn find_pid_in_ps(output: &str, prefix: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 9 || !fields[8].starts_with(prefix) {
            return None;
        }
        fields[1].parse().ok()
    })
}

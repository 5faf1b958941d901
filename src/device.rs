//! Target device resolution and device-level setup checks.
//!
//! [`resolve_device`] is a pure function over `adb devices -l` output.
//! [`ensure_target_device`] runs it against a live bridge and commits the
//! chosen serial to that bridge. **Side effect:** after a successful call every
//! later invocation made through the same bridge value is addressed to the
//! resolved device; callers must hand that bridge to the sync engine and to
//! every runtime session.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::bridge::{Bridge, BridgeError};
use crate::config::EnvironmentError;
use crate::sync::{self, Freshness};

static DEVICE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+).*?\bproduct:(\S+)").expect("valid device regex"));

/// Package name prefix of the test runtime on the device.
pub const RUNTIME_PACKAGE: &str = "org.webkit.dumprendertree";

/// Install locations the package manager may have picked for the runtime.
const RUNTIME_PACKAGE_SUFFIXES: [&str; 3] = ["", "-1", "-2"];

/// One attached device as reported by `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub serial: String,
    pub product: String,
}

/// Errors that can occur while choosing the target device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No devices online. Check USB connection")]
    NoDevicesOnline,

    #[error("Device ANDROID_SERIAL={serial} is not online")]
    PinnedDeviceOffline { serial: String },

    #[error("Device ANDROID_SERIAL={serial} is wrong product: {actual}. Expected TARGET_PRODUCT={expected}")]
    ProductMismatch {
        serial: String,
        actual: String,
        expected: String,
    },

    #[error("No devices {} found. Use ANDROID_SERIAL=<serial> or check the USB connection", product_clause(.product))]
    NoMatchingDevice { product: Option<String> },

    #[error("Multiple devices {} found. Use ANDROID_SERIAL=<serial> or check the USB connections. Candidates: {}", product_clause(.product), render_candidates(.candidates))]
    AmbiguousDevice {
        product: Option<String>,
        candidates: Vec<DeviceRecord>,
    },

    #[error(transparent)]
    Transport(#[from] BridgeError),
}

fn product_clause(product: &Option<String>) -> String {
    match product {
        Some(p) => format!("for TARGET_PRODUCT={p}"),
        None => "for any product".to_string(),
    }
}

fn render_candidates(candidates: &[DeviceRecord]) -> String {
    candidates
        .iter()
        .map(|d| format!("{}:{}", d.serial, d.product))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse `adb devices -l` output. Lines without a `product:` token are skipped;
/// a serial reported twice keeps its last product.
pub fn parse_device_list(output: &str) -> Vec<DeviceRecord> {
    let mut devices: Vec<DeviceRecord> = Vec::new();
    for line in output.lines() {
        let Some(caps) = DEVICE_LINE_RE.captures(line.trim()) else {
            continue;
        };
        let serial = caps[1].to_string();
        let product = caps[2].to_string();
        match devices.iter_mut().find(|d| d.serial == serial) {
            Some(existing) => existing.product = product,
            None => devices.push(DeviceRecord { serial, product }),
        }
    }
    devices
}

/// Choose the target device from an inventory.
///
/// Empty `pinned`/`desired_product` strings are treated as unset.
pub fn resolve_device(
    inventory: &str,
    pinned: Option<&str>,
    desired_product: Option<&str>,
) -> Result<DeviceRecord, DeviceError> {
    let online = parse_device_list(inventory);
    if online.is_empty() {
        return Err(DeviceError::NoDevicesOnline);
    }

    let pinned = pinned.filter(|s| !s.is_empty());
    let desired_product = desired_product.filter(|s| !s.is_empty());

    if let Some(serial) = pinned {
        let device = online
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| DeviceError::PinnedDeviceOffline {
                serial: serial.to_string(),
            })?;

        if let Some(expected) = desired_product
            && device.product != expected
        {
            return Err(DeviceError::ProductMismatch {
                serial: device.serial,
                actual: device.product,
                expected: expected.to_string(),
            });
        }
        return Ok(device);
    }

    let mut candidates: Vec<DeviceRecord> = online
        .into_iter()
        .filter(|d| desired_product.is_none_or(|p| d.product == p))
        .collect();

    match candidates.len() {
        0 => Err(DeviceError::NoMatchingDevice {
            product: desired_product.map(str::to_string),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(DeviceError::AmbiguousDevice {
            product: desired_product.map(str::to_string),
            candidates,
        }),
    }
}

/// Resolve the target device and bind `bridge` to it.
pub fn ensure_target_device<B: Bridge>(
    bridge: &mut B,
    pinned: Option<&str>,
    desired_product: Option<&str>,
) -> Result<DeviceRecord, DeviceError> {
    let inventory = bridge.run_checked(&["devices", "-l"])?;

    let device = resolve_device(&inventory, pinned, desired_product)?;

    bridge.set_target(&device.serial);
    tracing::info!(
        serial = %device.serial,
        product = %device.product,
        "using device"
    );
    Ok(device)
}

/// Confirm the device shell executes commands.
pub fn check_shell(bridge: &impl Bridge) -> Result<(), EnvironmentError> {
    let output = bridge.shell(&["echo", "ok"])?;
    if output.trim() != "ok" {
        return Err(EnvironmentError::ShellUnavailable {
            output: output.trim().to_string(),
        });
    }
    Ok(())
}

/// Install the runtime package unless an identical copy is already present.
///
/// Returns `true` when an install was performed.
pub fn ensure_runtime_installed(
    bridge: &impl Bridge,
    package: &Path,
) -> Result<bool, EnvironmentError> {
    if !package.exists() {
        return Err(EnvironmentError::MissingFile {
            what: "DumpRenderTree package",
            path: package.to_path_buf(),
        });
    }

    let mut freshness = Freshness::Missing;
    for suffix in RUNTIME_PACKAGE_SUFFIXES {
        let remote = format!("/data/app/{RUNTIME_PACKAGE}{suffix}.apk");
        freshness = sync::check_freshness(bridge, package, &remote)?;
        if freshness.exists() {
            break;
        }
    }

    if !freshness.needs_update() {
        tracing::debug!(package = %package.display(), "runtime package is current");
        return Ok(false);
    }

    let package_arg = package.to_string_lossy();
    let mut args = vec!["install"];
    if freshness.exists() {
        args.push("-r");
    }
    args.push(package_arg.as_ref());

    let output = bridge.run(&args)?;
    if !output.success() {
        return Err(EnvironmentError::InstallFailed {
            path: package.to_path_buf(),
            code: output.exit_code,
        });
    }
    tracing::info!(package = %package.display(), "installed runtime package");
    Ok(true)
}

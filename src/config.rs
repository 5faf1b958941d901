//! Environment and run-option configuration.
//!
//! The Android build environment is described by a handful of variables
//! (`ANDROID_PRODUCT_OUT`, `TARGET_PRODUCT`, `ANDROID_SERIAL`). They are read
//! once through [`EnvConfig::from_env`], which honours a `.env` file via
//! `dotenvy`, and CLI flags override individual fields afterwards.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::bridge::BridgeError;

pub const PRODUCT_OUT_VAR: &str = "ANDROID_PRODUCT_OUT";
pub const TARGET_PRODUCT_VAR: &str = "TARGET_PRODUCT";
pub const SERIAL_VAR: &str = "ANDROID_SERIAL";
pub const SOCKET_DIR_VAR: &str = "DRT_SOCKET_DIR";

/// Directory where `adb forward local:` sockets are created by default.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Layout test tree on the device.
pub const DEFAULT_REMOTE_TESTS_DIR: &str = "/data/webkit/layout-tests";

pub const ACTIVITY_HW: &str = "org.webkit.dumprendertree/.DumpRenderTreeActivity";
pub const ACTIVITY_SW: &str = "org.webkit.dumprendertree/.DumpRenderTreeSWActivity";

/// Required configuration or host state is missing or unusable.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Missing environment variable {0}. You need to define the Android build environment")]
    MissingVar(&'static str),

    #[error("Cannot find adb in PATH. Check the Android build")]
    AdbNotFound,

    #[error("Cannot determine adb version. Got: {output:?}")]
    AdbVersionUnknown { output: String },

    #[error("The version of adb is too old. Required: {required}, got: {found}")]
    AdbTooOld { required: String, found: String },

    #[error("Cannot execute adb shell. Check permissions and the device (got {output:?})")]
    ShellUnavailable { output: String },

    #[error("Unable to find {what} at {}", path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("Cannot install {}: adb install exited with {code}", path.display())]
    InstallFailed { path: PathBuf, code: i32 },

    #[error("{0}")]
    IncompatibleOptions(&'static str),

    #[error(transparent)]
    Transport(#[from] BridgeError),

    #[error(transparent)]
    Sync(#[from] crate::sync::SyncError),
}

/// Values taken from the Android build environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvConfig {
    pub product_out: Option<PathBuf>,
    pub target_product: Option<String>,
    pub serial: Option<String>,
    pub socket_dir: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            product_out: None,
            target_product: None,
            serial: None,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
        }
    }
}

impl EnvConfig {
    /// Load config from environment variables. Empty values count as unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(out) = non_empty_var(PRODUCT_OUT_VAR) {
            cfg.product_out = Some(PathBuf::from(out));
        }
        cfg.target_product = non_empty_var(TARGET_PRODUCT_VAR);
        cfg.serial = non_empty_var(SERIAL_VAR);
        if let Some(dir) = non_empty_var(SOCKET_DIR_VAR) {
            cfg.socket_dir = PathBuf::from(dir);
        }

        cfg
    }

    /// Both build variables must be present before touching the device.
    pub fn require_android_env(&self) -> Result<(), EnvironmentError> {
        self.require_product_out()?;
        if self.target_product.is_none() {
            return Err(EnvironmentError::MissingVar(TARGET_PRODUCT_VAR));
        }
        Ok(())
    }

    pub fn require_product_out(&self) -> Result<&Path, EnvironmentError> {
        self.product_out
            .as_deref()
            .ok_or(EnvironmentError::MissingVar(PRODUCT_OUT_VAR))
    }

    /// Join path components onto the product output directory.
    pub fn build_path(&self, components: &[&str]) -> Result<PathBuf, EnvironmentError> {
        let mut path = self.require_product_out()?.to_path_buf();
        path.extend(components);
        Ok(path)
    }

    /// Host copy of the on-device archive extractor.
    pub fn unpack_helper_path(&self) -> Result<PathBuf, EnvironmentError> {
        self.build_path(&["system", "bin", "drtunzip"])
    }

    /// Host copy of the test-runtime package.
    pub fn runtime_package_path(&self) -> Result<PathBuf, EnvironmentError> {
        self.build_path(&["data", "app", "org.webkit.dumprendertree.apk"])
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    dotenvy::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Per-run switches that shape how the runtime is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub sw_compositing: bool,
    pub force_sw_pixel_tests: bool,
    pub force_single_surface_rendering: bool,
    pub no_sync: bool,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), EnvironmentError> {
        if self.sw_compositing && self.force_sw_pixel_tests {
            return Err(EnvironmentError::IncompatibleOptions(
                "--sw-compositing cannot be used with --force-sw-pixel-tests",
            ));
        }
        if self.sw_compositing && self.force_single_surface_rendering {
            return Err(EnvironmentError::IncompatibleOptions(
                "--sw-compositing cannot be used with --force-single-surface-mode",
            ));
        }
        Ok(())
    }

    pub fn uses_sw_pixel_tests(&self) -> bool {
        self.sw_compositing || self.force_sw_pixel_tests
    }

    /// Activity component to launch for the selected compositing mode.
    pub fn activity(&self) -> &'static str {
        if self.sw_compositing {
            ACTIVITY_SW
        } else {
            ACTIVITY_HW
        }
    }

    /// Baseline directories searched for expectations, most specific first.
    ///
    /// ```text
    /// hw  pluto   android-pluto/ -> android/
    /// sw  pluto   android-sw-pluto/ -> android-sw/ -> android/
    /// ```
    pub fn platform_dir_cascade(&self, product: Option<&str>) -> Vec<String> {
        let sw = self.uses_sw_pixel_tests();
        let mut first = String::from("android");
        if sw {
            first.push_str("-sw");
        }
        if let Some(product) = product {
            first.push('-');
            first.push_str(product);
        }

        let mut dirs = vec![first];
        if sw {
            dirs.push("android-sw".to_string());
        }
        dirs.push("android".to_string());
        dirs.dedup();
        dirs
    }

    /// Name of the results directory under the build output.
    pub fn results_dir_name(&self, product: Option<&str>) -> String {
        let mode = if self.uses_sw_pixel_tests() { "sw" } else { "hw" };
        match product {
            Some(product) => format!("android-{mode}-{product}"),
            None => format!("android-{mode}"),
        }
    }
}

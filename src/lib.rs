pub mod bridge;
pub mod config;
pub mod device;
pub mod session;
pub mod sync;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use once_cell::sync::Lazy;
use serde::Serialize;

use bridge::{AdbBridge, Bridge};
use config::{DEFAULT_REMOTE_TESTS_DIR, EnvConfig, RunOptions};
use device::DeviceRecord;
use session::{RemoteProcessSession, SessionConfig};
use sync::{DeviceFileSync, PrefixFilter, SyncReport};

static LONG_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{}\nbuilt: {}\ntarget: {}",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
    )
});

/// Marks the end of one response block from the test runtime.
const END_OF_BLOCK: &[u8] = b"#EOF\n";

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "drtdev",
    version,
    long_version = LONG_VERSION.as_str(),
    about = "Prepare an Android device for layout tests and drive DumpRenderTree on it"
)]
pub struct Cli {
    /// Path to the adb executable (defaults to the one on PATH)
    #[arg(long, global = true, env = "DRT_ADB")]
    pub adb: Option<PathBuf>,

    /// Device serial to use (overrides ANDROID_SERIAL)
    #[arg(long, global = true)]
    pub serial: Option<String>,

    /// Product the device must report (overrides TARGET_PRODUCT)
    #[arg(long, global = true)]
    pub product: Option<String>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify the build environment, adb, the device and the runtime package
    Check {
        /// Do not install or update the runtime package
        #[arg(long)]
        no_install: bool,

        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Resolve and print the target device
    Devices,
    /// Push changed layout tests to the device
    Sync {
        #[command(flatten)]
        tests: TestTreeArgs,

        /// Leave the device clock alone
        #[arg(long)]
        no_clock: bool,
    },
    /// Run a DumpRenderTree session fed from stdin, one test per line
    Session {
        /// Worker index; selects the forwarded ports
        #[arg(long, default_value_t = 0)]
        worker: u32,

        /// Seconds to wait for each output line
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Skip syncing layout tests before starting
        #[arg(long)]
        no_sync: bool,

        #[command(flatten)]
        tests: OptionalTestTreeArgs,

        #[command(flatten)]
        mode: ModeArgs,
    },
}

/// Compositing and rendering switches.
#[derive(Args, Debug, Clone, Default)]
pub struct ModeArgs {
    /// Use the software-compositing activity
    #[arg(long)]
    pub sw_compositing: bool,

    /// Capture pixel results in software
    #[arg(long)]
    pub force_sw_pixel_tests: bool,

    /// Render into a single surface
    #[arg(long = "force-single-surface-mode")]
    pub force_single_surface_rendering: bool,
}

impl ModeArgs {
    fn run_options(&self, no_sync: bool) -> RunOptions {
        RunOptions {
            sw_compositing: self.sw_compositing,
            force_sw_pixel_tests: self.force_sw_pixel_tests,
            force_single_surface_rendering: self.force_single_surface_rendering,
            no_sync,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TestTreeArgs {
    /// Host LayoutTests directory
    #[arg(long, env = "DRT_TESTS_DIR")]
    pub tests_dir: PathBuf,

    /// Layout test directory on the device
    #[arg(long, default_value = DEFAULT_REMOTE_TESTS_DIR)]
    pub remote_dir: String,

    /// Leave this subtree out of the sync (repeatable)
    #[arg(long = "exclude-prefix", value_name = "DIR")]
    pub exclude_prefix: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct OptionalTestTreeArgs {
    /// Host LayoutTests directory
    #[arg(long, env = "DRT_TESTS_DIR", required_unless_present = "no_sync")]
    pub tests_dir: Option<PathBuf>,

    /// Layout test directory on the device
    #[arg(long, default_value = DEFAULT_REMOTE_TESTS_DIR)]
    pub remote_dir: String,

    /// Leave this subtree out of the sync (repeatable)
    #[arg(long = "exclude-prefix", value_name = "DIR")]
    pub exclude_prefix: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    adb_version: String,
    device: DeviceRecord,
    runtime_installed: bool,
    activity: &'static str,
    baseline_dirs: Vec<String>,
    results_dir: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut env = EnvConfig::from_env();
    if let Some(serial) = &cli.serial {
        env.serial = Some(serial.clone());
    }
    if let Some(product) = &cli.product {
        env.target_product = Some(product.clone());
    }

    match &cli.command {
        Commands::Check { no_install, mode } => run_check(&cli, &env, *no_install, mode),
        Commands::Devices => {
            let (_bridge, device, _) = attach(&cli, &env)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&device)?);
            } else {
                println!("{}\t{}", device.serial, device.product);
            }
            Ok(())
        }
        Commands::Sync { tests, no_clock } => {
            env.require_android_env()?;
            let (bridge, _, _) = attach(&cli, &env)?;
            device::check_shell(&bridge)?;
            if !no_clock {
                sync::align_device_clock(&bridge).context("cannot set the device clock")?;
            }
            let report = run_sync(
                &bridge,
                &env,
                &tests.tests_dir,
                &tests.remote_dir,
                &tests.exclude_prefix,
            )?;
            print_sync_report(&report, cli.json)
        }
        Commands::Session {
            worker,
            timeout_secs,
            no_sync,
            tests,
            mode,
        } => {
            let options = mode.run_options(*no_sync);
            options.validate()?;
            let (bridge, _, _) = attach(&cli, &env)?;

            if !options.no_sync
                && let Some(tests_dir) = &tests.tests_dir
            {
                sync::align_device_clock(&bridge).context("cannot set the device clock")?;
                let report = run_sync(
                    &bridge,
                    &env,
                    tests_dir,
                    &tests.remote_dir,
                    &tests.exclude_prefix,
                )?;
                tracing::info!(
                    transferred = report.files_transferred,
                    considered = report.files_considered,
                    "layout tests synced"
                );
            }

            let config = SessionConfig::for_run(*worker, &options, &env);
            let session = RemoteProcessSession::new(bridge, config);
            run_session(session, Duration::from_secs(*timeout_secs))
        }
    }
}

/// Locate adb, verify its version and bind it to the target device.
fn attach(cli: &Cli, env: &EnvConfig) -> Result<(AdbBridge, DeviceRecord, String)> {
    let mut bridge = match &cli.adb {
        Some(path) => AdbBridge::new(path),
        None => AdbBridge::locate()?,
    };
    let version = bridge::check_adb_version(&bridge)?;
    tracing::debug!(%version, adb = %bridge.adb_path().display(), "adb ok");

    let device = device::ensure_target_device(
        &mut bridge,
        env.serial.as_deref(),
        env.target_product.as_deref(),
    )
    .context("cannot select a target device")?;
    Ok((bridge, device, version.to_string()))
}

fn run_check(cli: &Cli, env: &EnvConfig, no_install: bool, mode: &ModeArgs) -> Result<()> {
    env.require_android_env()?;
    let options = mode.run_options(false);
    options.validate()?;

    let (bridge, device, adb_version) = attach(cli, env)?;
    device::check_shell(&bridge)?;

    let runtime_installed = if no_install {
        false
    } else {
        let package = env.runtime_package_path()?;
        device::ensure_runtime_installed(&bridge, &package)
            .with_context(|| format!("cannot install {}", package.display()))?
    };

    let product = Some(device.product.as_str());
    let report = CheckReport {
        baseline_dirs: options.platform_dir_cascade(product),
        results_dir: options.results_dir_name(product),
        activity: options.activity(),
        adb_version,
        device,
        runtime_installed,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("adb        {}", report.adb_version);
        println!("device     {} ({})", report.device.serial, report.device.product);
        println!("activity   {}", report.activity);
        println!("baselines  {}", report.baseline_dirs.join(" -> "));
        println!("results    {}", report.results_dir);
        if report.runtime_installed {
            println!("runtime    installed");
        }
    }
    Ok(())
}

fn run_sync(
    bridge: &impl Bridge,
    env: &EnvConfig,
    tests_dir: &Path,
    remote_dir: &str,
    exclude_prefix: &[String],
) -> Result<SyncReport> {
    let helper = env.unpack_helper_path()?;
    let filter = PrefixFilter::new(exclude_prefix.iter().cloned());
    DeviceFileSync::new(bridge, helper)
        .sync_test_files(tests_dir, remote_dir, &filter)
        .with_context(|| format!("syncing {} to {remote_dir}", tests_dir.display()))
}

fn print_sync_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!(
            "{} of {} files pushed to {} ({} bytes, {} ms)",
            report.files_transferred,
            report.files_considered,
            report.remote_root,
            report.archive_bytes,
            report.duration_ms
        );
    }
    Ok(())
}

/// Feed stdin lines to the runtime and copy each response block to stdout.
///
/// A crashed or timed-out runtime is stopped and relaunched for the next
/// line.
fn run_session<B: Bridge>(mut session: RemoteProcessSession<B>, timeout: Duration) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line.context("reading test list from stdin")?;
        let test = line.trim();
        if test.is_empty() {
            continue;
        }

        let request = format!("{test}\n");
        let mut state = session.write(&request)?;
        if state.is_terminal() {
            session.stop()?;
            state = session.write(&request)?;
        }
        tracing::debug!(test, ?state, "sent");

        loop {
            let outcome = session.read_line(timeout);
            out.write_all(&outcome.data)?;
            if outcome.is_terminal() {
                let diagnostics = session.take_diagnostics();
                let diagnostics = String::from_utf8_lossy(&diagnostics);
                tracing::warn!(
                    test,
                    state = ?outcome.state,
                    diagnostics = %diagnostics.trim(),
                    "test runtime stopped responding"
                );
                session.stop()?;
                break;
            }
            if outcome.data == END_OF_BLOCK {
                break;
            }
        }
        out.flush()?;
    }

    session.stop()?;
    Ok(())
}

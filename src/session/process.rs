//! Lifecycle and framed I/O for one remote runtime instance.
//!
//! A session owns two forwarded unix sockets: the primary channel carries
//! commands in and test output out, the diagnostic channel carries the
//! runtime's error stream. Reads never fail because the runtime died or went
//! quiet; they return whatever was available together with the session state,
//! and callers treat a short read tagged [`SessionState::Crashed`] or
//! [`SessionState::TimedOut`] as the end of the current test.
//!
//! ```text
//! Unstarted -> Starting -> Running -> Stopping -> Unstarted
//!                             |
//!                             +-> Crashed | TimedOut
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use drt_device::session::{RemoteProcessSession, SessionConfig};
//!
//! let mut session = RemoteProcessSession::new(bridge, SessionConfig::new(0));
//! session.write("fast/dom/a.html\n")?;
//! let line = session.read_line(Duration::from_secs(30));
//! if line.state.is_terminal() {
//!     session.stop()?;
//! }
//! ```

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::mux::poll_readable;
use super::probe::{ProcessProbe, PsProbe};
use crate::bridge::{Bridge, BridgeError};
use crate::config::{ACTIVITY_HW, EnvConfig, RunOptions};

pub const PRIMARY_PORT_BASE: u32 = 50000;
pub const DIAGNOSTIC_PORT_BASE: u32 = 60000;

/// Prefix of a successful `am start` response.
const LAUNCH_OK_PREFIX: &str = "Starting: Intent";

const READ_CHUNK: usize = 4096;
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Crashed,
    TimedOut,
}

impl SessionState {
    /// Crashed and timed-out sessions need a stop/start cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::TimedOut)
    }
}

/// Bytes returned by a read and the state observed when it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub state: SessionState,
}

impl ReadOutcome {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start the test runtime: {0}")]
    LaunchFailed(String),

    #[error("Failed to shut down the test runtime (am exited with {code})")]
    ShutdownFailed { code: i32 },

    #[error("read_exact called with a non-positive size")]
    InvalidReadSize,

    #[error("Cannot connect to forwarded socket {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Write to the test runtime failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] BridgeError),
}

/// Settings for one worker's session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub worker: u32,
    /// Directory holding the `android-drt-<port>` forward sockets.
    pub socket_dir: PathBuf,
    pub activity: String,
    pub force_sw_pixel_tests: bool,
    pub force_single_surface_rendering: bool,
    /// Pause after killing a stale instance; the platform refuses to
    /// relaunch an activity right after its process was killed.
    pub kill_cooldown: Duration,
    /// Pause after launch before anything listens on the sockets.
    pub settle_delay: Duration,
    pub shutdown_grace: Duration,
    pub liveness_interval: Duration,
}

impl SessionConfig {
    pub fn new(worker: u32) -> Self {
        Self {
            worker,
            socket_dir: PathBuf::from(crate::config::DEFAULT_SOCKET_DIR),
            activity: ACTIVITY_HW.to_string(),
            force_sw_pixel_tests: false,
            force_single_surface_rendering: false,
            kill_cooldown: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(3),
            liveness_interval: Duration::from_secs(1),
        }
    }

    /// Session settings for `worker` under the given run options.
    pub fn for_run(worker: u32, options: &RunOptions, env: &EnvConfig) -> Self {
        Self {
            socket_dir: env.socket_dir.clone(),
            activity: options.activity().to_string(),
            force_sw_pixel_tests: options.force_sw_pixel_tests,
            force_single_surface_rendering: options.force_single_surface_rendering,
            ..Self::new(worker)
        }
    }

    pub fn primary_port(&self) -> u32 {
        PRIMARY_PORT_BASE + self.worker
    }

    pub fn diagnostic_port(&self) -> u32 {
        DIAGNOSTIC_PORT_BASE + self.worker
    }

    pub fn socket_path(&self, port: u32) -> PathBuf {
        self.socket_dir.join(format!("android-drt-{port}"))
    }

    fn launch_args(&self) -> Vec<String> {
        let primary = self.primary_port().to_string();
        let diagnostic = self.diagnostic_port().to_string();
        let mut args = vec![
            "am",
            "start",
            "-a",
            "android.intent.action.VIEW",
            "--ei",
            "outPort",
            primary.as_str(),
            "--ei",
            "errPort",
            diagnostic.as_str(),
        ];
        if self.force_sw_pixel_tests {
            args.extend(["--ez", "forceSWPixelTests", "true"]);
        }
        if self.force_single_surface_rendering {
            args.extend(["--ez", "forceSingleSurfaceRendering", "true"]);
        }
        args.extend(["-n", self.activity.as_str()]);
        args.into_iter().map(String::from).collect()
    }
}

struct Channel {
    stream: UnixStream,
    open: bool,
}

struct Channels {
    primary: Channel,
    diagnostic: Channel,
}

#[derive(Clone, Copy)]
enum Want {
    Line,
    Exact(usize),
}

impl Want {
    fn satisfied_len(self, buf: &[u8]) -> Option<usize> {
        match self {
            Want::Line => buf.iter().position(|&b| b == b'\n').map(|i| i + 1),
            Want::Exact(n) => (buf.len() >= n).then_some(n),
        }
    }
}

/// One remote runtime instance driven over forwarded sockets.
pub struct RemoteProcessSession<B: Bridge, P: ProcessProbe = PsProbe> {
    bridge: B,
    probe: P,
    config: SessionConfig,
    state: SessionState,
    channels: Option<Channels>,
    output: Vec<u8>,
    diagnostics: Vec<u8>,
    last_probe: Option<Instant>,
    probe_now: bool,
}

impl<B: Bridge> RemoteProcessSession<B, PsProbe> {
    pub fn new(bridge: B, config: SessionConfig) -> Self {
        Self::with_probe(bridge, PsProbe::default(), config)
    }
}

impl<B: Bridge, P: ProcessProbe> RemoteProcessSession<B, P> {
    pub fn with_probe(bridge: B, probe: P, config: SessionConfig) -> Self {
        Self {
            bridge,
            probe,
            config,
            state: SessionState::Unstarted,
            channels: None,
            output: Vec::new(),
            diagnostics: Vec::new(),
            last_probe: None,
            probe_now: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Drain what the runtime wrote to its diagnostic channel so far.
    pub fn take_diagnostics(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Launch the runtime and connect both channels.
    ///
    /// Any instance already running on the device is killed first. On failure
    /// the session is left `Unstarted`.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        self.reset();
        self.state = SessionState::Starting;
        match self.launch() {
            Ok(channels) => {
                self.channels = Some(channels);
                self.state = SessionState::Running;
                tracing::info!(
                    worker = self.config.worker,
                    port = self.config.primary_port(),
                    "test runtime session started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Unstarted;
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<Channels, ProcessError> {
        if self.kill_after_grace(Duration::ZERO)? {
            std::thread::sleep(self.config.kill_cooldown);
        }

        let primary_path = self.config.socket_path(self.config.primary_port());
        let diagnostic_path = self.config.socket_path(self.config.diagnostic_port());
        for (path, port, what) in [
            (&primary_path, self.config.primary_port(), "output"),
            (&diagnostic_path, self.config.diagnostic_port(), "error"),
        ] {
            let local = format!("local:{}", path.display());
            let code = self.bridge.forward(&local, &format!("tcp:{port}"))?;
            if code != 0 {
                return Err(ProcessError::LaunchFailed(format!(
                    "cannot forward {what} socket (adb exited with {code})"
                )));
            }
        }

        let args = self.config.launch_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let response = self.bridge.shell(&args)?;
        if !response.trim_start().starts_with(LAUNCH_OK_PREFIX) {
            return Err(ProcessError::LaunchFailed(format!(
                "unexpected launch response {:?}",
                response.trim()
            )));
        }

        std::thread::sleep(self.config.settle_delay);

        match self.probe.find_pid(&self.bridge) {
            Ok(Some(pid)) => tracing::debug!(pid, "test runtime is up"),
            Ok(None) => tracing::error!(
                activity = %self.config.activity,
                "test runtime process not found after launch"
            ),
            Err(e) => tracing::warn!(error = %e, "cannot query test runtime process"),
        }

        Ok(Channels {
            primary: connect(&primary_path)?,
            diagnostic: connect(&diagnostic_path)?,
        })
    }

    /// Send `text` on the primary channel, starting the session if needed.
    ///
    /// A session left `Stopping` by a failed shutdown is relaunched, which
    /// kills whatever is left of the old runtime. A crashed or timed-out
    /// session sends nothing; the returned state tells the caller why.
    pub fn write(&mut self, text: &str) -> Result<SessionState, ProcessError> {
        if matches!(self.state, SessionState::Unstarted | SessionState::Stopping) {
            self.start()?;
        }
        if self.state == SessionState::Running
            && let Some(channels) = self.channels.as_mut()
        {
            channels.primary.stream.write_all(text.as_bytes())?;
        }
        Ok(self.state)
    }

    /// Read exactly `size` bytes, or less if the session ends first.
    pub fn read_exact(&mut self, timeout: Duration, size: usize) -> Result<ReadOutcome, ProcessError> {
        if size == 0 {
            return Err(ProcessError::InvalidReadSize);
        }
        Ok(self.read_until(timeout, Want::Exact(size)))
    }

    /// Read through the next newline (included), or less if the session ends
    /// first. A session that is not running hands back what is already
    /// buffered without waiting.
    pub fn read_line(&mut self, timeout: Duration) -> ReadOutcome {
        self.read_until(timeout, Want::Line)
    }

    fn read_until(&mut self, timeout: Duration, want: Want) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state == SessionState::Running && self.channels.is_none() {
                self.terminate(SessionState::Crashed);
            }
            if self.state == SessionState::Running && self.liveness_due() && !self.remote_alive() {
                self.terminate(SessionState::Crashed);
            }
            if self.state == SessionState::Running && Instant::now() >= deadline {
                self.terminate(SessionState::TimedOut);
            }

            let satisfied = want.satisfied_len(&self.output);
            if satisfied.is_some() || self.state != SessionState::Running {
                let n = satisfied.unwrap_or(self.output.len());
                let data = self.output.drain(..n).collect();
                return ReadOutcome {
                    data,
                    state: self.state,
                };
            }

            self.wait_for_input(deadline);
        }
    }

    fn liveness_due(&self) -> bool {
        self.probe_now
            || self
                .last_probe
                .is_none_or(|last| last.elapsed() >= self.config.liveness_interval)
    }

    fn remote_alive(&mut self) -> bool {
        self.last_probe = Some(Instant::now());
        self.probe_now = false;
        match self.probe.find_pid(&self.bridge) {
            Ok(pid) => pid.is_some(),
            Err(e) => {
                tracing::debug!(error = %e, "liveness probe failed");
                true
            }
        }
    }

    fn terminate(&mut self, state: SessionState) {
        tracing::warn!(worker = self.config.worker, ?state, "test runtime session ended");
        self.state = state;
        self.channels = None;
    }

    /// Block until a channel has data, the deadline passes or the next
    /// liveness probe is due, then drain whatever arrived.
    fn wait_for_input(&mut self, deadline: Instant) {
        let Some(channels) = self.channels.as_mut() else {
            return;
        };

        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(self.config.liveness_interval.max(MIN_WAIT_SLICE));

        let mut open: Vec<(&mut Channel, &mut Vec<u8>)> = Vec::with_capacity(2);
        if channels.primary.open {
            open.push((&mut channels.primary, &mut self.output));
        }
        if channels.diagnostic.open {
            open.push((&mut channels.diagnostic, &mut self.diagnostics));
        }

        let fds: Vec<_> = open.iter().map(|(ch, _)| ch.stream.as_raw_fd()).collect();
        let ready = match poll_readable(&fds, wait) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::debug!(error = %e, "poll failed");
                return;
            }
        };

        let mut chunk = [0u8; READ_CHUNK];
        for ((channel, buf), ready) in open.into_iter().zip(ready) {
            if !ready {
                continue;
            }
            match channel.stream.read(&mut chunk) {
                Ok(0) => {
                    channel.open = false;
                    self.probe_now = true;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "channel read failed");
                    channel.open = false;
                    self.probe_now = true;
                }
            }
        }
    }

    /// Close the channels and shut the runtime down.
    ///
    /// Returns straight away when no runtime process is found. A runtime that
    /// ignores the shutdown request for the grace period is killed.
    pub fn stop(&mut self) -> Result<(), ProcessError> {
        self.state = SessionState::Stopping;
        self.channels = None;

        if self.probe.find_pid(&self.bridge)?.is_none() {
            self.reset();
            return Ok(());
        }

        let output = self.bridge.run(&[
            "shell",
            "am",
            "start",
            "-a",
            "android.intent.action.ACTION_SHUTDOWN",
            "-n",
            self.config.activity.as_str(),
        ])?;
        if !output.success() {
            return Err(ProcessError::ShutdownFailed {
                code: output.exit_code,
            });
        }

        if self.kill_after_grace(self.config.shutdown_grace)? {
            tracing::warn!(
                worker = self.config.worker,
                "test runtime did not exit in time and was killed"
            );
        }

        self.reset();
        Ok(())
    }

    /// Wait up to `grace` for the runtime to exit, then kill it. Returns
    /// whether a kill was issued.
    fn kill_after_grace(&self, grace: Duration) -> Result<bool, ProcessError> {
        let deadline = Instant::now() + grace;
        loop {
            let Some(pid) = self.probe.find_pid(&self.bridge)? else {
                return Ok(false);
            };
            let now = Instant::now();
            if now >= deadline {
                let pid = pid.to_string();
                self.bridge.shell(&["kill", "-s", "SIGKILL", pid.as_str()])?;
                return Ok(true);
            }
            std::thread::sleep(KILL_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Unstarted;
        self.channels = None;
        self.output.clear();
        self.diagnostics.clear();
        self.last_probe = None;
        self.probe_now = false;
    }
}

fn connect(path: &Path) -> Result<Channel, ProcessError> {
    let stream = UnixStream::connect(path).map_err(|source| ProcessError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Channel { stream, open: true })
}

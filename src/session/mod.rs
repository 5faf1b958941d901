//! Driving the on-device test runtime.
//!
//! [`RemoteProcessSession`] launches the runtime through the bridge, talks to
//! it over two forwarded sockets and reports crashes and timeouts as session
//! states. Liveness is answered by a [`ProcessProbe`]; [`PsProbe`] scans the
//! device process list.

pub mod mux;
pub mod probe;
pub mod process;

pub use probe::{ProcessProbe, PsProbe, RUNTIME_PROCESS_PREFIX, find_pid_in_ps};
pub use process::{
    DIAGNOSTIC_PORT_BASE, PRIMARY_PORT_BASE, ProcessError, ReadOutcome, RemoteProcessSession,
    SessionConfig, SessionState,
};

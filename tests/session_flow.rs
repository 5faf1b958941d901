use std::cell::Cell;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;
use std::time::Duration;

use drt_device::bridge::{Bridge, BridgeError, MockBridge};
use drt_device::session::{
    ProcessProbe, ReadOutcome, RemoteProcessSession, SessionConfig, SessionState,
};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct SharedPid(Rc<Cell<Option<u32>>>);

impl ProcessProbe for SharedPid {
    fn find_pid(&self, _bridge: &dyn Bridge) -> Result<Option<u32>, BridgeError> {
        Ok(self.0.get())
    }
}

struct Device {
    _dir: TempDir,
    config: SessionConfig,
    out: UnixListener,
    err: UnixListener,
}

impl Device {
    fn new(worker: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = SessionConfig::new(worker);
        config.socket_dir = dir.path().to_path_buf();
        config.kill_cooldown = Duration::ZERO;
        config.settle_delay = Duration::ZERO;
        config.shutdown_grace = Duration::ZERO;
        config.liveness_interval = Duration::from_millis(5);
        let out = UnixListener::bind(config.socket_path(config.primary_port())).unwrap();
        let err = UnixListener::bind(config.socket_path(config.diagnostic_port())).unwrap();
        Self {
            _dir: dir,
            config,
            out,
            err,
        }
    }

    fn accept(&self) -> (UnixStream, UnixStream) {
        (self.out.accept().unwrap().0, self.err.accept().unwrap().0)
    }
}

fn bridge() -> MockBridge {
    MockBridge::new().with(
        &["shell", "am", "start", "-a", "android.intent.action.VIEW"],
        "Starting: Intent { act=android.intent.action.VIEW }\n",
    )
}

fn read_block(
    session: &mut RemoteProcessSession<MockBridge, SharedPid>,
) -> (Vec<String>, SessionState) {
    let mut lines = Vec::new();
    loop {
        let ReadOutcome { data, state } = session.read_line(Duration::from_secs(5));
        let line = String::from_utf8(data).unwrap();
        if state.is_terminal() {
            return (lines, state);
        }
        let done = line == "#EOF\n";
        lines.push(line);
        if done {
            return (lines, state);
        }
    }
}

#[test]
fn runs_tests_and_recovers_from_a_crash() {
    let device = Device::new(1);
    let pid = SharedPid::default();
    let mut session =
        RemoteProcessSession::with_probe(bridge(), pid.clone(), device.config.clone());

    assert_eq!(
        session.write("fast/dom/a.html\n").unwrap(),
        SessionState::Running
    );
    pid.0.set(Some(900));
    let (mut out, _err) = device.accept();

    let mut request = [0u8; 16];
    out.read_exact(&mut request).unwrap();
    assert_eq!(&request, b"fast/dom/a.html\n");

    out.write_all(b"Content-Type: text/plain\nlayer tree\n#EOF\n")
        .unwrap();
    let (lines, state) = read_block(&mut session);
    assert_eq!(state, SessionState::Running);
    assert_eq!(
        lines,
        vec!["Content-Type: text/plain\n", "layer tree\n", "#EOF\n"]
    );

    // The runtime dies halfway through the next test.
    session.write("fast/dom/b.html\n").unwrap();
    out.write_all(b"Content-Type: text/plain\n").unwrap();
    let first = session.read_line(Duration::from_secs(5));
    assert_eq!(first.text(), "Content-Type: text/plain\n");
    pid.0.set(None);
    let (lines, state) = read_block(&mut session);
    assert!(lines.is_empty());
    assert_eq!(state, SessionState::Crashed);
    assert_eq!(session.state(), SessionState::Crashed);

    // Recycling: stop finds nothing to shut down, the next write relaunches.
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Unstarted);
    assert_eq!(
        session.write("fast/dom/c.html\n").unwrap(),
        SessionState::Running
    );
    pid.0.set(Some(901));
    let (mut out, _err) = device.accept();
    out.write_all(b"#EOF\n").unwrap();
    let (lines, state) = read_block(&mut session);
    assert_eq!(state, SessionState::Running);
    assert_eq!(lines, vec!["#EOF\n"]);

    let launches = session
        .bridge()
        .count(&["shell", "am", "start", "-a", "android.intent.action.VIEW"]);
    assert_eq!(launches, 2);
    assert_eq!(
        session
            .bridge()
            .count(&["shell", "am", "start", "-a", "android.intent.action.ACTION_SHUTDOWN"]),
        0
    );
}

#[test]
fn workers_use_disjoint_ports() {
    let a = Device::new(0);
    let b = Device::new(7);

    let mut first = RemoteProcessSession::with_probe(bridge(), SharedPid::default(), a.config.clone());
    let mut second = RemoteProcessSession::with_probe(bridge(), SharedPid::default(), b.config.clone());
    first.start().unwrap();
    second.start().unwrap();
    let _a = a.accept();
    let _b = b.accept();

    let forwards = |s: &RemoteProcessSession<MockBridge, SharedPid>| -> Vec<String> {
        s.bridge()
            .calls()
            .into_iter()
            .filter(|c| c[0] == "forward")
            .map(|c| c[2].clone())
            .collect()
    };
    assert_eq!(forwards(&first), vec!["tcp:50000", "tcp:60000"]);
    assert_eq!(forwards(&second), vec!["tcp:50007", "tcp:60007"]);
}

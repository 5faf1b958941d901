//! Scriptable bridge for tests.
//!
//! `MockBridge` records every invocation and answers from a table of canned
//! responses keyed by argument prefix. The longest matching prefix wins. A rule
//! with several responses hands them out in order and then keeps repeating the
//! last one, which is how tests model a device whose state changes over time
//! (a process list that loses an entry, for example). Unmatched commands
//! succeed with empty output.

use std::cell::RefCell;
use std::collections::VecDeque;

use super::{Bridge, BridgeError, CommandOutput};

struct Rule {
    prefix: Vec<String>,
    responses: RefCell<VecDeque<CommandOutput>>,
    unreachable: bool,
}

impl Rule {
    fn matches(&self, args: &[&str]) -> bool {
        self.prefix.len() <= args.len() && self.prefix.iter().zip(args).all(|(p, a)| p == a)
    }

    fn next(&self) -> CommandOutput {
        let mut responses = self.responses.borrow_mut();
        if responses.len() > 1 {
            responses.pop_front().unwrap_or_default()
        } else {
            responses.front().cloned().unwrap_or_default()
        }
    }
}

/// Test double that records calls and returns pre-configured outputs.
#[derive(Default)]
pub struct MockBridge {
    target: Option<String>,
    rules: Vec<Rule>,
    calls: RefCell<Vec<Vec<String>>>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `stdout` and exit code 0.
    pub fn with(self, prefix: &[&str], stdout: &str) -> Self {
        self.with_outputs(prefix, vec![CommandOutput::ok(stdout)])
    }

    /// Answer commands starting with `prefix` with a bare exit code.
    pub fn with_exit(self, prefix: &[&str], exit_code: i32) -> Self {
        self.with_outputs(prefix, vec![CommandOutput::failed(exit_code)])
    }

    /// Answer commands starting with `prefix` with `outputs`, one per call.
    pub fn with_outputs(mut self, prefix: &[&str], outputs: Vec<CommandOutput>) -> Self {
        self.rules.push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            responses: RefCell::new(outputs.into()),
            unreachable: false,
        });
        self
    }

    /// Fail commands starting with `prefix` as if adb itself could not run.
    pub fn with_transport_error(mut self, prefix: &[&str]) -> Self {
        self.rules.push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            responses: RefCell::default(),
            unreachable: true,
        });
        self
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// Invocations joined with single spaces, for compact assertions.
    pub fn joined_calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.join(" ")).collect()
    }

    /// Number of invocations starting with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.len() >= prefix.len() && c.iter().zip(prefix).all(|(a, p)| a == p))
            .count()
    }
}

impl Bridge for MockBridge {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, BridgeError> {
        self.calls
            .borrow_mut()
            .push(args.iter().map(|s| s.to_string()).collect());

        let Some(rule) = self
            .rules
            .iter()
            .filter(|r| r.matches(args))
            .max_by_key(|r| r.prefix.len())
        else {
            return Ok(CommandOutput::default());
        };
        if rule.unreachable {
            return Err(BridgeError::Spawn {
                command: super::render_command(args),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device offline"),
            });
        }
        Ok(rule.next())
    }

    fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn set_target(&mut self, serial: &str) {
        self.target = Some(serial.to_string());
    }
}

//! Scripted stand-ins for the host collaborators
//!
//! [`MockRunner`] records every command it is asked to run and answers from
//! a list of substring rules. Unmatched commands succeed with empty output.

use std::sync::Mutex;

use async_trait::async_trait;
use vxtun_common::{CommandRunner, ExecResult, HostIdentity, TunnelResult};

use crate::verification::CommandVerifier;

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    result: ExecResult,
    once: bool,
}

/// Recording command runner with scripted responses
#[derive(Debug, Default)]
pub struct MockRunner {
    commands: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
}

impl MockRunner {
    /// Create a runner where every command succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command containing `pattern` with `result`
    ///
    /// Later rules take priority over earlier ones.
    pub fn respond(&self, pattern: impl Into<String>, result: ExecResult) -> &Self {
        self.push_rule(pattern.into(), result, false);
        self
    }

    /// Answer the next command containing `pattern` with `result`, then forget the rule
    pub fn respond_once(&self, pattern: impl Into<String>, result: ExecResult) -> &Self {
        self.push_rule(pattern.into(), result, true);
        self
    }

    /// Make every command containing `pattern` exit 1 with `stderr`
    pub fn fail(&self, pattern: impl Into<String>, stderr: impl Into<String>) -> &Self {
        self.respond(pattern, ExecResult::failed(1, stderr))
    }

    /// Make the next command containing `pattern` exit 1 with `stderr`
    pub fn fail_once(&self, pattern: impl Into<String>, stderr: impl Into<String>) -> &Self {
        self.respond_once(pattern, ExecResult::failed(1, stderr))
    }

    /// All commands seen so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("mock runner poisoned").clone()
    }

    /// Forget recorded commands (rules are kept)
    pub fn clear_commands(&self) {
        self.commands.lock().expect("mock runner poisoned").clear();
    }

    /// Snapshot recorded commands into a verifier
    pub fn verifier(&self) -> CommandVerifier {
        CommandVerifier::new(self.commands())
    }

    fn push_rule(&self, pattern: String, result: ExecResult, once: bool) {
        self.rules
            .lock()
            .expect("mock runner poisoned")
            .push(Rule {
                pattern,
                result,
                once,
            });
    }

    fn answer(&self, cmd: &str) -> ExecResult {
        let mut rules = self.rules.lock().expect("mock runner poisoned");

        // One-shot rules are consumed in the order they were added
        if let Some(pos) = rules
            .iter()
            .position(|r| r.once && cmd.contains(&r.pattern))
        {
            return rules.remove(pos).result;
        }

        rules
            .iter()
            .rev()
            .find(|r| !r.once && cmd.contains(&r.pattern))
            .map(|r| r.result.clone())
            .unwrap_or_else(|| ExecResult::ok(""))
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &str) -> TunnelResult<ExecResult> {
        self.commands
            .lock()
            .expect("mock runner poisoned")
            .push(cmd.to_string());
        Ok(self.answer(cmd))
    }
}

/// Host identity with fixed answers
#[derive(Debug, Clone)]
pub struct FakeHost {
    platform: String,
    privileged: bool,
}

impl FakeHost {
    /// Linux host running as root
    pub fn linux_root() -> Self {
        Self::new("linux", true)
    }

    /// Linux host running as an ordinary user
    pub fn linux_user() -> Self {
        Self::new("linux", false)
    }

    /// Arbitrary platform and privilege
    pub fn new(platform: impl Into<String>, privileged: bool) -> Self {
        Self {
            platform: platform.into(),
            privileged,
        }
    }
}

#[async_trait]
impl HostIdentity for FakeHost {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn is_privileged(&self) -> TunnelResult<bool> {
        Ok(self.privileged)
    }
}

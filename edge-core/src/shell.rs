//! Shell-command executor.
//!
//! Every interaction with the host (nmcli, bluetoothctl, hciconfig,
//! iptables, dnsmasq, ...) goes through the [`CommandRunner`] trait, so
//! the host boundary can be substituted wholesale in tests.

use async_trait::async_trait;
use tokio::process::Command;

use crate::Result;

/// PATH handed to every child so the daemon behaves the same under
/// systemd, cron and an interactive shell.
pub const SHELL_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Captured outcome of one shell line. Non-zero exit is not an error at
/// this layer; the caller decides what a failure means.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn err(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a single bash command line and capture its outcome.
    async fn run(&self, line: &str) -> Result<CmdOutput>;
}

/// Production runner: `bash -c <line>` with the pinned PATH.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, line: &str) -> Result<CmdOutput> {
        tracing::trace!(cmd = line, "exec");
        let output = Command::new("bash")
            .arg("-c")
            .arg(line)
            .env("PATH", SHELL_PATH)
            .output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

/// Quote one argument for embedding in a bash line. SSIDs and passphrases
/// are attacker-supplied on the provisioning channel.
pub fn sh_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Scripted runner for tests: pattern-matched canned replies plus a full
/// history of every line it was asked to run.
pub mod script {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{CmdOutput, CommandRunner};
    use crate::Result;

    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<(String, CmdOutput)>>,
        history: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commands containing `pattern` get `reply`; first match wins.
        pub fn on(&self, pattern: &str, reply: CmdOutput) {
            self.rules
                .lock()
                .unwrap()
                .push((pattern.to_string(), reply));
        }

        pub fn history(&self) -> Vec<String> {
            self.history.lock().unwrap().clone()
        }

        pub fn ran(&self, pattern: &str) -> bool {
            self.history
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains(pattern))
        }

        pub fn count(&self, pattern: &str) -> usize {
            self.history
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.contains(pattern))
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, line: &str) -> Result<CmdOutput> {
            self.history.lock().unwrap().push(line.to_string());
            let rules = self.rules.lock().unwrap();
            for (pattern, reply) in rules.iter() {
                if line.contains(pattern.as_str()) {
                    return Ok(reply.clone());
                }
            }
            // Unscripted commands succeed silently, so tests only script
            // the commands they care about.
            Ok(CmdOutput::ok(""))
        }
    }
}

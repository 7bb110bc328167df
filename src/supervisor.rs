//! Process supervisor for the control-channel restart contract.
//!
//! Restart is never attempted in-process: when an instance receives a
//! `restart` command it exits with
//! [`EXIT_CODE_RESTART`](trellis_core::constants::EXIT_CODE_RESTART) and
//! this supervisor relaunches it. Any other exit ends supervision.
//! Relaunch delays follow the shared backoff policy so a crash-looping
//! service does not spin.

use std::process::ExitStatus;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use tokio::process::Command;
use tracing::info;
use tracing::warn;

use trellis_bus::Backoff;
use trellis_core::constants::EXIT_CODE_RESTART;

/// A run that outlives this duration is considered healthy and resets
/// the relaunch backoff.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The child exited normally (code 0, the `stop` contract).
    Stopped,
    /// The child exited with an unexpected code.
    Failed(i32),
    /// The child was killed by a signal.
    Killed,
}

/// Supervises one service process.
pub struct Supervisor {
    program: String,
    args: Vec<String>,
    backoff: Backoff,
}

impl Supervisor {
    /// Supervise `program` with `args`, using the default relaunch
    /// backoff (2 s initial, 30 s ceiling).
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            backoff: Backoff::reconnect(),
        }
    }

    /// Run the child until it exits with anything other than the
    /// restart code.
    pub async fn run(mut self) -> anyhow::Result<ExitReason> {
        loop {
            info!(program = %self.program, "launching supervised process");
            let launched_at = Instant::now();

            let status = Command::new(&self.program)
                .args(&self.args)
                .status()
                .await
                .with_context(|| format!("spawn {}", self.program))?;

            match classify(status) {
                Some(reason) => {
                    info!(program = %self.program, ?reason, "supervision ended");
                    return Ok(reason);
                }
                None => {
                    if launched_at.elapsed() >= HEALTHY_RUN {
                        self.backoff.reset();
                    }
                    let delay = self.backoff.next_delay();
                    warn!(
                        program = %self.program,
                        delay_secs = delay.as_secs(),
                        "restart requested, relaunching"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// `None` means relaunch; `Some` ends supervision.
fn classify(status: ExitStatus) -> Option<ExitReason> {
    match status.code() {
        Some(code) if code == EXIT_CODE_RESTART => None,
        Some(0) => Some(ExitReason::Stopped),
        Some(code) => Some(ExitReason::Failed(code)),
        None => Some(ExitReason::Killed),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn classify_exit_codes() {
        assert_eq!(classify(ExitStatus::from_raw(0)), Some(ExitReason::Stopped));
        // from_raw takes a wait status; exit codes live in the high byte.
        assert_eq!(classify(ExitStatus::from_raw(99 << 8)), None);
        assert_eq!(classify(ExitStatus::from_raw(1 << 8)), Some(ExitReason::Failed(1)));
        // Terminated by SIGKILL.
        assert_eq!(classify(ExitStatus::from_raw(9)), Some(ExitReason::Killed));
    }

    #[tokio::test]
    async fn relaunches_once_on_restart_code() {
        // First run exits 99 (restart requested), second run exits 0:
        // the script flips on a marker file.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("restarted");
        let script = format!(
            "if [ -e {marker} ]; then exit 0; else touch {marker}; exit 99; fi",
            marker = marker.display()
        );

        let supervisor = Supervisor {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(10)),
        };

        let reason = supervisor.run().await.unwrap();
        assert_eq!(reason, ExitReason::Stopped);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn unexpected_exit_code_ends_supervision() {
        let supervisor = Supervisor {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 7".to_string()],
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(10)),
        };

        let reason = supervisor.run().await.unwrap();
        assert_eq!(reason, ExitReason::Failed(7));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let supervisor = Supervisor::new("/definitely/not/a/real/binary", vec![]);
        assert!(supervisor.run().await.is_err());
    }
}

//! External bandwidth workload.
//!
//! The workload is opaque: run it, and it prints one line starting with a
//! fixed marker followed by a throughput number. That line is the whole
//! contract.
//!
//! Every instance leads its own process group, so whatever it forks is
//! killed along with it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use regex::Regex;
use rustix::process::{Pid, Signal, kill_process_group};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::models::{ContendError, Result, WorkloadConfig};

/// How one workload run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Exited on its own; `throughput` is `None` if no labeled value was found
    Completed {
        status: ExitStatus,
        throughput: Option<f64>,
    },
    /// Deadline reached first; the child was killed and reaped
    TimedOut,
}

/// A runnable workload description.
#[derive(Debug, Clone)]
pub struct Workload {
    program: PathBuf,
    args: Vec<String>,
    pattern: Regex,
}

impl Workload {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, marker: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(
            r"(?m)^\s*{}\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)",
            regex::escape(marker)
        ))
        .map_err(|e| ContendError::InvalidInput(format!("workload marker {marker:?}: {e}")))?;

        Ok(Self {
            program: program.into(),
            args,
            pattern,
        })
    }

    pub fn from_config(config: &WorkloadConfig) -> Result<Self> {
        Self::new(&config.program, config.args.clone(), &config.marker)
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Extract the throughput from the workload's output.
    ///
    /// The last labeled line wins. Non-positive or non-finite values count
    /// as absent.
    pub fn parse_throughput(&self, output: &str) -> Option<f64> {
        self.pattern
            .captures_iter(output)
            .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
            .last()
            .filter(|v| v.is_finite() && *v > 0.0)
    }

    fn command(&self, capture: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd
    }

    /// Start an instance whose output is discarded (stressor use).
    pub fn spawn_silent(&self) -> Result<Child> {
        self.command(false).spawn().map_err(|e| ContendError::Spawn {
            program: self.program.clone(),
            source: e,
        })
    }

    /// Run one instance to completion, bounded by `budget`.
    ///
    /// On timeout the child's group is killed and reaped before returning.
    /// Once the child exits, leftover descendants are killed so they cannot
    /// hold the output pipes open.
    pub async fn run_once(&self, budget: Duration) -> Result<RunOutcome> {
        let mut child = self.command(true).spawn().map_err(|e| ContendError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;
        let group = child.id();
        trace!(pid = group, "workload started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let mut out = String::new();
            let mut err = String::new();
            let read_out = async {
                if let Some(s) = stdout.as_mut() {
                    let _ = s.read_to_string(&mut out).await;
                }
            };
            let read_err = async {
                if let Some(s) = stderr.as_mut() {
                    let _ = s.read_to_string(&mut err).await;
                }
            };
            let wait = async {
                let status = child.wait().await;
                kill_group(group);
                status
            };
            let (status, _, _) = tokio::join!(wait, read_out, read_err);
            (status, out, err)
        };

        let outcome = tokio::time::timeout(budget, run).await;
        match outcome {
            Ok((status, out, err)) => {
                let status = status.map_err(|e| ContendError::io("waiting for workload", e))?;
                let throughput = self
                    .parse_throughput(&out)
                    .or_else(|| self.parse_throughput(&err));
                if throughput.is_none() {
                    debug!(status = %status, "Workload output had no usable throughput");
                }
                Ok(RunOutcome::Completed { status, throughput })
            }
            Err(_) => {
                reap(&mut child).await;
                Ok(RunOutcome::TimedOut)
            }
        }
    }
}

/// SIGKILL every process in the group led by `leader`.
///
/// A group with no members left is not an error.
pub(crate) fn kill_group(leader: Option<u32>) {
    let Some(pid) = leader
        .and_then(|id| i32::try_from(id).ok())
        .and_then(Pid::from_raw)
    else {
        return;
    };
    match kill_process_group(pid, Signal::Kill) {
        Ok(()) => trace!(pgid = leader, "workload group killed"),
        Err(rustix::io::Errno::SRCH) => {}
        Err(e) => debug!(error = %e, "Failed to kill workload group"),
    }
}

/// Kill `child` and its process group if still running, then collect its
/// exit status.
pub(crate) async fn reap(child: &mut Child) {
    kill_group(child.id());
    if let Err(e) = child.start_kill() {
        trace!(error = %e, "kill on exited child");
    }
    if let Err(e) = child.wait().await {
        debug!(error = %e, "Failed to reap workload");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Workload {
        Workload::new("/bin/sh", vec!["-c".into(), script.into()], "Copy:").unwrap()
    }

    #[test]
    fn test_parse_labeled_value() {
        let w = sh("");
        let out = "STREAM version\nFunction    Best Rate MB/s\nCopy:   12345.6   0.01\nScale:  9999.0\n";
        assert_eq!(w.parse_throughput(out), Some(12345.6));
    }

    #[test]
    fn test_parse_last_line_wins() {
        let w = sh("");
        assert_eq!(w.parse_throughput("Copy: 100\nCopy:\t250.5\n"), Some(250.5));
    }

    #[test]
    fn test_parse_absent_or_malformed() {
        let w = sh("");
        assert_eq!(w.parse_throughput(""), None);
        assert_eq!(w.parse_throughput("Copy: n/a\n"), None);
        assert_eq!(w.parse_throughput("Copy: 0\n"), None);
        assert_eq!(w.parse_throughput("Copy: -5\n"), None);
        assert_eq!(w.parse_throughput("Scale: 100\n"), None);
    }

    #[test]
    fn test_marker_is_escaped() {
        let w = Workload::new("/bin/true", vec![], "Rate (MB/s):").unwrap();
        assert_eq!(w.parse_throughput("Rate (MB/s): 42\n"), Some(42.0));
    }

    #[tokio::test]
    async fn test_run_once_captures_throughput() {
        let w = sh("echo 'Copy:  1500.25'");
        match w.run_once(Duration::from_secs(5)).await.unwrap() {
            RunOutcome::Completed { status, throughput } => {
                assert!(status.success());
                assert_eq!(throughput, Some(1500.25));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_once_reads_stderr_too() {
        let w = sh("echo 'Copy: 77' 1>&2");
        match w.run_once(Duration::from_secs(5)).await.unwrap() {
            RunOutcome::Completed { throughput, .. } => assert_eq!(throughput, Some(77.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_crashed_run_is_no_sample() {
        let w = sh("exit 3");
        match w.run_once(Duration::from_secs(5)).await.unwrap() {
            RunOutcome::Completed { status, throughput } => {
                assert!(!status.success());
                assert_eq!(throughput, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_once_kills_at_deadline() {
        let w = sh("sleep 5; echo 'Copy: 1'");
        let started = std::time::Instant::now();
        let outcome = w.run_once(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_background_descendant_does_not_block_completion() {
        let w = sh("sleep 5 & echo 'Copy: 42'");
        let started = std::time::Instant::now();
        match w.run_once(Duration::from_secs(3)).await.unwrap() {
            RunOutcome::Completed { throughput, .. } => assert_eq!(throughput, Some(42.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_deadline_kills_descendants() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("descendant.pid");
        let w = sh(&format!("sleep 30 & echo $! > {}; wait", pidfile.display()));
        let outcome = w.run_once(Duration::from_millis(300)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        assert!(
            testing::exits_soon(pid.trim()).await,
            "descendant {} survived the deadline",
            pid.trim()
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let w = Workload::new("/nonexistent/simple_stream", vec![], "Copy:").unwrap();
        let err = w.run_once(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ContendError::Spawn { .. }));
        assert!(!err.is_fatal());
    }
}

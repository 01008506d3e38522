//! Liveness supervision of the agent process
//!
//! The agent rewrites its resume marker on every discovery tick. The
//! watchdog runs the agent as a child process and restarts it when the
//! marker's modification time stops advancing.

use crate::marker;
use crate::observability::StructuredLogger;
use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, SystemTime};
use tokio::process::{Child, Command};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub marker_path: PathBuf,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Restart once the marker has not advanced for this long
    pub stall_timeout: Duration,
    pub check_interval: Duration,
    /// Wait after each of SIGINT and SIGTERM before escalating
    pub grace: Duration,
    /// Pause between a run ending and the next one starting
    pub cooldown: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            marker_path: PathBuf::from("/srv/events/since"),
            command: vec!["container-tail".to_string()],
            stall_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
            grace: Duration::from_secs(10),
            cooldown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Time since the last observed progress
    Healthy(Duration),
    Stalled(Duration),
}

/// Decides whether the marker is still advancing
#[derive(Debug, Clone)]
pub struct StallDetector {
    timeout: Duration,
    last_mtime: Option<SystemTime>,
    last_progress: Instant,
}

impl StallDetector {
    /// `initial` is the marker's mtime when the run started; only later
    /// modifications count as progress.
    pub fn new(initial: Option<SystemTime>, started: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            last_mtime: initial,
            last_progress: started,
        }
    }

    pub fn observe(&mut self, mtime: Option<SystemTime>, now: Instant) -> Liveness {
        if let Some(mtime) = mtime {
            if self.last_mtime.map_or(true, |last| mtime > last) {
                self.last_mtime = Some(mtime);
                self.last_progress = now;
            }
        }

        let idle = now.saturating_duration_since(self.last_progress);
        if idle >= self.timeout {
            Liveness::Stalled(idle)
        } else {
            Liveness::Healthy(idle)
        }
    }
}

/// How a supervised run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// The agent exited on its own
    Exited(ExitStatus),
    /// The agent stopped making progress and was stopped
    Stalled { idle: Duration, status: ExitStatus },
}

pub struct Watchdog {
    config: WatchdogConfig,
    logger: StructuredLogger,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, logger: StructuredLogger) -> Self {
        Self { config, logger }
    }

    /// Supervise the agent forever, restarting it after every exit.
    pub async fn run(&self) -> Result<()> {
        loop {
            if let Err(e) = marker::ensure_exists(&self.config.marker_path) {
                warn!(error = %e, "Failed to create resume marker");
            }

            match self.run_once().await {
                Ok(RunOutcome::Exited(status)) => {
                    warn!(status = %status, "Agent exited");
                }
                Ok(RunOutcome::Stalled { idle, status }) => {
                    info!(
                        idle_secs = idle.as_secs(),
                        status = %status,
                        "Stalled agent stopped"
                    );
                }
                Err(e) => error!(error = %e, "Failed to supervise agent"),
            }

            info!(
                cooldown_secs = self.config.cooldown.as_secs(),
                "Restarting agent after cooldown"
            );
            sleep(self.config.cooldown).await;
        }
    }

    /// Start the agent and watch it until it exits or stalls.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .context("Agent command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start `{program}`"))?;
        info!(pid = ?child.id(), command = %self.config.command.join(" "), "Agent started");

        let mut detector = StallDetector::new(
            marker::modified(&self.config.marker_path).ok(),
            Instant::now(),
            self.config.stall_timeout,
        );
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("Failed to wait for agent")?;
                    return Ok(RunOutcome::Exited(status));
                }
                _ = ticker.tick() => {
                    let mtime = marker::modified(&self.config.marker_path).ok();
                    if let Liveness::Stalled(idle) = detector.observe(mtime, Instant::now()) {
                        self.logger.log_stall(idle.as_secs(), child.id());
                        let status = self.escalate(&mut child).await?;
                        return Ok(RunOutcome::Stalled { idle, status });
                    }
                }
            }
        }
    }

    /// SIGINT, then SIGTERM, each followed by a grace period, then SIGKILL.
    async fn escalate(&self, child: &mut Child) -> Result<ExitStatus> {
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            if let Some(pid) = child.id() {
                info!(pid, signal = ?signal, "Signalling agent");
                if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
                    warn!(pid, signal = ?signal, error = %e, "Failed to signal agent");
                }
            }
            if let Ok(status) = timeout(self.config.grace, child.wait()).await {
                return status.context("Failed to wait for agent");
            }
        }

        warn!(pid = ?child.id(), "Agent ignored SIGINT and SIGTERM, killing it");
        child.kill().await.context("Failed to kill agent")?;
        child.wait().await.context("Failed to wait for agent")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::TempDir;

    fn config(dir: &TempDir, script: &str) -> WatchdogConfig {
        WatchdogConfig {
            marker_path: dir.path().join("since"),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            stall_timeout: Duration::from_millis(300),
            check_interval: Duration::from_millis(50),
            grace: Duration::from_millis(200),
            cooldown: Duration::from_millis(10),
        }
    }

    fn watchdog(config: WatchdogConfig) -> Watchdog {
        marker::ensure_exists(&config.marker_path).unwrap();
        Watchdog::new(config, StructuredLogger::new("test-host"))
    }

    #[test]
    fn test_detector_tracks_progress() {
        let start = Instant::now();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let mut detector = StallDetector::new(Some(t0), start, Duration::from_secs(30));

        assert_eq!(
            detector.observe(Some(t0), start + Duration::from_secs(10)),
            Liveness::Healthy(Duration::from_secs(10))
        );
        // Advance at 20s resets the idle clock
        let t1 = t0 + Duration::from_secs(20);
        assert_eq!(
            detector.observe(Some(t1), start + Duration::from_secs(20)),
            Liveness::Healthy(Duration::ZERO)
        );
        assert_eq!(
            detector.observe(Some(t1), start + Duration::from_secs(45)),
            Liveness::Healthy(Duration::from_secs(25))
        );
        assert_eq!(
            detector.observe(Some(t1), start + Duration::from_secs(50)),
            Liveness::Stalled(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_detector_counts_from_start_without_marker() {
        let start = Instant::now();
        let mut detector = StallDetector::new(None, start, Duration::from_secs(30));
        assert_eq!(
            detector.observe(None, start + Duration::from_secs(31)),
            Liveness::Stalled(Duration::from_secs(31))
        );

        // A marker appearing counts as progress
        let mut detector = StallDetector::new(None, start, Duration::from_secs(30));
        assert_eq!(
            detector.observe(Some(SystemTime::now()), start + Duration::from_secs(31)),
            Liveness::Healthy(Duration::ZERO)
        );
    }

    #[test]
    fn test_older_mtime_is_not_progress() {
        let start = Instant::now();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let mut detector = StallDetector::new(Some(t0), start, Duration::from_secs(5));
        assert!(matches!(
            detector.observe(Some(t0 - Duration::from_secs(1)), start + Duration::from_secs(6)),
            Liveness::Stalled(_)
        ));
    }

    #[tokio::test]
    async fn test_agent_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let outcome = watchdog(config(&dir, "exit 3")).run_once().await.unwrap();
        match outcome {
            RunOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_agent_is_interrupted() {
        let dir = TempDir::new().unwrap();
        let outcome = watchdog(config(&dir, "exec sleep 30")).run_once().await.unwrap();
        match outcome {
            RunOutcome::Stalled { idle, status } => {
                assert!(idle >= Duration::from_millis(300));
                // SIGINT may be inherited as ignored when tests run in the background
                let signal = status.signal();
                assert!(
                    signal == Some(Signal::SIGINT as i32) || signal == Some(Signal::SIGTERM as i32),
                    "unexpected status: {status}"
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stubborn_agent_is_killed() {
        let dir = TempDir::new().unwrap();
        let outcome = watchdog(config(&dir, "trap '' INT TERM; exec sleep 30"))
            .run_once()
            .await
            .unwrap();
        match outcome {
            RunOutcome::Stalled { status, .. } => {
                assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progressing_agent_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("since");
        let script = format!(
            "for i in 1 2 3 4 5 6 7 8; do echo $i > '{}'; sleep 0.1; done",
            marker.display()
        );
        let outcome = watchdog(config(&dir, &script)).run_once().await.unwrap();
        match outcome {
            RunOutcome::Exited(status) => assert!(status.success()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "");
        config.command.clear();
        assert!(watchdog(config).run_once().await.is_err());
    }
}

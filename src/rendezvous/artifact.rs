//! Start-time artifact shared through the filesystem.
//!
//! - The modulator publishes `start = now + lead` atomically (write-then-rename)
//! - The sensor polls at a fixed interval until the record parses
//! - The artifact is removed when the modulator's guard drops

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::models::{ContendError, RendezvousConfig, Result};
use crate::timebase::{Clock, Epoch};

/// Artifact-based rendezvous.
#[derive(Debug, Clone)]
pub struct ArtifactRendezvous {
    /// Well-known artifact location
    path: PathBuf,
    /// Lead between publishing and slot 0
    lead: Duration,
    /// Interval between polls while waiting
    poll_interval: Duration,
    /// Optional bound on waiting
    timeout: Option<Duration>,
}

impl ArtifactRendezvous {
    pub fn new(path: impl Into<PathBuf>, lead: Duration, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            lead,
            poll_interval,
            timeout: None,
        }
    }

    pub fn from_config(config: &RendezvousConfig) -> Self {
        Self {
            path: config.path.clone(),
            lead: Duration::from_millis(config.lead_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Give up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compute and persist the session start time.
    ///
    /// The returned guard removes the artifact when dropped.
    pub fn publish<C: Clock>(&self, clock: &C) -> Result<(Epoch, ArtifactGuard)> {
        let start = clock.now() + self.lead;
        write_atomic(&self.path, start)?;
        info!(
            path = %self.path.display(),
            start = %start,
            lead_ms = self.lead.as_millis() as u64,
            "Published start time"
        );
        Ok((
            start,
            ArtifactGuard {
                path: self.path.clone(),
                armed: true,
            },
        ))
    }

    /// Poll until the artifact is present and readable, then return its start.
    pub async fn wait<C: Clock>(&self, clock: &C) -> Result<Epoch> {
        info!(path = %self.path.display(), "Waiting for start-time artifact");
        let began = tokio::time::Instant::now();
        let mut polls: u64 = 0;

        loop {
            match read_start(&self.path) {
                Ok(Some(start)) => {
                    let now = clock.now();
                    info!(start = %start, now = %now, polls, "Start time acquired");
                    if start <= now {
                        warn!(
                            late_by = now.secs_since(start),
                            "Start time already passed; early slots will be erasures"
                        );
                    }
                    return Ok(start);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Artifact not readable yet"),
            }

            if let Some(limit) = self.timeout {
                if began.elapsed() >= limit {
                    return Err(ContendError::RendezvousTimeout(limit));
                }
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Owns the published artifact; removes it on drop.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
    armed: bool,
}

impl ArtifactGuard {
    /// Remove the artifact now, reporting failures.
    pub fn remove(mut self) -> Result<()> {
        self.armed = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ContendError::io("removing start-time artifact", e)),
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove artifact");
                }
            }
        }
    }
}

/// Write `start` to `path` via a temporary file in the same directory.
fn write_atomic(path: &Path, start: Epoch) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file =
        File::create(&temp).map_err(|e| ContendError::io("creating temp artifact", e))?;
    writeln!(file, "{:.6}", start.as_secs())
        .map_err(|e| ContendError::io("writing temp artifact", e))?;
    file.sync_all()
        .map_err(|e| ContendError::io("syncing temp artifact", e))?;

    fs::rename(&temp, path).map_err(|e| ContendError::io("renaming artifact", e))?;
    Ok(())
}

/// Read the start time; `Ok(None)` while the artifact is absent or incomplete.
fn read_start(path: &Path) -> Result<Option<Epoch>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ContendError::io("reading start-time artifact", e)),
    };
    match content.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() => Ok(Some(Epoch::from_secs(secs))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timebase::ManualClock;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_then_wait_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("covert_start");
        let clock = ManualClock::new(Epoch::from_secs(1000.0));
        let rdv = ArtifactRendezvous::new(&path, Duration::from_secs(2), Duration::from_millis(5));

        let (start, guard) = rdv.publish(&clock).unwrap();
        assert_eq!(start, Epoch::from_secs(1002.0));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1002.000000\n");

        let seen = rdv.wait(&clock).await.unwrap();
        assert!((seen.as_secs() - 1002.0).abs() < 1e-6);

        guard.remove().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_wait_polls_until_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("covert_start");
        let clock = ManualClock::new(Epoch::from_secs(50.0));
        let rdv = ArtifactRendezvous::new(&path, Duration::from_secs(2), Duration::from_millis(5));

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            // Partial content first: must be treated as absent.
            fs::write(&writer_path, "").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            fs::write(&writer_path, "77.250000\n").unwrap();
        });

        let start = rdv.wait(&clock).await.unwrap();
        writer.await.unwrap();
        assert!((start.as_secs() - 77.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_wait_times_out_when_configured() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Epoch::from_secs(0.0));
        let rdv = ArtifactRendezvous::new(
            dir.path().join("never"),
            Duration::from_secs(2),
            Duration::from_millis(5),
        )
        .with_timeout(Duration::from_millis(30));

        let err = rdv.wait(&clock).await.unwrap_err();
        assert!(matches!(err, ContendError::RendezvousTimeout(_)));
    }

    #[test]
    fn test_guard_drop_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("covert_start");
        let clock = ManualClock::new(Epoch::from_secs(0.0));
        let rdv = ArtifactRendezvous::new(&path, Duration::from_secs(1), Duration::from_millis(5));
        {
            let (_start, _guard) = rdv.publish(&clock).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use zonewatch::config::RecordingConfig;
use zonewatch::process::StopOutcome;
use zonewatch::recording::RecordingState;
use zonewatch::{PipelineError, RecordingStatus, RecordingSupervisor};

const URL: &str = "rtsp://10.0.0.8:554/live";

fn fake_recorder(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join("fake-recorder");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn supervisor(dir: &TempDir, recorder: PathBuf) -> RecordingSupervisor {
    RecordingSupervisor::new(RecordingConfig {
        save_path: dir.path().join("recordings"),
        segment: Duration::from_secs(60),
        ffmpeg_bin: recorder,
        auto_start: false,
    })
    .with_timeouts(Duration::from_millis(200), Duration::from_secs(2))
}

fn code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::code)
        .unwrap_or("OTHER")
}

#[test]
fn second_start_is_rejected_without_spawning() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let launches = dir.path().join("launches");
    let recorder = fake_recorder(
        dir.path(),
        &format!(
            "echo started >> '{}'\nhead -c 1 > /dev/null\nexit 0",
            launches.display()
        ),
    )?;
    let supervisor = supervisor(&dir, recorder);

    supervisor.start(URL)?;
    let err = supervisor.start(URL).unwrap_err();
    assert_eq!(code(&err), "ALREADY_ACTIVE");

    let started = std::fs::read_to_string(&launches)?;
    assert_eq!(started.lines().count(), 1);
    assert!(dir.path().join("recordings").is_dir());

    match supervisor.status() {
        RecordingStatus::Active { segment_secs, .. } => assert_eq!(segment_secs, 60),
        other => panic!("expected active recording, got {other:?}"),
    }

    let outcome = supervisor.stop()?;
    assert!(matches!(outcome, StopOutcome::Graceful(_)));
    assert_eq!(supervisor.status(), RecordingStatus::Idle);
    Ok(())
}

#[test]
fn stubborn_recorder_is_killed_and_state_returns_idle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = fake_recorder(dir.path(), "trap '' INT\nexec sleep 30")?;
    let supervisor = supervisor(&dir, recorder);

    supervisor.start(URL)?;
    let outcome = supervisor.stop()?;
    assert!(matches!(outcome, StopOutcome::Forced));
    assert_eq!(supervisor.state(), RecordingState::Idle);

    let err = supervisor.stop().unwrap_err();
    assert_eq!(code(&err), "NOT_ACTIVE");
    Ok(())
}

#[test]
fn immediate_exit_fails_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = fake_recorder(dir.path(), "echo 'cannot open input' >&2\nexit 3")?;
    let supervisor = supervisor(&dir, recorder);

    let err = supervisor.start(URL).unwrap_err();
    assert_eq!(code(&err), "PROCESS_SUPERVISION_FAILURE");
    assert_eq!(supervisor.state(), RecordingState::Idle);
    Ok(())
}

#[test]
fn status_notices_recorder_exit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = fake_recorder(dir.path(), "sleep 1\nexit 0")?;
    let supervisor = supervisor(&dir, recorder);

    supervisor.start(URL)?;
    assert!(supervisor.status().is_active());

    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(supervisor.status(), RecordingStatus::Idle);
    supervisor.start(URL)?;
    supervisor.stop()?;
    Ok(())
}

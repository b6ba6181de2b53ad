// SPDX-License-Identifier: GPL-3.0-only

//! Capture stage backed by an external capture program
//!
//! The program (by default `rpicam-vid`) writes raw frames to stdout. It runs
//! in its own process group so termination also reaches any helpers it
//! spawns. Its stderr is re-emitted through tracing.

use super::{CaptureBackend, CaptureSession, StageControl};
use crate::config::{CaptureSettings, PipelineConfig};
use crate::errors::PipelineStartError;
use std::io::{BufRead, BufReader};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Spawns the configured capture program for each pipeline start
#[derive(Debug, Clone)]
pub struct CommandCapture {
    settings: CaptureSettings,
}

impl CommandCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl CaptureBackend for CommandCapture {
    fn open(&self, config: &PipelineConfig) -> Result<CaptureSession, PipelineStartError> {
        let args = self.settings.expand_args(config);
        info!(program = %self.settings.program, ?args, "Spawning capture program");

        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                PipelineStartError::from_io(&format!("spawn {}", self.settings.program), &e)
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PipelineStartError::DeviceUnavailable("capture program has no stdout".into())
        })?;

        if let Some(stderr) = child.stderr.take() {
            let program = self.settings.program.clone();
            let spawned = std::thread::Builder::new()
                .name("capture-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) if !line.trim().is_empty() => {
                                info!(target: "loopcam::capture", program = %program, "{}", line);
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!(error = %e, "Could not forward capture stderr");
            }
        }

        debug!(pid = child.id(), "Capture program started");
        Ok(CaptureSession {
            frames: Box::new(stdout),
            source_format: self.settings.source_format,
            control: Box::new(ChildStage::new(child)),
        })
    }
}

/// [`StageControl`] for a child process leading its own process group
pub struct ChildStage {
    child: Child,
}

impl ChildStage {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// Signal the whole group, also after the leader was reaped
    ///
    /// Helpers the program started outlive the leader. The group id stays
    /// reserved while any of them is alive; an empty group gives ESRCH.
    fn signal_group(&self, signal: libc::c_int) -> std::io::Result<()> {
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: plain syscall on a process group we created
        let result = unsafe { libc::kill(-pgid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Exit code, with signals reported shell-style as 128 + signal
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

impl StageControl for ChildStage {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.signal_group(libc::SIGTERM)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.signal_group(libc::SIGKILL)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(exit_code(status))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn shell(script: &str) -> CommandCapture {
        CommandCapture::new(CaptureSettings {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            source_format: PixelFormat::YUYV,
        })
    }

    fn wait_exit(control: &mut dyn StageControl) -> Option<i32> {
        let started = Instant::now();
        loop {
            if let Some(code) = control.try_wait().unwrap() {
                return code;
            }
            assert!(started.elapsed() < Duration::from_secs(5), "child did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_frames_come_from_stdout() {
        let mut session = shell("printf abcd").open(&PipelineConfig::default()).unwrap();
        let mut out = String::new();
        session.frames.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcd");
        assert_eq!(wait_exit(session.control.as_mut()), Some(0));
    }

    #[test]
    fn test_terminate_reports_signal_exit() {
        let mut session = shell("exec sleep 30").open(&PipelineConfig::default()).unwrap();
        assert!(session.control.pid().is_some());
        session.control.terminate().unwrap();
        assert_eq!(wait_exit(session.control.as_mut()), Some(128 + libc::SIGTERM));
        // Nothing left in the group
        session.control.kill().unwrap();
    }

    /// Gone or a zombie waiting for its new parent to reap it
    fn is_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[test]
    fn test_stop_after_leader_exit_reaches_helpers() {
        let mut session = shell("sleep 30 & echo $!; exit 1")
            .open(&PipelineConfig::default())
            .unwrap();
        let mut line = String::new();
        BufReader::new(&mut session.frames).read_line(&mut line).unwrap();
        let helper: u32 = line.trim().parse().unwrap();

        assert_eq!(wait_exit(session.control.as_mut()), Some(1));
        assert!(!is_gone(helper));

        session.control.terminate().unwrap();
        let started = Instant::now();
        while !is_gone(helper) {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "helper {} survived its group being terminated",
                helper
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_missing_program_is_device_unavailable() {
        let capture = CommandCapture::new(CaptureSettings {
            program: "/nonexistent/rpicam-vid".into(),
            ..CaptureSettings::default()
        });
        assert!(matches!(
            capture.open(&PipelineConfig::default()),
            Err(PipelineStartError::DeviceUnavailable(_))
        ));
    }
}

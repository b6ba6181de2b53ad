// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Loopback slot used when `--device` is not given
pub const DEFAULT_DEVICE_INDEX: u32 = 10;

/// Card label for newly provisioned devices
pub const DEFAULT_DEVICE_LABEL: &str = "Loopcam";

/// Default bounded buffer capacity between capture and transform stages
pub const DEFAULT_BUFFER_FRAMES: u32 = 4;

/// Largest accepted buffer capacity; the buffer must stay small
pub const MAX_BUFFER_FRAMES: u32 = 32;

/// Default output geometry
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_FRAME_RATE: u32 = 30;
pub const MAX_FRAME_RATE: u32 = 120;

/// Supervisor timing
pub mod timing {
    use super::Duration;

    /// Time allowed between Starting and the first frame written
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Fixed delay between FailedBackoff and the next Starting
    pub const BACKOFF_DELAY: Duration = Duration::from_secs(5);

    /// Continuous Running time after which the restart count resets
    pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(30);

    /// Grace period between SIGTERM and SIGKILL when stopping a pipeline
    pub const STOP_GRACE: Duration = Duration::from_secs(5);

    /// Maximum wait for the per-device command lock
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

    /// Interval between non-blocking lock attempts
    pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// How long the transform stage waits on the buffer before rechecking stop
    pub const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// How long to wait for udev to create a freshly added node
    pub const NODE_APPEAR_TIMEOUT: Duration = Duration::from_secs(3);

    /// Window for collecting the exit code of a capture stage that hit EOF
    pub const EXIT_REAP_WINDOW: Duration = Duration::from_millis(500);

    /// Wait for the kernel to reap a SIGKILLed stage
    pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

    /// Interval at which Running refreshes the frames-written counter in status
    pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_millis(250);
}

/// Lines of log history replayed to a newly attached `logs` client
pub const LOG_HISTORY_LINES: usize = 200;

/// Frames between periodic pipeline statistics log lines
pub const STATS_LOG_INTERVAL_FRAMES: u64 = 300;

/// Paths used by the loopback backend
pub mod paths {
    /// State directory used when running as root
    pub const SYSTEM_STATE_DIR: &str = "/var/lib/loopcam";
    pub const DEV_ROOT: &str = "/dev";
    pub const SYSFS_VIDEO_ROOT: &str = "/sys/class/video4linux";
    pub const SYSFS_MODULE_ROOT: &str = "/sys/module";
    pub const MODPROBE_DIR: &str = "/etc/modprobe.d";
    pub const MODULES_LOAD_DIR: &str = "/etc/modules-load.d";
    /// File name used under both modprobe.d and modules-load.d
    pub const BOOT_CONF_NAME: &str = "loopcam.conf";
}

/// Kernel module backing the virtual device
pub const LOOPBACK_MODULE: &str = "v4l2loopback";

/// Driver name reported by VIDIOC_QUERYCAP for loopback nodes
pub const LOOPBACK_DRIVER: &str = "v4l2 loopback";

/// Process exit codes for CLI commands
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    /// Device not provisioned or device node absent
    pub const DEVICE_ABSENT: i32 = 3;
    /// No daemon or pipeline to attach to
    pub const NOT_ATTACHED: i32 = 4;
    pub const LOCK_CONTENTION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const BUSY: i32 = 7;
    pub const UNSUPPORTED: i32 = 8;
    /// Persisted state could not be read or written
    pub const PERSISTENCE: i32 = 9;
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }

    /// Check if the process runs with root privileges
    pub fn is_root() -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() == 0 }
    }
}

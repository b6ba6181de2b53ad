// SPDX-License-Identifier: GPL-3.0-only

//! In-process fakes for the capture program, the loopback sink and the
//! kernel loopback registry, plus a harness wiring them to a supervisor.

#![allow(dead_code)]

use loopcam::backends::loopback::{DeviceReport, LoopbackInfo};
use loopcam::backends::{
    CaptureBackend, CaptureSession, DeviceSink, LoopbackBackend, SinkFactory, StageControl,
};
use loopcam::config::{PipelineConfig, VirtualDeviceConfig};
use loopcam::control::{ControlInterface, DeviceContext};
use loopcam::errors::{ControlError, Missing, PipelineStartError, ProvisioningError};
use loopcam::logging::LogBus;
use loopcam::media::PixelFormat;
use loopcam::pipeline::CapturePipeline;
use loopcam::provisioner::DeviceProvisioner;
use loopcam::storage::DeviceStore;
use loopcam::supervisor::{RestartPolicy, ServiceState, ServiceSupervisor, SupervisorPolicy};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const INDEX: u32 = 10;

/// Small frames keep the fakes cheap
pub fn small_pipeline() -> PipelineConfig {
    PipelineConfig {
        width: 16,
        height: 8,
        frame_rate: 30,
        pixel_format: PixelFormat::I420,
        flip_horizontal: false,
        flip_vertical: false,
    }
}

/// Policy with timings scaled down for tests
pub fn fast_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        restart: RestartPolicy::fixed(Duration::from_millis(100)),
        startup_timeout: Duration::from_secs(2),
        stability_threshold: Duration::from_secs(30),
        stop_grace: Duration::from_millis(300),
    }
}

// ===== Capture =====

/// One fake capture process
pub struct FakeStage {
    pub pid: u32,
    ended: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    ignore_sigterm: bool,
}

impl FakeStage {
    fn end(&self, code: i32) {
        let mut exit = self.exit_code.lock().unwrap();
        if exit.is_none() {
            *exit = Some(code);
        }
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Simulate the process dying on its own
    pub fn crash(&self, code: i32) {
        self.end(code);
    }

    pub fn is_alive(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }
}

struct FakeControl(Arc<FakeStage>);

impl StageControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.0.pid)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        if !self.0.ignore_sigterm {
            self.0.end(128 + libc::SIGTERM);
        }
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.0.end(128 + libc::SIGKILL);
        Ok(())
    }

    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>> {
        if self.0.is_alive() {
            Ok(None)
        } else {
            Ok(Some(self.0.exit_code()))
        }
    }
}

/// Produces one frame per read until its stage ends or its stream runs dry
struct FakeFrames {
    stage: Arc<FakeStage>,
    producing: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
    interval: Duration,
    /// EOF after this many frames while the process keeps running
    limit: Option<u64>,
    produced: u64,
    next: u8,
}

impl Read for FakeFrames {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(0);
        }
        loop {
            if !self.stage.is_alive() {
                return Ok(0);
            }
            if self.producing.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(self.interval);
        if !self.stage.is_alive() {
            return Ok(0);
        }
        buf.fill(self.next);
        self.next = self.next.wrapping_add(1);
        self.produced += 1;
        self.frames_read.fetch_add(1, Ordering::SeqCst);
        Ok(buf.len())
    }
}

pub struct FakeCapture {
    stages: Mutex<Vec<Arc<FakeStage>>>,
    next_pid: AtomicU32,
    producing: Arc<AtomicBool>,
    frames_read: Arc<AtomicU64>,
    interval: Duration,
    ignore_sigterm: AtomicBool,
    frame_limit: Mutex<Option<u64>>,
    open_error: Mutex<Option<PipelineStartError>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            stages: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(4000),
            producing: Arc::new(AtomicBool::new(true)),
            frames_read: Arc::new(AtomicU64::new(0)),
            interval: Duration::from_millis(5),
            ignore_sigterm: AtomicBool::new(false),
            frame_limit: Mutex::new(None),
            open_error: Mutex::new(None),
        }
    }

    /// Stages spawned from now on never produce a frame
    pub fn set_producing(&self, producing: bool) {
        self.producing.store(producing, Ordering::SeqCst);
    }

    pub fn set_ignore_sigterm(&self, ignore: bool) {
        self.ignore_sigterm.store(ignore, Ordering::SeqCst);
    }

    /// Stages spawned from now on close their stream after `limit` frames
    /// but stay alive until signalled
    pub fn set_frame_limit(&self, limit: Option<u64>) {
        *self.frame_limit.lock().unwrap() = limit;
    }

    /// Every open fails with `error` until cleared
    pub fn fail_open(&self, error: Option<PipelineStartError>) {
        *self.open_error.lock().unwrap() = error;
    }

    pub fn spawned(&self) -> usize {
        self.stages.lock().unwrap().len()
    }

    pub fn live(&self) -> usize {
        self.stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }

    pub fn first(&self) -> Option<Arc<FakeStage>> {
        self.stages.lock().unwrap().first().cloned()
    }

    pub fn latest(&self) -> Option<Arc<FakeStage>> {
        self.stages.lock().unwrap().last().cloned()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for FakeCapture {
    fn open(&self, _config: &PipelineConfig) -> Result<CaptureSession, PipelineStartError> {
        if let Some(error) = self.open_error.lock().unwrap().clone() {
            return Err(error);
        }
        let stage = Arc::new(FakeStage {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            ended: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            ignore_sigterm: self.ignore_sigterm.load(Ordering::SeqCst),
        });
        self.stages.lock().unwrap().push(Arc::clone(&stage));

        Ok(CaptureSession {
            frames: Box::new(FakeFrames {
                stage: Arc::clone(&stage),
                producing: Arc::clone(&self.producing),
                frames_read: Arc::clone(&self.frames_read),
                interval: self.interval,
                limit: *self.frame_limit.lock().unwrap(),
                produced: 0,
                next: 0,
            }),
            source_format: PixelFormat::I420,
            control: Box::new(FakeControl(stage)),
        })
    }
}

// ===== Sink =====

#[derive(Default)]
struct SinkState {
    stalled: bool,
    fail_writes: bool,
}

/// Counts frames written; can stall like a device nobody reads
pub struct FakeSinks {
    state: Arc<(Mutex<SinkState>, Condvar)>,
    written: Arc<AtomicU64>,
    opened: AtomicU32,
}

impl FakeSinks {
    pub fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(SinkState::default()), Condvar::new())),
            written: Arc::new(AtomicU64::new(0)),
            opened: AtomicU32::new(0),
        }
    }

    pub fn set_stalled(&self, stalled: bool) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().stalled = stalled;
        cvar.notify_all();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().fail_writes = fail;
        cvar.notify_all();
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

struct FakeSink {
    state: Arc<(Mutex<SinkState>, Condvar)>,
    written: Arc<AtomicU64>,
}

impl DeviceSink for FakeSink {
    fn write_frame(&mut self, _frame: &[u8]) -> std::io::Result<()> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        while state.stalled {
            state = cvar.wait(state).unwrap();
        }
        if state.fail_writes {
            return Err(std::io::Error::other("device write failed"));
        }
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SinkFactory for FakeSinks {
    fn open(
        &self,
        _index: u32,
        _config: &PipelineConfig,
    ) -> Result<Box<dyn DeviceSink>, PipelineStartError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSink {
            state: Arc::clone(&self.state),
            written: Arc::clone(&self.written),
        }))
    }
}

// ===== Loopback registry =====

/// In-memory stand-in for the v4l2loopback module
pub struct FakeLoopback {
    devices: Mutex<HashMap<u32, LoopbackInfo>>,
    boot: Mutex<Vec<VirtualDeviceConfig>>,
    creates: AtomicU32,
    removes: AtomicU32,
    pub available: AtomicBool,
}

impl FakeLoopback {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            boot: Mutex::new(Vec::new()),
            creates: AtomicU32::new(0),
            removes: AtomicU32::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Put a device at `index` as if another tool created it
    pub fn insert(&self, info: LoopbackInfo) {
        self.devices.lock().unwrap().insert(info.index, info);
    }

    pub fn exists(&self, index: u32) -> bool {
        self.devices.lock().unwrap().contains_key(&index)
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> u32 {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn boot_devices(&self) -> Vec<VirtualDeviceConfig> {
        self.boot.lock().unwrap().clone()
    }
}

impl LoopbackBackend for FakeLoopback {
    fn ensure_available(&self) -> Result<(), ProvisioningError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProvisioningError::Unsupported(
                "v4l2loopback module not found".to_string(),
            ))
        }
    }

    fn query(&self, index: u32) -> Result<Option<LoopbackInfo>, ProvisioningError> {
        Ok(self.devices.lock().unwrap().get(&index).cloned())
    }

    fn create(&self, config: &VirtualDeviceConfig) -> Result<(), ProvisioningError> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&config.device_index) {
            return Err(ProvisioningError::Io(format!(
                "video{} already exists",
                config.device_index
            )));
        }
        devices.insert(
            config.device_index,
            LoopbackInfo {
                index: config.device_index,
                label: config.label.clone(),
                buffer_capacity_frames: Some(config.buffer_capacity_frames),
                is_loopback: true,
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, index: u32) -> Result<(), ProvisioningError> {
        self.devices.lock().unwrap().remove(&index);
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_boot(&self, devices: &[VirtualDeviceConfig]) -> Result<(), ProvisioningError> {
        *self.boot.lock().unwrap() = devices.to_vec();
        Ok(())
    }

    fn device_node(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("/dev/video{}", index))
    }

    fn inspect(&self, index: u32) -> Result<DeviceReport, ControlError> {
        let path = self.device_node(index);
        let devices = self.devices.lock().unwrap();
        let info = devices
            .get(&index)
            .ok_or_else(|| ControlError::NotFound(Missing::DeviceNode(path.clone())))?;
        Ok(DeviceReport {
            path,
            driver: if info.is_loopback {
                "v4l2 loopback".to_string()
            } else {
                "uvcvideo".to_string()
            },
            card: info.label.clone(),
            is_loopback: info.is_loopback,
            video_output: info.is_loopback,
            video_capture: true,
        })
    }
}

// ===== Harness =====

/// Everything needed to drive one device without hardware
pub struct Harness {
    pub dir: TempDir,
    pub capture: Arc<FakeCapture>,
    pub sinks: Arc<FakeSinks>,
    pub loopback: Arc<FakeLoopback>,
    pub pipeline: CapturePipeline,
    pub store: DeviceStore,
    pub context: DeviceContext,
    pub supervisor: Arc<ServiceSupervisor>,
    pub control: Arc<ControlInterface>,
    pub logs: LogBus,
}

impl Harness {
    pub fn new(policy: SupervisorPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().to_path_buf();

        let capture = Arc::new(FakeCapture::new());
        let sinks = Arc::new(FakeSinks::new());
        let loopback = Arc::new(FakeLoopback::new());

        let capture_backend: Arc<dyn CaptureBackend> = capture.clone();
        let sink_factory: Arc<dyn SinkFactory> = sinks.clone();
        let loopback_backend: Arc<dyn LoopbackBackend> = loopback.clone();

        let pipeline = CapturePipeline::new(capture_backend, sink_factory, &state_dir);
        let store = DeviceStore::new(&state_dir, INDEX);
        store.save_pipeline(&small_pipeline()).unwrap();

        let supervisor = Arc::new(ServiceSupervisor::new(
            pipeline.clone(),
            store.clone(),
            policy,
        ));
        let context = DeviceContext::new(
            store.clone(),
            DeviceProvisioner::new(loopback_backend, &state_dir),
            Duration::from_secs(2),
        );
        let logs = LogBus::new(50);
        let control = Arc::new(ControlInterface::new(
            context.clone(),
            Arc::clone(&supervisor),
            logs.clone(),
        ));

        Self {
            dir,
            capture,
            sinks,
            loopback,
            pipeline,
            store,
            context,
            supervisor,
            control,
            logs,
        }
    }

    pub fn provisioner(&self) -> DeviceProvisioner {
        let backend: Arc<dyn LoopbackBackend> = self.loopback.clone();
        DeviceProvisioner::new(backend, self.dir.path())
    }

    pub fn device_config(&self) -> VirtualDeviceConfig {
        VirtualDeviceConfig::new(INDEX, "Cam", 4)
    }

    pub async fn provision(&self) {
        self.context.provision("Cam", 4).await.unwrap();
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> ServiceState
    where
        F: Fn(&ServiceState) -> bool,
    {
        let mut states = self.supervisor.subscribe();
        let result = tokio::time::timeout(timeout, states.wait_for(|s| predicate(s))).await;
        match result {
            Ok(Ok(state)) => state.clone(),
            _ => panic!(
                "state never matched within {:?}; last {:?}",
                timeout,
                self.supervisor.status()
            ),
        }
    }
}

/// Poll `condition` every 10ms for up to `timeout`
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

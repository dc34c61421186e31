//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests running with a paused clock advance through motion and exposure instantly.
//!
//! # Available Mocks
//!
//! - `MockStage` - Linear axis with velocity control, homing and fault injection
//! - `MockCamera` - Snapshot and free-running stream with a synthetic scene
//! - `MockShutter` - Laser shutter with auto-shutter flag and transition log
//! - `MockReadable` - Scalar probe for per-slice metadata
//!
//! # Fault Injection
//!
//! - `MockStage::fail_after_moves(n)` - the (n+1)th motion command errors
//! - `MockStage::set_hang_on_settle(true)` - `wait_settled` never returns
//! - `MockCamera::fail_stream_after(n)` - `poll_frame` errors after n streamed frames

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{
    AutoShutter, FrameProducer, Homeable, Movable, Readable, ShutterControl, Snapshot,
    VelocityControl,
};
use crate::hardware::Frame;

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

/// Configuration for [`MockStage`] as read from a `[[hardware.devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockStageConfig {
    /// Starting position in µm
    #[serde(default)]
    pub initial_position: f64,
    /// Travel speed in µm/s (0 = moves complete instantly)
    #[serde(default = "default_stage_speed")]
    pub speed_um_per_sec: f64,
    /// Settling time after motion in milliseconds
    #[serde(default)]
    pub settle_ms: u64,
}

fn default_stage_speed() -> f64 {
    1000.0
}

impl Default for MockStageConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            speed_um_per_sec: default_stage_speed(),
            settle_ms: 0,
        }
    }
}

/// Mock linear stage
///
/// Simulates an axis with:
/// - Travel time proportional to distance at the current velocity
/// - Optional settling time
/// - Homing to 0.0
/// - A counter of every motion command issued (moves and homing)
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::with_position(10.0);
/// stage.move_abs(25.0).await?;
/// assert_eq!(stage.position().await?, 25.0);
/// ```
pub struct MockStage {
    position: Mutex<f64>,
    velocity: Mutex<f64>,
    settle: Duration,
    motion_commands: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    hang_on_settle: AtomicBool,
    history: Mutex<Vec<f64>>,
}

impl MockStage {
    /// Create new mock stage at position 0.0 that moves instantly
    pub fn new() -> Self {
        Self::from_config(&MockStageConfig {
            speed_um_per_sec: 0.0,
            ..Default::default()
        })
    }

    /// Create new instant mock stage at the specified initial position
    pub fn with_position(initial_position: f64) -> Self {
        Self::from_config(&MockStageConfig {
            initial_position,
            speed_um_per_sec: 0.0,
            settle_ms: 0,
        })
    }

    /// Create mock stage with custom speed (µm/s)
    pub fn with_speed(speed_um_per_sec: f64) -> Self {
        Self::from_config(&MockStageConfig {
            speed_um_per_sec,
            ..Default::default()
        })
    }

    /// Create mock stage from driver configuration
    pub fn from_config(config: &MockStageConfig) -> Self {
        Self {
            position: Mutex::new(config.initial_position),
            velocity: Mutex::new(config.speed_um_per_sec),
            settle: Duration::from_millis(config.settle_ms),
            motion_commands: AtomicUsize::new(0),
            fail_after: Mutex::new(None),
            hang_on_settle: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Position without going through the async trait
    pub fn current_position(&self) -> f64 {
        *self.position.lock()
    }

    /// Number of motion commands (absolute, relative, home) issued so far
    pub fn motion_commands(&self) -> usize {
        self.motion_commands.load(Ordering::SeqCst)
    }

    /// Every target this stage was commanded to, in order
    pub fn move_history(&self) -> Vec<f64> {
        self.history.lock().clone()
    }

    /// Make every motion command after the first `moves` fail
    pub fn fail_after_moves(&self, moves: usize) {
        *self.fail_after.lock() = Some(moves);
    }

    /// Make `wait_settled` block forever
    pub fn set_hang_on_settle(&self, hang: bool) {
        self.hang_on_settle.store(hang, Ordering::SeqCst);
    }

    fn register_command(&self, target: f64) -> Result<()> {
        let issued = self.motion_commands.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(target);
        if let Some(limit) = *self.fail_after.lock() {
            if issued >= limit {
                return Err(anyhow!(
                    "MockStage: controller not responding (command #{})",
                    issued + 1
                ));
            }
        }
        Ok(())
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.register_command(target)?;

        let current = self.current_position();
        let speed = *self.velocity.lock();
        if speed > 0.0 {
            let travel = Duration::from_secs_f64((target - current).abs() / speed);
            tracing::trace!(from = current, to = target, ?travel, "MockStage moving");
            // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
            sleep(travel).await;
        }

        *self.position.lock() = target;
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.current_position();
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current_position())
    }

    async fn wait_settled(&self) -> Result<()> {
        if self.hang_on_settle.load(Ordering::SeqCst) {
            tracing::trace!("MockStage: settle hang injected");
            std::future::pending::<()>().await;
        }
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VelocityControl for MockStage {
    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if velocity < 0.0 {
            return Err(anyhow!("MockStage: velocity must not be negative"));
        }
        *self.velocity.lock() = velocity;
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.velocity.lock())
    }
}

#[async_trait]
impl Homeable for MockStage {
    async fn home(&self) -> Result<()> {
        self.move_abs(0.0).await
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Synthetic Gaussian spot rendered by the default [`MockCamera`] scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotConfig {
    /// Spot centre, x (pixels)
    pub x: f64,
    /// Spot centre, y (pixels)
    pub y: f64,
    /// Gaussian sigma (pixels)
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Peak height above background
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
}

fn default_sigma() -> f64 {
    4.0
}

fn default_amplitude() -> f64 {
    1000.0
}

/// Configuration for [`MockCamera`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockCameraConfig {
    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Exposure per snapshot in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u64,
    /// Free-running stream rate
    #[serde(default = "default_frame_rate")]
    pub frame_rate_hz: f64,
    /// Constant background level
    #[serde(default = "default_background")]
    pub background: u16,
    /// Optional bright spot
    #[serde(default)]
    pub spot: Option<SpotConfig>,
}

fn default_width() -> u32 {
    64
}

fn default_height() -> u32 {
    64
}

fn default_exposure_ms() -> u64 {
    10
}

fn default_frame_rate() -> f64 {
    30.0
}

fn default_background() -> u16 {
    100
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            exposure_ms: default_exposure_ms(),
            frame_rate_hz: default_frame_rate(),
            background: default_background(),
            spot: None,
        }
    }
}

/// Produces the frame with the given sequence number.
pub type FrameGenerator = Arc<dyn Fn(u64) -> Frame + Send + Sync>;

/// Render a Gaussian spot on a flat background.
pub fn gaussian_spot(width: u32, height: u32, background: u16, spot: &SpotConfig) -> Frame {
    let two_sigma_sq = 2.0 * spot.sigma * spot.sigma;
    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - spot.x;
            let dy = y as f64 - spot.y;
            let value = background as f64 + spot.amplitude * (-(dx * dx + dy * dy) / two_sigma_sq).exp();
            data.push(value.round().clamp(0.0, u16::MAX as f64) as u16);
        }
    }
    Frame::from_u16(width, height, data)
}

struct StreamState {
    started: Instant,
    delivered: u64,
}

/// Mock camera with snapshot and streaming support
///
/// Simulates a camera with:
/// - Configurable resolution
/// - Exposure delay per snapshot
/// - A free-running stream that makes one frame available per frame period
/// - A pluggable scene generator
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(640, 480);
/// let frame = camera.capture_frame().await?;
/// assert_eq!(frame.width, 640);
/// ```
pub struct MockCamera {
    resolution: (u32, u32),
    exposure: Duration,
    frame_period: Duration,
    generator: FrameGenerator,
    frame_count: AtomicU64,
    stream: Mutex<Option<StreamState>>,
    fail_stream_after: Mutex<Option<u64>>,
}

impl MockCamera {
    /// Create new mock camera with specified resolution and a flat scene
    pub fn new(width: u32, height: u32) -> Self {
        Self::from_config(&MockCameraConfig {
            width,
            height,
            ..Default::default()
        })
    }

    /// Create mock camera from driver configuration
    pub fn from_config(config: &MockCameraConfig) -> Self {
        let (width, height, background) = (config.width, config.height, config.background);
        let generator: FrameGenerator = match config.spot.clone() {
            Some(spot) => {
                let frame = gaussian_spot(width, height, background, &spot);
                Arc::new(move |_| frame.clone())
            }
            None => Arc::new(move |_| Frame::filled(width, height, background)),
        };

        let rate = if config.frame_rate_hz > 0.0 {
            config.frame_rate_hz
        } else {
            default_frame_rate()
        };

        Self {
            resolution: (width, height),
            exposure: Duration::from_millis(config.exposure_ms),
            frame_period: Duration::from_secs_f64(1.0 / rate),
            generator,
            frame_count: AtomicU64::new(0),
            stream: Mutex::new(None),
            fail_stream_after: Mutex::new(None),
        }
    }

    /// Replace the scene generator
    pub fn with_generator(mut self, generator: FrameGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Set the snapshot exposure time
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Set the streaming frame period
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    /// Get total number of frames captured (snapshots and streamed)
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Make `poll_frame` fail once `frames` frames have been streamed
    pub fn fail_stream_after(&self, frames: u64) {
        *self.fail_stream_after.lock() = Some(frames);
    }

    fn next_frame(&self) -> Frame {
        let index = self.frame_count.fetch_add(1, Ordering::SeqCst);
        (self.generator)(index)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(default_width(), default_height())
    }
}

#[async_trait]
impl Snapshot for MockCamera {
    async fn capture_frame(&self) -> Result<Frame> {
        if self.stream.lock().is_some() {
            anyhow::bail!("MockCamera: cannot snapshot while streaming");
        }
        if !self.exposure.is_zero() {
            sleep(self.exposure).await;
        }
        Ok(self.next_frame())
    }
}

#[async_trait]
impl FrameProducer for MockCamera {
    async fn start_stream(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.is_some() {
            anyhow::bail!("MockCamera: Already streaming");
        }
        *stream = Some(StreamState {
            started: Instant::now(),
            delivered: 0,
        });
        tracing::debug!("MockCamera: stream started");
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        if self.stream.lock().take().is_some() {
            tracing::debug!("MockCamera: stream stopped");
        }
        Ok(())
    }

    async fn poll_frame(&self) -> Result<Option<Frame>> {
        let fail_after = *self.fail_stream_after.lock();
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            anyhow::bail!("MockCamera: not streaming");
        };

        if let Some(limit) = fail_after {
            if stream.delivered >= limit {
                return Err(anyhow!(
                    "MockCamera: stream lost after {} frames",
                    stream.delivered
                ));
            }
        }

        let available = (stream.started.elapsed().as_secs_f64()
            / self.frame_period.as_secs_f64())
        .floor() as u64;
        if available <= stream.delivered {
            return Ok(None);
        }
        stream.delivered += 1;
        drop(guard);

        Ok(Some(self.next_frame()))
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    async fn is_streaming(&self) -> Result<bool> {
        Ok(self.stream.lock().is_some())
    }
}

// =============================================================================
// MockShutter - Simulated Laser Shutter
// =============================================================================

/// Configuration for [`MockShutter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockShutterConfig {
    /// Initial auto-shutter setting
    #[serde(default)]
    pub auto_shutter: bool,
}

/// Mock laser shutter
///
/// Records every open/close transition so tests can check the light path
/// was gated around exposures.
pub struct MockShutter {
    open: AtomicBool,
    auto: AtomicBool,
    transitions: Mutex<Vec<bool>>,
}

impl MockShutter {
    /// Create a closed shutter with the given auto-shutter setting
    pub fn new(auto_shutter: bool) -> Self {
        Self {
            open: AtomicBool::new(false),
            auto: AtomicBool::new(auto_shutter),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Current open state without the async trait
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current auto-shutter flag without the async trait
    pub fn auto_enabled(&self) -> bool {
        self.auto.load(Ordering::SeqCst)
    }

    /// Every state the shutter was driven to (`true` = open)
    pub fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().clone()
    }

    fn drive(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
        self.transitions.lock().push(open);
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    async fn open_shutter(&self) -> Result<()> {
        self.drive(true);
        Ok(())
    }

    async fn close_shutter(&self) -> Result<()> {
        self.drive(false);
        Ok(())
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.is_open())
    }
}

#[async_trait]
impl AutoShutter for MockShutter {
    async fn auto_shutter(&self) -> Result<bool> {
        Ok(self.auto_enabled())
    }

    async fn set_auto_shutter(&self, enabled: bool) -> Result<()> {
        self.auto.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockReadable - Simulated Scalar Probe
// =============================================================================

/// Configuration for [`MockReadable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockReadableConfig {
    /// Value returned by every read
    #[serde(default)]
    pub value: f64,
}

/// Mock scalar probe (temperature, laser power)
pub struct MockReadable {
    value: Mutex<f64>,
    reads: AtomicU64,
}

impl MockReadable {
    /// Create a probe that reports `value`
    pub fn new(value: f64) -> Self {
        Self {
            value: Mutex::new(value),
            reads: AtomicU64::new(0),
        }
    }

    /// Change the reported value
    pub fn set_value(&self, value: f64) {
        *self.value.lock() = value;
    }

    /// Number of reads served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for MockReadable {
    async fn read(&self) -> Result<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(*self.value.lock())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

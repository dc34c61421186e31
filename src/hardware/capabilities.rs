//! Atomic Hardware Capabilities
//!
//! Instead of a class hierarchy (stage → rotator → specific rotator), devices
//! implement the specific capabilities they actually support:
//!
//! - A linear stage implements: `Movable + VelocityControl + Homeable`
//! - A rotation mount implements: `Movable` (degrees are its native unit)
//! - A camera implements: `Snapshot + FrameProducer`
//! - A laser shutter implements: `ShutterControl + AutoShutter`
//! - A temperature probe implements: `Readable`
//!
//! Device quirks (step/degree conversion, controller handshakes) live inside
//! each implementation behind the same trait.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn step_through<S>(stage: &S, values: &[f64]) -> Result<()>
//! where
//!     S: Movable + ?Sized,
//! {
//!     for &z in values {
//!         stage.move_abs(z).await?;
//!         stage.wait_settled().await?;
//!     }
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::Frame;

/// Capability: Motion Control
///
/// Devices that can move to positions (linear stages, rotation mounts).
///
/// # Contract
/// - Positions are in device-native units (µm for linear axes, degrees for rotation)
/// - `move_abs` and `move_rel` initiate motion but may return before completion
/// - `wait_settled` blocks until motion completes
/// - `position` returns current position (may be approximate during motion)
///
/// # Thread Safety
/// - All methods are async and require `&self` (immutable reference)
/// - Interior mutability (Mutex/RwLock) should be used for state
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    ///
    /// # Returns
    /// - Ok(()) if motion initiated successfully
    /// - Err if position is out of range or hardware error
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current position
    ///
    /// May be approximate if device is currently moving.
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    ///
    /// Blocks until device reports motion is complete. Implementations are
    /// not required to time out; callers bound this wait with a watchdog.
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Velocity Control
///
/// Axes whose travel speed can be set, used for continuously swept stacks.
#[async_trait]
pub trait VelocityControl: Send + Sync {
    /// Set travel velocity in device units per second
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Current travel velocity in device units per second
    async fn velocity(&self) -> Result<f64>;
}

/// Capability: Homing
#[async_trait]
pub trait Homeable: Send + Sync {
    /// Run the homing routine and block until the axis reports home
    async fn home(&self) -> Result<()>;
}

/// Capability: Single-shot Capture
///
/// Cameras that can expose and read out exactly one frame on request.
#[async_trait]
pub trait Snapshot: Send + Sync {
    /// Expose and read out one frame
    async fn capture_frame(&self) -> Result<Frame>;

    /// Wait until devices that gate the next exposure (shutters, triggers,
    /// synchronizers) report ready.
    ///
    /// # Default Implementation
    /// Returns immediately.
    async fn wait_for_sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Frame/Image Streaming
///
/// Devices that produce a free-running stream of frames.
///
/// # Contract
/// - `start_stream()` begins continuous acquisition
/// - `poll_frame()` never blocks: it returns `Ok(None)` when no frame is ready
/// - `stop_stream()` halts acquisition and is idempotent
/// - `resolution()` is immutable
#[async_trait]
pub trait FrameProducer: Send + Sync {
    /// Start continuous frame acquisition
    ///
    /// # Returns
    /// - Ok(()) if streaming started
    /// - Err if already streaming or hardware error
    async fn start_stream(&self) -> Result<()>;

    /// Stop frame acquisition
    async fn stop_stream(&self) -> Result<()>;

    /// Take the next buffered frame, if any
    ///
    /// # Returns
    /// - Ok(Some(frame)) when a frame is ready
    /// - Ok(None) when the buffer is empty
    /// - Err on an unrecoverable device error (the stream is dead)
    async fn poll_frame(&self) -> Result<Option<Frame>>;

    /// Get frame resolution (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Check if device is currently streaming frames
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_streaming(&self) -> Result<bool> {
        anyhow::bail!("Streaming state query not supported by this device")
    }
}

/// Capability: Shutter Control
///
/// Lasers and light-path shutters.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open the shutter (allow beam to pass)
    async fn open_shutter(&self) -> Result<()>;

    /// Close the shutter (block beam)
    async fn close_shutter(&self) -> Result<()>;

    /// Query shutter state
    async fn is_shutter_open(&self) -> Result<bool>;

    /// Power the light path on or off.
    async fn set_powered(&self, powered: bool) -> Result<()> {
        if powered {
            self.open_shutter().await
        } else {
            self.close_shutter().await
        }
    }
}

/// Capability: Automatic Shuttering
///
/// When enabled, the device opens itself around every camera exposure.
/// Acquisitions disable it and drive the shutter explicitly.
#[async_trait]
pub trait AutoShutter: Send + Sync {
    /// Whether auto-shutter is enabled
    async fn auto_shutter(&self) -> Result<bool>;

    /// Enable or disable auto-shutter
    async fn set_auto_shutter(&self, enabled: bool) -> Result<()>;
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (temperature probes, power
/// meters). Used to stamp per-slice metadata.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

// =============================================================================
// Combined Traits (for trait objects)
// =============================================================================

/// Combined trait for cameras that support both single shots and streaming
///
/// Implement the individual traits and get this automatically via blanket impl.
pub trait Camera: Snapshot + FrameProducer {}

impl<T: Snapshot + FrameProducer> Camera for T {}

/// Combined trait for light sources with shutter and auto-shutter control
pub trait Illumination: ShutterControl + AutoShutter {}

impl<T: ShutterControl + AutoShutter> Illumination for T {}

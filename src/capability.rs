//! Device-side collaborators consumed by scripts and the capture command.
//!
//! Their internals (input injection, accessibility traversal, pixel
//! matching, raster encoding) live outside this crate. The server holds one
//! process-wide set of handles; there is no locking across concurrent
//! scripts, so device operations from two scripts may interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

/// Touch phases for low-level pointer control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Move,
    Up,
}

/// Device automation bridge: input simulation, accessibility tree and
/// display metadata.
pub trait DeviceBridge: Send + Sync {
    /// Acquire the bridge. Called at supervisor start and after restart.
    fn connect(&self) -> Result<()>;

    /// Release the bridge. Called on restart and exit.
    fn disconnect(&self);

    fn rotation(&self) -> i32;

    /// Display size in pixels, `(width, height)`.
    fn display_size(&self) -> (u32, u32);

    /// Accessibility node dump.
    fn nodes(&self) -> Result<serde_json::Value>;

    /// Identifier of the foreground window.
    fn active_window(&self) -> Result<String>;

    fn tap(&self, x: i64, y: i64) -> Result<()>;

    fn swipe(&self, from: (i64, i64), to: (i64, i64), steps: i64) -> Result<()>;

    fn drag(&self, from: (i64, i64), to: (i64, i64), steps: i64) -> Result<()>;

    fn touch(&self, action: TouchAction, x: i64, y: i64) -> Result<()>;
}

/// Screenshot capture, returning an encoded raster.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self, rotation: i32, width: u32, height: u32, quality: u8) -> Result<Vec<u8>>;
}

/// Rectangle in screen coordinates, inclusive-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

/// Template search over two encoded rasters.
pub trait ImageMatcher: Send + Sync {
    /// Top-left corner of the best match with similarity `>= similarity`.
    fn find(
        &self,
        screen: &[u8],
        template: &[u8],
        region: Region,
        similarity: f64,
    ) -> Result<Option<(i64, i64)>>;
}

/// The process-wide capability handles.
#[derive(Clone)]
pub struct Capabilities {
    pub device: Arc<dyn DeviceBridge>,
    pub screen: Arc<dyn ScreenCapture>,
    pub matcher: Option<Arc<dyn ImageMatcher>>,
}

impl Capabilities {
    /// Capabilities for a host without a device: fixed display metadata,
    /// input is accepted and ignored, screenshots fail.
    pub fn headless(width: u32, height: u32) -> Self {
        let device = Arc::new(HeadlessDevice::new(width, height));
        Self {
            device,
            screen: Arc::new(NoScreen),
            matcher: None,
        }
    }
}

/// Device bridge with no device behind it.
#[derive(Debug)]
pub struct HeadlessDevice {
    width: u32,
    height: u32,
    connected: AtomicBool,
}

impl HeadlessDevice {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl DeviceBridge for HeadlessDevice {
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Relaxed);
        debug!(width = self.width, height = self.height, "Headless device connected");
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        debug!("Headless device disconnected");
    }

    fn rotation(&self) -> i32 {
        0
    }

    fn display_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn nodes(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Array(Vec::new()))
    }

    fn active_window(&self) -> Result<String> {
        Ok(String::new())
    }

    fn tap(&self, x: i64, y: i64) -> Result<()> {
        debug!(x, y, "tap ignored (headless)");
        Ok(())
    }

    fn swipe(&self, from: (i64, i64), to: (i64, i64), steps: i64) -> Result<()> {
        debug!(?from, ?to, steps, "swipe ignored (headless)");
        Ok(())
    }

    fn drag(&self, from: (i64, i64), to: (i64, i64), steps: i64) -> Result<()> {
        debug!(?from, ?to, steps, "drag ignored (headless)");
        Ok(())
    }

    fn touch(&self, action: TouchAction, x: i64, y: i64) -> Result<()> {
        debug!(?action, x, y, "touch ignored (headless)");
        Ok(())
    }
}

/// Screen capture that always fails.
#[derive(Debug, Default)]
pub struct NoScreen;

impl ScreenCapture for NoScreen {
    fn capture(&self, _rotation: i32, _width: u32, _height: u32, _quality: u8) -> Result<Vec<u8>> {
        anyhow::bail!("No display attached")
    }
}

/// Default swipe step count: one step per 20 px of travel.
pub fn default_steps(from: (i64, i64), to: (i64, i64)) -> i64 {
    let travel = from.0.abs_diff(to.0).saturating_add(from.1.abs_diff(to.1));
    i64::try_from(travel / 20).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_reports_configured_display() {
        let caps = Capabilities::headless(720, 1280);
        caps.device.connect().unwrap();
        assert_eq!(caps.device.display_size(), (720, 1280));
        assert_eq!(caps.device.rotation(), 0);
        assert!(caps.device.tap(1, 2).is_ok());
        assert!(caps.screen.capture(0, 720, 1280, 100).is_err());
    }

    #[test]
    fn steps_scale_with_distance() {
        assert_eq!(default_steps((0, 0), (100, 100)), 10);
        assert_eq!(default_steps((5, 5), (5, 5)), 0);
        assert_eq!(default_steps((100, 0), (0, 0)), 5);
    }

    #[test]
    fn steps_saturate_on_extreme_coordinates() {
        let steps = default_steps((i64::MIN, i64::MIN), (i64::MAX, i64::MAX));
        assert_eq!(u64::try_from(steps).unwrap(), u64::MAX / 20);
        assert_eq!(default_steps((i64::MIN, 0), (0, 0)), i64::MAX / 20);
    }
}

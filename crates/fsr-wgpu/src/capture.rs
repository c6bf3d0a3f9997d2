//! Scene capture into the low-resolution target
//!
//! While the upscaler is active the scene is drawn by a capture camera into the low-resolution target, and
//! the native camera must not draw anything itself. [`CaptureAdapter::begin`] derives the capture camera and
//! neutralises the native camera; the returned guard restores it when dropped.

/// How a camera clears its target before drawing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearMode {
    Skybox,
    SolidColor([f32; 4]),
    DepthOnly,
    Nothing,
}

/// Where a camera draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraTarget {
    /// The native framebuffer
    Native,
    /// The upscaler's low-resolution target
    Offscreen,
}

/// Snapshot of the host camera state touched by the capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    /// Bit mask of layers the camera draws; 0 draws nothing
    pub culling_mask: u32,
    pub clear: ClearMode,
    pub target: CameraTarget,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            culling_mask: u32::MAX,
            clear: ClearMode::Skybox,
            target: CameraTarget::Native,
        }
    }
}

/// Derives capture cameras from the native camera
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureAdapter;

impl CaptureAdapter {
    /// Starts a capture for one frame
    ///
    /// The native camera keeps drawing nothing until the returned guard is dropped.
    pub fn begin(native: &mut CameraState) -> CaptureGuard<'_> {
        let capture = CameraState {
            target: CameraTarget::Offscreen,
            ..*native
        };
        let saved_culling_mask = native.culling_mask;
        let saved_clear = native.clear;

        native.culling_mask = 0;
        native.clear = ClearMode::Nothing;

        tracing::trace!(culling_mask = saved_culling_mask, "native camera neutralised for capture");

        CaptureGuard {
            native,
            capture,
            saved_culling_mask,
            saved_clear,
        }
    }
}

/// Restores the native camera on drop
#[derive(Debug)]
pub struct CaptureGuard<'a> {
    native: &'a mut CameraState,
    capture: CameraState,
    saved_culling_mask: u32,
    saved_clear: ClearMode,
}

impl CaptureGuard<'_> {
    /// Camera that renders the scene into the low-resolution target
    pub fn capture_camera(&self) -> CameraState {
        self.capture
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.native.culling_mask = self.saved_culling_mask;
        self.native.clear = self.saved_clear;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_camera_and_restore() {
        let mut camera = CameraState {
            culling_mask: 0b1011,
            clear: ClearMode::SolidColor([0.1, 0.2, 0.3, 1.0]),
            target: CameraTarget::Native,
        };
        let original = camera;

        {
            let guard = CaptureAdapter::begin(&mut camera);
            let capture = guard.capture_camera();
            assert_eq!(capture.target, CameraTarget::Offscreen);
            assert_eq!(capture.culling_mask, 0b1011);
            assert_eq!(capture.clear, ClearMode::SolidColor([0.1, 0.2, 0.3, 1.0]));
            assert_eq!(guard.native.culling_mask, 0);
            assert_eq!(guard.native.clear, ClearMode::Nothing);
        }

        assert_eq!(camera, original);
    }

    #[test]
    fn test_restore_on_unwind() {
        let mut camera = CameraState::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = CaptureAdapter::begin(&mut camera);
            panic!("scene renderer failed");
        }));
        assert!(result.is_err());
        assert_eq!(camera, CameraState::default());
    }
}

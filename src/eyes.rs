use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

use crate::error::ActionError;
use crate::types::{CAPTURE_TIMEOUT_MS, Observation};

/// Host capture boundary: one call returning an image and its pixel
/// dimensions.
pub trait ScreenCapturer {
    async fn capture(&self) -> Result<Observation, ActionError>;
}

impl<T: ScreenCapturer> ScreenCapturer for &T {
    async fn capture(&self) -> Result<Observation, ActionError> {
        (**self).capture().await
    }
}

/// Captures the screen by shelling out to `scrot`, one file per capture
/// under the user cache directory.
pub struct ShellEyes {
    shots_dir: PathBuf,
    timeout: Duration,
}

impl ShellEyes {
    pub fn new() -> Result<Self, ActionError> {
        let shots_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("deskpilot")
            .join("shots");
        std::fs::create_dir_all(&shots_dir)
            .map_err(|e| ActionError::Capture(format!("cannot create {shots_dir:?}: {e}")))?;
        Ok(Self {
            shots_dir,
            timeout: Duration::from_millis(CAPTURE_TIMEOUT_MS),
        })
    }
}

impl ScreenCapturer for ShellEyes {
    async fn capture(&self) -> Result<Observation, ActionError> {
        let path = self
            .shots_dir
            .join(format!("shot_{:016x}.png", rand::random::<u64>()));

        let run = Command::new("scrot").arg("-o").arg(&path).output();
        let out = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ActionError::CaptureTimeout(self.timeout))?
            .map_err(|e| ActionError::Capture(format!("failed to run scrot: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ActionError::Capture(stderr.trim().to_string()));
        }

        let png = tokio::fs::read(&path)
            .await
            .map_err(|e| ActionError::Capture(format!("cannot read {path:?}: {e}")))?;
        if png.is_empty() {
            return Err(ActionError::Capture("capture produced an empty file".to_string()));
        }
        let (width, height) = png_dimensions(&png)
            .ok_or_else(|| ActionError::Capture("capture is not a valid PNG".to_string()))?;

        debug!(?path, width, height, "captured screen");
        Ok(Observation {
            png: Arc::new(png),
            width,
            height,
            captured_at: Utc::now(),
        })
    }
}

/// Width and height from the PNG IHDR chunk.
fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || &data[..8] != b"\x89PNG\r\n\x1a\n" || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
    (width > 0 && height > 0).then_some((width, height))
}

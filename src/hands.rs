use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::ActionError;
use crate::types::{INPUT_TIMEOUT_MS, MouseButton, TYPING_DELAY_MS, TYPING_GROUP_SIZE};

/// Host input boundary: one call per input-producing action variant.
///
/// Implementations mutate host input state and are NOT idempotent; the
/// executor decides what gets retried, never the synthesizer itself.
pub trait InputSynthesizer {
    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ActionError>;
    async fn click(
        &self,
        x: i64,
        y: i64,
        button: MouseButton,
        double: bool,
    ) -> Result<(), ActionError>;
    async fn type_text(&self, text: &str) -> Result<(), ActionError>;
    async fn key_press(&self, chord: &str) -> Result<(), ActionError>;
    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), ActionError>;
}

impl<T: InputSynthesizer> InputSynthesizer for &T {
    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ActionError> {
        (**self).move_cursor(x, y).await
    }

    async fn click(
        &self,
        x: i64,
        y: i64,
        button: MouseButton,
        double: bool,
    ) -> Result<(), ActionError> {
        (**self).click(x, y, button, double).await
    }

    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        (**self).type_text(text).await
    }

    async fn key_press(&self, chord: &str) -> Result<(), ActionError> {
        (**self).key_press(chord).await
    }

    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), ActionError> {
        (**self).scroll(dx, dy).await
    }
}

/// Synthesizes input by shelling out to `xdotool`, one invocation per
/// action, each bounded by a timeout.
pub struct ShellHands {
    timeout: Duration,
}

impl ShellHands {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_millis(INPUT_TIMEOUT_MS),
        }
    }

    async fn xdotool(&self, args: &[&str]) -> Result<(), ActionError> {
        debug!(?args, "xdotool");
        let run = Command::new("xdotool").args(args).output();
        let out = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ActionError::InputTimeout(self.timeout))?
            .map_err(|e| ActionError::Input(format!("failed to run xdotool: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ActionError::Input(stderr.trim().to_string()));
        }
        Ok(())
    }
}

/// Split text into the character groups sent per type invocation.
fn typing_groups(text: &str) -> Vec<String> {
    text.chars()
        .collect::<Vec<_>>()
        .chunks(TYPING_GROUP_SIZE)
        .map(|group| group.iter().collect())
        .collect()
}

fn button_number(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "1",
        MouseButton::Middle => "2",
        MouseButton::Right => "3",
    }
}

impl InputSynthesizer for ShellHands {
    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ActionError> {
        self.xdotool(&["mousemove", &x.to_string(), &y.to_string()])
            .await
    }

    async fn click(
        &self,
        x: i64,
        y: i64,
        button: MouseButton,
        double: bool,
    ) -> Result<(), ActionError> {
        self.move_cursor(x, y).await?;
        let repeat = if double { "2" } else { "1" };
        self.xdotool(&["click", "--repeat", repeat, button_number(button)])
            .await
    }

    async fn type_text(&self, text: &str) -> Result<(), ActionError> {
        // Paced typing in small groups; one giant burst gets dropped by some
        // applications.
        let delay = TYPING_DELAY_MS.to_string();
        for group in typing_groups(text) {
            self.xdotool(&["type", "--delay", &delay, "--", &group])
                .await?;
        }
        Ok(())
    }

    async fn key_press(&self, chord: &str) -> Result<(), ActionError> {
        self.xdotool(&["key", "--", chord]).await
    }

    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), ActionError> {
        // Wheel buttons: 4 up, 5 down, 6 left, 7 right.
        if dy != 0 {
            let button = if dy > 0 { "5" } else { "4" };
            self.xdotool(&["click", "--repeat", &dy.unsigned_abs().to_string(), button])
                .await?;
        }
        if dx != 0 {
            let button = if dx > 0 { "7" } else { "6" };
            self.xdotool(&["click", "--repeat", &dx.unsigned_abs().to_string(), button])
                .await?;
        }
        Ok(())
    }
}

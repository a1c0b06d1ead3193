use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::ModelError;
use crate::types::{ActionOutcome, ActionRecord, Decision, MODEL_TIMEOUT_MS, Observation};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(500);

const SYSTEM_PROMPT: &str = r#"You control the computer's mouse and keyboard. You see the screen through screenshots and reply with ONE JSON object per response.

Reply forms:
- {"decision":"act","actions":[ ... ]}
- {"decision":"done","summary":"Completed: found the answer is 42"}

Available actions:
- {"action":"Move","x":512,"y":384}
- {"action":"Click","x":512,"y":384,"button":"left","double":false}  (button: left|middle|right)
- {"action":"TypeText","text":"search query"}
- {"action":"KeyPress","key":"Return"}  (xdotool-style chords: Escape, alt+Tab, ctrl+shift+t)
- {"action":"Scroll","dx":0,"dy":3}  (positive dy scrolls down)
- {"action":"Screenshot"}

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. Coordinates are pixels in the screenshot you were shown; (0,0) is the top-left corner.
3. Actions in one response run strictly in order; if one fails, the rest are skipped.
4. Prefer short action batches and re-check the screen often.
5. Use KeyPress for Enter, Tab and shortcuts; TypeText is for plain text only.
6. When the user's task is accomplished, reply with decision "done" and a summary of what was achieved."#;

/// A message in the conversation history sent to the model. Content is a
/// JSON value so observation messages can carry image parts.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

impl ChatMessage {
    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(text.into()),
        }
    }
}

/// Transport half of the model boundary, so the loop can be driven by a
/// scripted fake in tests.
pub trait ModelClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}

impl<T: ModelClient> ModelClient for &T {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        (**self).complete(messages).await
    }
}

/// OpenAI-compatible chat-completions transport.
pub struct HttpModel {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpModel {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Result<Self, ModelError> {
        let timeout = Duration::from_millis(MODEL_TIMEOUT_MS);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        })
    }
}

impl ModelClient for HttpModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::CallTimeout(self.timeout)
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error")
                .to_string();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ModelError::Response(format!("no content in response: {body}")))
    }
}

/// One accepted model response: the raw text (for the audit trail) and what
/// it parsed to.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub raw: String,
    pub decision: Decision,
}

/// Conversation state and decision parsing on top of a `ModelClient`.
///
/// Malformed responses, transport errors and timeouts all consume attempts
/// from the same retry budget; a parse failure retries with a repair note
/// quoting the schema expectation.
pub struct Brain<M> {
    client: M,
    conversation: Vec<ChatMessage>,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl<M: ModelClient> Brain<M> {
    pub fn new(client: M) -> Self {
        Self {
            client,
            conversation: vec![ChatMessage::text("system", SYSTEM_PROMPT)],
            max_attempts: MAX_ATTEMPTS,
            base_backoff: RETRY_BASE_BACKOFF,
        }
    }

    /// Start a new task. History from earlier tasks is preserved so the
    /// model keeps context across commands.
    pub fn start_task(&mut self, task: &str) {
        self.conversation.push(ChatMessage::text(
            "user",
            format!("Task: {task}\n\nYou will now receive a screenshot of the current screen."),
        ));
    }

    /// Feed an observation (and the outcomes of the actions that led to it)
    /// back to the model.
    pub fn observe(&mut self, obs: &Observation, records: &[ActionRecord]) {
        let mut report = String::new();
        if !records.is_empty() {
            report.push_str("Results of your last actions:\n");
            for rec in records {
                let line = match &rec.outcome {
                    ActionOutcome::Ok => format!("- {:?}: ok\n", rec.action),
                    ActionOutcome::Failed(err) => format!("- {:?}: FAILED: {err}\n", rec.action),
                    ActionOutcome::Skipped => format!("- {:?}: skipped\n", rec.action),
                };
                report.push_str(&line);
            }
            report.push('\n');
        }
        report.push_str(&format!(
            "Screenshot of the current screen, {}x{} pixels. What is your next decision?",
            obs.width, obs.height
        ));

        let image_url = format!("data:image/png;base64,{}", STANDARD.encode(obs.png.as_slice()));
        self.conversation.push(ChatMessage {
            role: "user".to_string(),
            content: json!([
                {"type": "text", "text": report},
                {"type": "image_url", "image_url": {"url": image_url}},
            ]),
        });
    }

    /// Ask the model for the next decision, retrying with backoff up to the
    /// attempt budget.
    pub async fn decide(&mut self) -> Result<ModelReply, ModelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.complete(&self.conversation).await {
                Ok(raw) => match parse_decision(&raw) {
                    Ok(decision) => {
                        self.conversation.push(ChatMessage::text("assistant", raw.as_str()));
                        debug!(?decision, "model decided");
                        return Ok(ModelReply { raw, decision });
                    }
                    Err(err) => {
                        warn!(%err, attempt, "model response did not parse");
                        if attempt >= self.max_attempts {
                            return Err(err);
                        }
                        self.conversation.push(ChatMessage::text("assistant", raw.as_str()));
                        self.conversation.push(ChatMessage::text(
                            "user",
                            format!(
                                "Your previous response was invalid: {err}\nReturn exactly one JSON object matching the decision schema and nothing else."
                            ),
                        ));
                    }
                },
                Err(err) => {
                    warn!(%err, attempt, "model call failed");
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                }
            }
            tokio::time::sleep(self.backoff_for_attempt(attempt)).await;
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(10);
        let factor = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        Duration::from_millis((self.base_backoff.as_millis() as u64).saturating_mul(factor))
    }
}

/// Parse a raw model response into a `Decision`, tolerating the markdown
/// fences models like to add.
fn parse_decision(raw: &str) -> Result<Decision, ModelError> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(cleaned).map_err(|e| {
        let shown: String = cleaned.chars().take(200).collect();
        ModelError::Response(format!("{e}; content: {shown}"))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::types::Action;

    #[derive(Default)]
    struct FakeModel {
        responses: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl FakeModel {
        fn push(&self, raw: impl Into<String>) {
            self.responses.lock().unwrap().push_back(Ok(raw.into()));
        }

        fn push_err(&self, err: ModelError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl ModelClient for FakeModel {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Transport("no response queued".to_string())))
        }
    }

    fn fast_brain(model: &FakeModel) -> Brain<&FakeModel> {
        let mut brain = Brain::new(model);
        brain.base_backoff = Duration::from_millis(1);
        brain
    }

    fn obs() -> Observation {
        Observation {
            png: Arc::new(vec![1, 2, 3]),
            width: 800,
            height: 600,
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn decide_parses_an_action_batch() {
        let model = FakeModel::default();
        model.push(r#"{"decision":"act","actions":[{"action":"Click","x":10,"y":10}]}"#);
        let mut brain = fast_brain(&model);

        let reply = brain.decide().await.unwrap();
        match reply.decision {
            Decision::Act { actions } => {
                assert_eq!(actions.len(), 1);
                assert!(matches!(actions[0], Action::Click { x: 10, y: 10, .. }));
            }
            other => panic!("expected act, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decide_strips_markdown_fences() {
        let model = FakeModel::default();
        model.push("```json\n{\"decision\":\"done\",\"summary\":\"finished\"}\n```");
        let mut brain = fast_brain(&model);

        let reply = brain.decide().await.unwrap();
        assert_eq!(
            reply.decision,
            Decision::Done {
                summary: "finished".to_string()
            }
        );
    }

    #[tokio::test]
    async fn malformed_response_gets_a_repair_retry() {
        let model = FakeModel::default();
        model.push("I think I should click the button");
        model.push(r#"{"decision":"act","actions":[]}"#);
        let mut brain = fast_brain(&model);

        let reply = brain.decide().await.unwrap();
        assert_eq!(reply.decision, Decision::Act { actions: vec![] });
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_the_budget() {
        let model = FakeModel::default();
        for _ in 0..3 {
            model.push_err(ModelError::Transport("connection refused".to_string()));
        }
        let mut brain = fast_brain(&model);

        let err = brain.decide().await.unwrap_err();
        assert!(matches!(err, ModelError::Transport(_)));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn malformed_responses_exhaust_the_budget() {
        let model = FakeModel::default();
        for _ in 0..3 {
            model.push("nope");
        }
        let mut brain = fast_brain(&model);

        let err = brain.decide().await.unwrap_err();
        assert!(matches!(err, ModelError::Response(_)));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn observe_attaches_the_screenshot_and_outcome_report() {
        let model = FakeModel::default();
        let mut brain = fast_brain(&model);
        brain.start_task("open the settings");
        brain.observe(
            &obs(),
            &[ActionRecord {
                action: Action::Screenshot,
                outcome: ActionOutcome::Ok,
            }],
        );

        let last = brain.conversation.last().unwrap();
        assert_eq!(last.role, "user");
        let parts = last.content.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0]["text"].as_str().unwrap().contains("800x600"));
        assert!(
            parts[1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
    }
}

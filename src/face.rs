use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::session::{CancelFlag, SessionSnapshot};
use crate::types::ActionOutcome;

/// Events streamed to the dashboard via SSE.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Thinking,
    Step { number: usize, description: String },
    StepError { message: String },
    Turn { index: u64 },
    TaskComplete { summary: String },
    TaskCancelled,
    TaskFailed { message: String },
    TaskLimitReached { turns: usize },
    Ready,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::Thinking => Event::default().event("thinking").data("{}"),
            AgentEvent::Step {
                number,
                description,
            } => Event::default()
                .event("step")
                .data(json!({"number": number, "description": description}).to_string()),
            AgentEvent::StepError { message } => Event::default()
                .event("step_error")
                .data(json!({"message": message}).to_string()),
            AgentEvent::Turn { index } => Event::default()
                .event("turn")
                .data(json!({"index": index}).to_string()),
            AgentEvent::TaskComplete { summary } => Event::default()
                .event("task_complete")
                .data(json!({"summary": summary}).to_string()),
            AgentEvent::TaskCancelled => Event::default().event("task_cancelled").data("{}"),
            AgentEvent::TaskFailed { message } => Event::default()
                .event("task_failed")
                .data(json!({"message": message}).to_string()),
            AgentEvent::TaskLimitReached { turns } => Event::default()
                .event("task_limit")
                .data(json!({"turns": turns}).to_string()),
            AgentEvent::Ready => Event::default().event("ready").data("{}"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub cancel: CancelFlag,
    pub snapshots: watch::Receiver<Option<SessionSnapshot>>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Start the dashboard server on localhost. Returns the command receiver and
/// the event sender the orchestrator publishes to.
pub async fn start_server(
    port: u16,
    cancel: CancelFlag,
    snapshots: watch::Receiver<Option<SessionSnapshot>>,
) -> Result<(mpsc::Receiver<String>, broadcast::Sender<AgentEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        cancel,
        snapshots,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/cancel", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/session", get(session_handler))
        .route("/screenshot", get(screenshot_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    // Try the requested port, fall back to the next few if it's in use.
    let mut listener = None;
    let mut bound = port;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(format!("127.0.0.1:{p}")).await {
            Ok(l) => {
                listener = Some(l);
                bound = p;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener
        .with_context(|| format!("could not bind any port in {port}..{}", port.saturating_add(10)))?;

    info!("dashboard running at http://localhost:{bound}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("dashboard server exited: {e}");
        }
    });

    Ok((cmd_rx, event_tx))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    info!(command = %payload.command, "command received");
    let _ = state.cmd_tx.send(payload.command).await;
    "ok"
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> &'static str {
    info!("cancellation requested");
    state.cancel.set();
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

/// Read-only view of the live session. Image bytes are elided; the latest
/// frame is served by `/screenshot`.
async fn session_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.snapshots.borrow().clone();
    let Some(snapshot) = snapshot else {
        return Json(json!({"turns": []}));
    };

    let turns: Vec<Value> = snapshot
        .turns
        .iter()
        .map(|turn| {
            json!({
                "index": turn.index,
                "captured_at": turn.observation.captured_at.to_rfc3339(),
                "width": turn.observation.width,
                "height": turn.observation.height,
                "actions": turn
                    .records
                    .iter()
                    .map(|rec| {
                        let outcome = match &rec.outcome {
                            ActionOutcome::Ok => "ok".to_string(),
                            ActionOutcome::Failed(err) => format!("failed: {err}"),
                            ActionOutcome::Skipped => "skipped".to_string(),
                        };
                        json!({"action": format!("{:?}", rec.action), "outcome": outcome})
                    })
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    Json(json!({"max_turns": snapshot.max_turns, "turns": turns}))
}

async fn screenshot_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.snapshots.borrow().clone();
    match snapshot.as_ref().and_then(|s| s.latest_observation()) {
        Some(obs) => (
            [(header::CONTENT_TYPE, "image/png")],
            obs.png.as_ref().clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>deskpilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 16px 24px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
    animation: pulse 2s infinite;
  }
  header .dot.busy { background: #f59e0b; }
  @keyframes pulse {
    0%, 100% { opacity: 1; }
    50% { opacity: 0.4; }
  }
  header .spacer { flex: 1; }
  #cancel {
    background: transparent;
    color: #fca5a5;
    border: 1px solid #7f1d1d;
    border-radius: 8px;
    padding: 8px 16px;
    font-size: 13px;
    cursor: pointer;
  }
  #cancel:hover { background: #1a0a0a; }
  #cancel:disabled { opacity: 0.4; cursor: not-allowed; }
  .main {
    flex: 1;
    display: flex;
    gap: 16px;
    padding: 16px 24px;
    overflow: hidden;
  }
  .screen {
    flex: 3;
    display: flex;
    align-items: flex-start;
    justify-content: center;
    background: #05050a;
    border: 1px solid #1a1a2e;
    border-radius: 8px;
    overflow: hidden;
  }
  .screen img { max-width: 100%; max-height: 100%; }
  .screen .empty { color: #444; padding: 48px; font-size: 14px; }
  .side {
    flex: 2;
    display: flex;
    flex-direction: column;
    gap: 12px;
    min-width: 320px;
  }
  #log {
    flex: 1;
    overflow-y: auto;
    display: flex;
    flex-direction: column;
    gap: 6px;
    padding-right: 6px;
  }
  #log::-webkit-scrollbar { width: 6px; }
  #log::-webkit-scrollbar-thumb { background: #333; border-radius: 3px; }
  .entry {
    padding: 8px 12px;
    border-radius: 6px;
    font-size: 13px;
    line-height: 1.5;
  }
  .entry.user { background: #1a1a2e; border-left: 3px solid #6366f1; }
  .entry.step {
    background: #111118;
    border-left: 3px solid #3b82f6;
    font-family: 'Cascadia Code', 'Fira Code', monospace;
    font-size: 12px;
  }
  .entry.step .num { color: #6366f1; font-weight: 700; margin-right: 8px; }
  .entry.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .entry.done { background: #0a1a0a; border-left: 3px solid #22c55e; color: #86efac; }
  .entry.thinking { background: #111118; border-left: 3px solid #f59e0b; color: #fcd34d; }
  .input-area { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 10px 14px;
    color: #fff;
    font-size: 15px;
    outline: none;
  }
  #cmd:focus { border-color: #6366f1; }
  #cmd::placeholder { color: #555; }
  #cmd:disabled { opacity: 0.5; }
  #send {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 10px 20px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  #send:hover { background: #4f46e5; }
  #send:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>deskpilot</h1>
    <div class="spacer"></div>
    <button id="cancel" onclick="cancelRun()" disabled>Cancel</button>
  </header>
  <div class="main">
    <div class="screen" id="screen"><div class="empty">No screenshot yet</div></div>
    <div class="side">
      <div id="log"></div>
      <div class="input-area">
        <input type="text" id="cmd" placeholder="Tell the agent what to do..." autofocus />
        <button id="send" onclick="send()">Send</button>
      </div>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const cancelBtn = document.getElementById('cancel');
  const dot = document.getElementById('status-dot');
  const screen = document.getElementById('screen');
  let busy = false;

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function esc(s) { return s.replace(/</g, '&lt;'); }

  function setBusy(b) {
    busy = b;
    cmd.disabled = b;
    sendBtn.disabled = b;
    cancelBtn.disabled = !b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  function refreshScreenshot() {
    screen.innerHTML = '<img src="/screenshot?t=' + Date.now() + '" alt="latest screen">';
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || busy) return;
    cmd.value = '';
    addEntry('user', '<strong>You:</strong> ' + esc(text));
    setBusy(true);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  }

  async function cancelRun() {
    cancelBtn.disabled = true;
    await fetch('/cancel', {method: 'POST'});
  }

  cmd.addEventListener('keydown', e => {
    if (e.key === 'Enter') send();
  });

  const es = new EventSource('/events');

  es.addEventListener('thinking', () => addEntry('thinking', 'Thinking...'));

  es.addEventListener('step', e => {
    const d = JSON.parse(e.data);
    addEntry('step', '<span class="num">' + d.number + '</span>' + esc(d.description));
  });

  es.addEventListener('step_error', e => {
    const d = JSON.parse(e.data);
    addEntry('error', '<strong>Action failed:</strong> ' + esc(d.message));
  });

  es.addEventListener('turn', () => refreshScreenshot());

  es.addEventListener('task_complete', e => {
    const d = JSON.parse(e.data);
    addEntry('done', '<strong>Done:</strong> ' + esc(d.summary));
    setBusy(false);
  });

  es.addEventListener('task_cancelled', () => {
    addEntry('error', '<strong>Cancelled.</strong>');
    setBusy(false);
  });

  es.addEventListener('task_failed', e => {
    const d = JSON.parse(e.data);
    addEntry('error', '<strong>Task failed:</strong> ' + esc(d.message));
    setBusy(false);
  });

  es.addEventListener('task_limit', e => {
    const d = JSON.parse(e.data);
    addEntry('error', '<strong>Turn limit reached</strong> after ' + d.turns + ' turns.');
    setBusy(false);
  });

  es.addEventListener('ready', () => setBusy(false));

  // Restore turn history from the session snapshot after a page refresh.
  fetch('/session').then(r => r.json()).then(d => {
    const turns = d.turns || [];
    for (const t of turns) {
      for (const a of t.actions) {
        const cls = a.outcome === 'ok' ? 'step' : 'error';
        addEntry(cls, '<span class="num">#' + t.index + '</span>' + esc(a.action + ': ' + a.outcome));
      }
    }
    if (turns.length) refreshScreenshot();
  });

  addEntry('done', 'Agent ready. Type a command to begin.');
</script>
</body>
</html>
"##;

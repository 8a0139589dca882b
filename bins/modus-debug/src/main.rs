use std::path::PathBuf;

use anyhow::Result;
use modus_notify::{
    Action, CenterHandle, IncomingNotification, NotificationCenter, Snapshot, load_config,
};
use modus_types::{CloseReason, NotificationId, NotificationImage};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// One line of input, e.g. `{"cmd":"notify","app_name":"mail","summary":"hi"}`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Notify {
        #[serde(default)]
        app_name: String,
        #[serde(default)]
        app_icon: String,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        image_path: Option<PathBuf>,
        #[serde(default)]
        actions: Vec<ActionRequest>,
        #[serde(default = "default_timeout")]
        timeout_ms: i32,
    },
    Close {
        id: NotificationId,
        #[serde(default = "default_close_reason")]
        reason: CloseReason,
    },
    CloseAll,
    Navigate {
        delta: isize,
    },
    Pause,
    Resume,
    Invoke {
        id: NotificationId,
        action: String,
    },
    Dnd {
        enabled: bool,
    },
    ToggleDnd,
    Delete {
        id: NotificationId,
    },
    ClearHistory,
    Snapshot,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ActionRequest {
    key: String,
    #[serde(default)]
    label: String,
}

fn default_timeout() -> i32 {
    -1
}

fn default_close_reason() -> CloseReason {
    CloseReason::ClosedByCall
}

fn parse_request(line: &str) -> Option<Result<Request, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

fn incoming(
    actions: Vec<ActionRequest>,
    mut notification: IncomingNotification,
) -> IncomingNotification {
    notification.actions = actions
        .into_iter()
        .map(|action| {
            let key = action.key.clone();
            Action::new(action.key, action.label, move || {
                info!(action_key = %key, "action callback ran");
            })
        })
        .collect();
    notification
}

async fn dispatch(handle: &CenterHandle, request: Request) -> Result<()> {
    match request {
        Request::Notify {
            app_name,
            app_icon,
            summary,
            body,
            image_path,
            actions,
            timeout_ms,
        } => {
            let notification = incoming(
                actions,
                IncomingNotification {
                    app_name,
                    app_icon,
                    summary,
                    body,
                    image: image_path.map(NotificationImage::File),
                    actions: Vec::new(),
                    requested_timeout_ms: timeout_ms,
                },
            );
            let accepted = handle.notify(notification).await?;
            info!(id = %accepted.id, outcome = ?accepted.outcome, "notification accepted");
        }
        Request::Close { id, reason } => handle.close(id, reason).await?,
        Request::CloseAll => handle.close_all().await?,
        Request::Navigate { delta } => handle.navigate(delta).await?,
        Request::Pause => handle.pause_all().await?,
        Request::Resume => handle.resume_all().await?,
        Request::Invoke { id, action } => handle.invoke_action(id, action).await?,
        Request::Dnd { enabled } => handle.set_dnd(enabled).await?,
        Request::ToggleDnd => handle.toggle_dnd().await?,
        Request::Delete { id } => handle.delete_record(id).await?,
        Request::ClearHistory => handle.clear_history().await?,
        Request::Snapshot => {
            let snapshot = handle.snapshot().await?;
            println!("{}", render_snapshot(&snapshot)?);
        }
    }
    Ok(())
}

fn render_snapshot(snapshot: &Snapshot) -> Result<String> {
    let live: Vec<_> = snapshot
        .live
        .iter()
        .map(|entry| {
            serde_json::json!({
                "record": entry.record,
                "actions": entry.actions,
                "timeout_ms": entry.timeout_ms,
                "state": format!("{:?}", entry.state).to_lowercase(),
            })
        })
        .collect();

    Ok(serde_json::to_string(&serde_json::json!({
        "live": live,
        "current_index": snapshot.current_index,
        "history": snapshot.history,
        "dnd_enabled": snapshot.dnd_enabled,
        "paused": snapshot.paused,
    }))?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("modus_debug=info".parse()?))
        .init();

    let cfg = load_config();
    let (handle, center_task) = NotificationCenter::new(&cfg).spawn();

    let mut history_events = handle.subscribe_history().await?;
    let mut live_events = handle.subscribe_live().await?;
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = history_events.recv() => {
                    if history_events.take_lagged() {
                        warn!("history events were dropped, re-read the history");
                    }
                    info!(?event, "history event");
                }
                Some(event) = live_events.recv() => {
                    if live_events.take_lagged() {
                        warn!("live events were dropped, re-read the live stack");
                    }
                    info!(?event, "live event");
                }
                else => break,
            }
        }
    });

    info!(history = %cfg.history_path().display(), "modus-debug reading JSON commands from stdin");
    info!(r#"try: {{"cmd":"notify","app_name":"mail","summary":"hello"}}"#);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_request(&line) {
                    Some(Ok(request)) => dispatch(&handle, request).await?,
                    Some(Err(err)) => warn!(%err, line = %line, "ignoring malformed command"),
                    None => {}
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    drop(handle);
    let center = center_task.await?;
    event_task.abort();
    info!(
        live = center.live().len(),
        history = center.history().len(),
        "modus-debug stopped"
    );

    Ok(())
}

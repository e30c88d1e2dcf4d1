//! Scripted in-process plugins shared by the worker, pool and bridge tests.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::in_process::{InProcessBackend, PluginContext, PluginResult};
use crate::protocol::{MessageKind, WorkerMessage};
use crate::worker::{WorkerEvent, WorkerSettings};

pub(crate) fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        ready_timeout_ms: 2_000,
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 200,
        call_timeout_ms: 2_000,
        shutdown_grace_ms: 300,
        restart_base_delay_ms: 10,
        max_restart_attempts: 3,
        stable_window_ms: 60_000,
    }
}

pub(crate) fn backend() -> InProcessBackend {
    InProcessBackend::new()
        .register("echo", echo)
        .register("silent", silent)
        .register("heartbeat", heartbeat)
        .register("flatline", flatline)
        .register("stubborn", stubborn)
        .register("crash-on-start", crash_on_start)
        .register("doomed", doomed)
}

pub(crate) async fn next_event(events: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within 5s")
        .expect("event channel open")
}

/// Answers calls by method name. `ping` is deliberately never answered.
pub(crate) async fn echo(mut ctx: PluginContext) -> PluginResult {
    ctx.ready();
    let mut asked = Vec::new();
    while let Some(msg) = ctx.recv().await {
        match msg.kind {
            MessageKind::Shutdown => return Ok(0),
            MessageKind::Custom(ref tag) if tag == "permission:response" => {
                let Some(id) = msg.id.clone() else { continue };
                if asked.contains(&id) {
                    let granted = msg
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("granted"))
                        .cloned()
                        .unwrap_or(Value::Bool(false));
                    ctx.respond(id, json!({ "granted": granted, "error": msg.error }));
                }
            }
            MessageKind::Call => {
                let id = msg.id.clone().unwrap_or_default();
                let Some((method, args)) = msg.call_parts() else { continue };
                match method {
                    "echo" => {
                        ctx.respond(id, args.clone());
                    }
                    "fail" => {
                        let reason = args.as_str().unwrap_or("failed").to_string();
                        ctx.send(WorkerMessage::error_response(id, reason));
                    }
                    "ping" => {}
                    "log" => {
                        ctx.log("info", args.as_str().unwrap_or_default());
                    }
                    "notify" => {
                        ctx.send(WorkerMessage::custom("progress", args.clone()));
                    }
                    "ask" => {
                        let capability = args["capability"].as_str().unwrap_or_default();
                        let reason = args["reason"].as_str().unwrap_or_default();
                        ctx.send(WorkerMessage::permission_request(id.as_str(), capability, reason));
                        asked.push(id);
                    }
                    "env" => {
                        ctx.respond(id, json!(ctx.env_vars()));
                    }
                    "crash" => return Err("asked to crash".to_string()),
                    "exit" => return Ok(args.as_i64().unwrap_or(0) as i32),
                    other => {
                        ctx.send(WorkerMessage::error_response(id, format!("unknown method {other}")));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(0)
}

/// Never sends `ready`.
pub(crate) async fn silent(mut ctx: PluginContext) -> PluginResult {
    while ctx.recv().await.is_some() {}
    Ok(0)
}

/// Heartbeats every 20ms until shut down.
pub(crate) async fn heartbeat(mut ctx: PluginContext) -> PluginResult {
    ctx.ready();
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ctx.heartbeat();
            }
            msg = ctx.recv() => match msg {
                Some(msg) if msg.kind == MessageKind::Shutdown => return Ok(0),
                Some(_) => {}
                None => return Ok(0),
            },
        }
    }
}

/// One heartbeat, then silence. Still honours shutdown.
pub(crate) async fn flatline(mut ctx: PluginContext) -> PluginResult {
    ctx.ready();
    ctx.heartbeat();
    while let Some(msg) = ctx.recv().await {
        if msg.kind == MessageKind::Shutdown {
            return Ok(0);
        }
    }
    Ok(0)
}

/// Ignores shutdown requests.
pub(crate) async fn stubborn(mut ctx: PluginContext) -> PluginResult {
    ctx.ready();
    loop {
        if ctx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fails during initialization.
pub(crate) async fn crash_on_start(_ctx: PluginContext) -> PluginResult {
    Err("bad config".to_string())
}

/// Comes up, then crashes shortly after.
pub(crate) async fn doomed(ctx: PluginContext) -> PluginResult {
    ctx.ready();
    tokio::time::sleep(Duration::from_millis(50)).await;
    Err("fell over".to_string())
}

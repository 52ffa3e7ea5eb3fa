// agentry/src/mcp_client.rs

//! Line-delimited JSON-RPC over a child process's stdio.
//!
//! One actor task per process owns stdin and stdout. Callers talk to it over
//! an mpsc channel and get answers back on oneshot channels keyed by request
//! id, so a slow or dead provider never holds a lock anyone else needs.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::{collections::HashMap, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot, watch, Mutex},
};
use tracing::{debug, trace, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

type Reply = oneshot::Sender<Result<Value, String>>;

enum Outgoing {
    Request { method: String, params: Value, reply: Reply },
    Notify { method: String, params: Value },
    Close,
}

pub struct StdioClient {
    name: String,
    tx: mpsc::Sender<Outgoing>,
    alive: watch::Receiver<bool>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl StdioClient {
    /// Take over the piped stdio of `child` and start the actor.
    pub fn start(name: &str, mut child: Child) -> Result<Self> {
        let stdin = child.stdin.take().context("child stdin is not piped")?;
        let stdout = child.stdout.take().context("child stdout is not piped")?;
        if let Some(stderr) = child.stderr.take() {
            let provider = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "{line}");
                }
            });
        }
        let (tx, rx) = mpsc::channel(32);
        let (alive_tx, alive) = watch::channel(true);
        tokio::spawn(run_actor(name.to_string(), stdin, stdout, rx, alive_tx));
        Ok(Self { name: name.to_string(), tx, alive, pid: child.id(), child: Mutex::new(Some(child)) })
    }

    pub fn pid(&self) -> Option<u32> { self.pid }
    pub fn is_alive(&self) -> bool { *self.alive.borrow() }

    /// Resolves once the process has closed its stdout.
    pub fn exit_watch(&self) -> watch::Receiver<bool> { self.alive.clone() }

    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outgoing::Request { method: method.to_string(), params, reply })
            .await
            .map_err(|_| anyhow!("provider `{}` is no longer running", self.name))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res.map_err(|e| anyhow!("{method}: {e}")),
            Ok(Err(_)) => Err(anyhow!("provider `{}` exited before answering {method}", self.name)),
            Err(_) => Err(anyhow!("{method} timed out after {}ms", timeout.as_millis())),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.tx
            .send(Outgoing::Notify { method: method.to_string(), params })
            .await
            .map_err(|_| anyhow!("provider `{}` is no longer running", self.name))
    }

    /// MCP `initialize` exchange. Returns the server's result object.
    pub async fn initialize(&self, timeout: Duration) -> Result<Value> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "agentry", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = self.request("initialize", params, timeout).await?;
        self.notify("notifications/initialized", Value::Null).await?;
        Ok(result)
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.tx.send(Outgoing::Close).await;
        let Some(mut child) = self.child.lock().await.take() else { return; };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(provider = %self.name, %status, "provider exited"),
            Ok(Err(e)) => warn!(provider = %self.name, error = %e, "waiting for provider failed"),
            Err(_) => {
                warn!(provider = %self.name, "provider ignored shutdown; killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        // The actor notices EOF on stdout shortly after the process is gone.
        let mut alive = self.alive.clone();
        let _ = tokio::time::timeout(grace, alive.wait_for(|a| !*a)).await;
    }
}

async fn run_actor(
    name: String,
    stdin: ChildStdin,
    stdout: ChildStdout,
    mut rx: mpsc::Receiver<Outgoing>,
    alive: watch::Sender<bool>,
) {
    let mut stdin = Some(stdin);
    let mut lines = BufReader::new(stdout).lines();
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut open = true;

    loop {
        tokio::select! {
            msg = rx.recv(), if open => match msg {
                Some(Outgoing::Request { method, params, reply }) => {
                    let id = next_id;
                    next_id += 1;
                    match write_frame(&mut stdin, &frame(Some(id), &method, params)).await {
                        Ok(()) => { pending.insert(id, reply); }
                        Err(e) => { let _ = reply.send(Err(e.to_string())); }
                    }
                }
                Some(Outgoing::Notify { method, params }) => {
                    if let Err(e) = write_frame(&mut stdin, &frame(None, &method, params)).await {
                        warn!(provider = %name, error = %e, "notification not delivered");
                    }
                }
                // Closing stdin is how a stdio MCP server is asked to exit.
                Some(Outgoing::Close) => stdin = None,
                None => { open = false; stdin = None; }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(answer) = handle_line(&name, &line, &mut pending) {
                        if let Err(e) = write_frame(&mut stdin, &answer).await {
                            debug!(provider = %name, error = %e, "could not answer server request");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(provider = %name, error = %e, "reading provider stdout failed");
                    break;
                }
            },
        }
    }

    let _ = alive.send(false);
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err("provider process exited".into()));
    }
    debug!(provider = %name, "provider stdio closed");
}

fn frame(id: Option<u64>, method: &str, params: Value) -> Value {
    let mut msg = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(id) = id { msg["id"] = json!(id); }
    if !params.is_null() { msg["params"] = params; }
    msg
}

async fn write_frame(stdin: &mut Option<ChildStdin>, msg: &Value) -> Result<()> {
    let w = stdin.as_mut().context("provider stdin is closed")?;
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Route one line from the server. Returns a frame to send back when the server asked us something.
fn handle_line(name: &str, line: &str, pending: &mut HashMap<u64, Reply>) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() { return None; }
    let msg: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            debug!(provider = %name, "ignoring non JSON-RPC output: {line}");
            return None;
        }
    };

    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        let id = msg.get("id")?.clone();
        trace!(provider = %name, method, "server request");
        return Some(if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32601, "message": format!("method not found: {method}") } })
        });
    }

    let id = msg.get("id").and_then(Value::as_u64)?;
    let Some(reply) = pending.remove(&id) else {
        debug!(provider = %name, id, "response for unknown request id");
        return None;
    };
    let outcome = match (msg.get("result"), msg.get("error")) {
        (_, Some(err)) => Err(err.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string()),
        (Some(result), None) => Ok(result.clone()),
        (None, None) => Err("malformed response".to_string()),
    };
    let _ = reply.send(outcome);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_complete_the_matching_request() {
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(7, tx);
        assert!(handle_line("p", r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#, &mut pending).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"ok": true}));
        assert!(pending.is_empty());
    }

    #[test]
    fn error_responses_carry_the_message() {
        let mut pending = HashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(1, tx);
        handle_line("p", r#"{"jsonrpc":"2.0","id":1,"error":{"code":-1,"message":"boom"}}"#, &mut pending);
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), "boom");
    }

    #[test]
    fn server_ping_is_answered_and_unknown_requests_refused() {
        let mut pending = HashMap::new();
        let pong = handle_line("p", r#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#, &mut pending).unwrap();
        assert_eq!(pong["id"], "a");
        assert_eq!(pong["result"], json!({}));
        let refused = handle_line("p", r#"{"jsonrpc":"2.0","id":3,"method":"sampling/createMessage"}"#, &mut pending).unwrap();
        assert_eq!(refused["error"]["code"], -32601);
        // Notifications need no answer.
        assert!(handle_line("p", r#"{"jsonrpc":"2.0","method":"notifications/message"}"#, &mut pending).is_none());
    }

    #[test]
    fn noise_on_stdout_is_ignored() {
        let mut pending = HashMap::new();
        assert!(handle_line("p", "Server listening on stdio", &mut pending).is_none());
    }

    #[test]
    fn frames_omit_null_params() {
        let n = frame(None, "notifications/initialized", Value::Null);
        assert!(n.get("params").is_none());
        assert!(n.get("id").is_none());
        let r = frame(Some(0), "initialize", json!({"a": 1}));
        assert_eq!(r["id"], 0);
        assert_eq!(r["params"]["a"], 1);
    }
}

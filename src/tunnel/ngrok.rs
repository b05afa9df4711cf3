use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, trace};

use super::{TunnelProvider, TunnelSession};
use crate::error::SyncError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the `ngrok` agent as a child process, one process per session.
pub struct NgrokProvider {
    binary: String,
    lifetime: Duration,
}

impl NgrokProvider {
    pub fn new(binary: String, lifetime: Duration) -> Self {
        Self { binary, lifetime }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LogLine {
    Started(String),
    Fatal(String),
    Other,
}

/// ngrok with `--log-format json` prints one object per line; the public URL
/// arrives on the "started tunnel" line.
fn parse_log_line(line: &str) -> LogLine {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return LogLine::Other;
    };
    let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default();
    let lvl = value.get("lvl").and_then(Value::as_str).unwrap_or_default();
    if lvl == "crit" || lvl == "eror" {
        let err = value
            .get("err")
            .and_then(Value::as_str)
            .unwrap_or(msg)
            .to_string();
        return LogLine::Fatal(err);
    }
    match value.get("url").and_then(Value::as_str) {
        Some(url) if msg == "started tunnel" && url.starts_with("https://") => {
            LogLine::Started(url.to_string())
        }
        _ => LogLine::Other,
    }
}

pub struct NgrokSession {
    child: Child,
    url: String,
}

#[async_trait]
impl TunnelSession for NgrokSession {
    fn public_url(&self) -> &str {
        &self.url
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.child
            .kill()
            .await
            .map_err(|e| SyncError::io("stop ngrok", e))
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    async fn open(&self, port: u16) -> Result<Box<dyn TunnelSession>, SyncError> {
        let mut child = tokio::process::Command::new(&self.binary)
            .args(["http", &port.to_string(), "--log", "stdout", "--log-format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::io(format!("spawn {}", self.binary), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Network("ngrok stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let startup = tokio::time::timeout(STARTUP_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                match parse_log_line(&line) {
                    LogLine::Started(url) => return Ok(Ok(url)),
                    LogLine::Fatal(err) => return Ok(Err(err)),
                    LogLine::Other => trace!(target: "ngrok", "{line}"),
                }
            }
            Ok::<_, std::io::Error>(Err("ngrok exited before opening a tunnel".to_string()))
        })
        .await;

        let url = match startup {
            Ok(Ok(Ok(url))) => url,
            Ok(Ok(Err(reason))) => {
                let _ = child.kill().await;
                return Err(SyncError::Network(reason));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(SyncError::io("read ngrok output", e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SyncError::Timeout("ngrok did not report a tunnel url".into()));
            }
        };
        debug!(%url, "ngrok tunnel started");

        // Keep draining the log so the agent never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(target: "ngrok", "{line}");
            }
        });

        Ok(Box::new(NgrokSession { child, url }))
    }

    fn session_lifetime(&self) -> Option<Duration> {
        Some(self.lifetime)
    }
}

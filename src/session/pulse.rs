//! PulseAudio / PipeWire backend driven through `pactl`
//!
//! Discovers the default sink (`master`), the default source (`mic`) and one
//! session per sink input keyed by its `application.process.binary`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    DeviceChangeCallback, Discovery, Session, SessionError, SessionFinder, INPUT_SESSION_NAME,
    MASTER_SESSION_NAME,
};

/// PulseAudio's 100% volume
const PA_VOLUME_NORM: f32 = 65536.0;

const DEFAULT_SINK: &str = "@DEFAULT_SINK@";
const DEFAULT_SOURCE: &str = "@DEFAULT_SOURCE@";

static PERCENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)%").expect("valid percent regex"));

static DEVICE_EVENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Event '(new|remove|change)' on (sink|source|server) #?\d*")
        .expect("valid event regex")
});

/// Finder backed by the `pactl` command-line tool
pub struct PulseSessionFinder {
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl PulseSessionFinder {
    pub fn new() -> Self {
        Self {
            subscription: Mutex::new(None),
        }
    }

    async fn master_session(&self, kind: EndpointKind) -> Result<Arc<dyn Session>, SessionError> {
        let volume = kind.read_volume().await?;
        let session = PulseSession {
            key: kind.key().to_string(),
            target: PulseTarget::Endpoint(kind),
            last_volume: Mutex::new(volume),
        };
        debug!("Created audio session instance {:?}", session);
        Ok(Arc::new(session))
    }

    async fn sink_input_sessions(&self) -> Result<Vec<Arc<dyn Session>>, SessionError> {
        let inputs = list_sink_inputs().await?;

        let mut sessions: Vec<Arc<dyn Session>> = Vec::with_capacity(inputs.len());
        for info in inputs {
            let Some(binary) = info
                .properties
                .get("application.process.binary")
                .and_then(|v| v.as_str())
            else {
                warn!("Missing process name for sink input {}", info.index);
                continue;
            };

            let session = PulseSession {
                key: binary.to_lowercase(),
                target: PulseTarget::SinkInput(info.index),
                last_volume: Mutex::new(info.average_volume()),
            };
            debug!("Created audio session instance {:?}", session);
            sessions.push(Arc::new(session));
        }

        Ok(sessions)
    }
}

impl Default for PulseSessionFinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFinder for PulseSessionFinder {
    fn name(&self) -> &str {
        "pulse"
    }

    async fn get_all_sessions(&self) -> Result<Discovery, SessionError> {
        let mut discovery = Discovery::default();

        for kind in [EndpointKind::Sink, EndpointKind::Source] {
            match self.master_session(kind).await {
                Ok(session) => discovery.sessions.push(session),
                Err(e) => {
                    warn!("Failed to get master {} session: {}", kind.noun(), e);
                    discovery.errors.push(e);
                }
            }
        }

        match self.sink_input_sessions().await {
            Ok(mut sessions) => discovery.sessions.append(&mut sessions),
            Err(e) => {
                warn!("Failed to enumerate audio sessions: {}", e);
                discovery.errors.push(e);
            }
        }

        if discovery.sessions.is_empty() && !discovery.errors.is_empty() {
            return Err(discovery.errors.remove(0));
        }

        Ok(discovery)
    }

    async fn release(&self) -> Result<(), SessionError> {
        if let Some(task) = self.subscription.lock().take() {
            task.abort();
        }
        debug!("Released PA session finder instance");
        Ok(())
    }

    fn subscribe_device_changes(&self, callback: DeviceChangeCallback) {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            return;
        }

        *slot = Some(tokio::spawn(async move {
            let child = Command::new("pactl")
                .arg("subscribe")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    warn!("Failed to subscribe to PulseAudio events: {}", e);
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                return;
            };

            info!("Listening for PulseAudio device changes");
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_device_event(&line) {
                    debug!("PulseAudio device change: {}", line);
                    callback();
                }
            }

            debug!("PulseAudio event subscription ended");
        }));
    }
}

/// Master endpoints addressed through the default sink/source aliases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Sink,
    Source,
}

impl EndpointKind {
    fn key(self) -> &'static str {
        match self {
            EndpointKind::Sink => MASTER_SESSION_NAME,
            EndpointKind::Source => INPUT_SESSION_NAME,
        }
    }

    fn noun(self) -> &'static str {
        match self {
            EndpointKind::Sink => "sink",
            EndpointKind::Source => "source",
        }
    }

    async fn read_volume(self) -> Result<f32, SessionError> {
        let output = match self {
            EndpointKind::Sink => pactl(&["get-sink-volume", DEFAULT_SINK]).await?,
            EndpointKind::Source => pactl(&["get-source-volume", DEFAULT_SOURCE]).await?,
        };
        parse_percent_volume(&output)
    }
}

#[derive(Debug)]
enum PulseTarget {
    Endpoint(EndpointKind),
    SinkInput(u32),
}

/// Session addressed by a `pactl` target
///
/// Volumes are read live; `last_volume` is only the fallback when a read
/// fails.
#[derive(Debug)]
pub struct PulseSession {
    key: String,
    target: PulseTarget,
    last_volume: Mutex<f32>,
}

#[async_trait]
impl Session for PulseSession {
    fn key(&self) -> &str {
        &self.key
    }

    async fn volume(&self) -> f32 {
        let live = match self.target {
            PulseTarget::Endpoint(kind) => kind.read_volume().await,
            PulseTarget::SinkInput(index) => read_sink_input_volume(index).await,
        };

        match live {
            Ok(v) => *self.last_volume.lock() = v,
            Err(e) => warn!("Failed to get session volume for {}: {}", self.key, e),
        }
        *self.last_volume.lock()
    }

    async fn set_volume(&self, v: f32) -> Result<(), SessionError> {
        let percent = format_percent(v);
        match self.target {
            PulseTarget::Endpoint(EndpointKind::Sink) => {
                pactl(&["set-sink-volume", DEFAULT_SINK, &percent]).await?
            }
            PulseTarget::Endpoint(EndpointKind::Source) => {
                pactl(&["set-source-volume", DEFAULT_SOURCE, &percent]).await?
            }
            PulseTarget::SinkInput(index) => {
                pactl(&["set-sink-input-volume", &index.to_string(), &percent])
                    .await
                    .map_err(|e| match e {
                        SessionError::Backend(msg) if msg.contains("No such entity") => {
                            SessionError::Gone(self.key.clone())
                        }
                        other => other,
                    })?
            }
        };

        *self.last_volume.lock() = v;
        debug!("Adjusting session volume {} to {:.2}", self.key, v);
        Ok(())
    }

    fn release(&self) {
        debug!("Releasing audio session {}", self.key);
    }
}

#[derive(Debug, Deserialize)]
struct SinkInputInfo {
    index: u32,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    volume: HashMap<String, ChannelVolume>,
}

#[derive(Debug, Deserialize)]
struct ChannelVolume {
    value: u32,
}

impl SinkInputInfo {
    fn average_volume(&self) -> f32 {
        if self.volume.is_empty() {
            return 0.0;
        }
        let total: f32 = self.volume.values().map(|c| c.value as f32).sum();
        total / self.volume.len() as f32 / PA_VOLUME_NORM
    }
}

async fn list_sink_inputs() -> Result<Vec<SinkInputInfo>, SessionError> {
    let output = pactl(&["-f", "json", "list", "sink-inputs"]).await?;
    parse_sink_inputs(&output)
}

fn parse_sink_inputs(output: &str) -> Result<Vec<SinkInputInfo>, SessionError> {
    serde_json::from_str(output).map_err(|e| SessionError::Parse(e.to_string()))
}

async fn read_sink_input_volume(index: u32) -> Result<f32, SessionError> {
    let inputs = list_sink_inputs().await?;
    sink_input_volume(&inputs, index)
}

/// Current volume of one sink input, `Gone` once the stream has ended
fn sink_input_volume(inputs: &[SinkInputInfo], index: u32) -> Result<f32, SessionError> {
    inputs
        .iter()
        .find(|info| info.index == index)
        .map(SinkInputInfo::average_volume)
        .ok_or_else(|| SessionError::Gone(format!("sink input #{}", index)))
}

async fn pactl(args: &[&str]) -> Result<String, SessionError> {
    let output = Command::new("pactl").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SessionError::Backend(format!(
            "pactl {}: {}",
            args.join(" "),
            stderr
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Average every `NN%` channel figure in `pactl get-*-volume` output
fn parse_percent_volume(output: &str) -> Result<f32, SessionError> {
    let percents: Vec<f32> = PERCENT_PATTERN
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<f32>().ok())
        .collect();

    if percents.is_empty() {
        return Err(SessionError::Parse(format!(
            "no volume found in '{}'",
            output.trim()
        )));
    }

    let average = percents.iter().sum::<f32>() / percents.len() as f32;
    Ok(average / 100.0)
}

fn format_percent(v: f32) -> String {
    format!("{:.0}%", (v.clamp(0.0, 1.0) * 100.0).round())
}

fn is_device_event(line: &str) -> bool {
    DEVICE_EVENT_PATTERN.is_match(line)
}

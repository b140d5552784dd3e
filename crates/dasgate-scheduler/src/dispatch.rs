//! Output dispatch — routes a resolved payload to exactly one sink.
//!
//! External transports (email, SMS, streams, MQTT, telnet, I2C) are opaque
//! sinks handed in by the host. FILE, LOG and SYSTEM output are handled here;
//! MANAGER payloads are parsed and handed back to the manager to execute.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{TaskError, TaskResult};
use crate::tasks::{Output, OutputKind, TaskRef};

const SMS_LIMIT: usize = 150;

/// Attempt-delivery contract shared by every external transport.
pub trait OutputSink: Send + Sync {
    fn deliver(&self, reference: &str, payload: &str) -> bool;
}

/// A stream confirmation the host must report back on `reply_to`.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    /// Manager id, for the sink's own log lines.
    pub owner: String,
    pub key: TaskRef,
    pub stream: String,
    pub payload: String,
    pub expected_reply: String,
    pub interval: Duration,
    pub retries: u32,
    pub reply_to: UnboundedSender<Confirmation>,
}

/// Result of a confirmation, correlated by task address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub key: TaskRef,
    pub success: bool,
}

/// Serial/TCP streams.
pub trait StreamSink: Send + Sync {
    fn write(&self, stream: &str, payload: &str) -> bool;
    /// Send `payload` and watch for `expected_reply`. False when refused.
    fn register_confirmation(&self, request: ConfirmRequest) -> bool;
}

pub trait StreamHealth: Send + Sync {
    fn is_healthy(&self, stream: &str) -> bool;
}

/// Sink handles, keyed by output kind.
#[derive(Clone, Default)]
pub struct Sinks {
    outputs: HashMap<OutputKind, Arc<dyn OutputSink>>,
    stream: Option<Arc<dyn StreamSink>>,
    health: Option<Arc<dyn StreamHealth>>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: OutputKind, sink: Arc<dyn OutputSink>) -> Self {
        self.outputs.insert(kind, sink);
        self
    }

    pub fn with_stream(mut self, sink: Arc<dyn StreamSink>) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn with_health(mut self, health: Arc<dyn StreamHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn get(&self, kind: OutputKind) -> Option<&Arc<dyn OutputSink>> {
        self.outputs.get(&kind)
    }

    /// No provider means every stream counts as healthy.
    pub fn stream_healthy(&self, stream: &str) -> bool {
        self.health.as_ref().is_none_or(|h| h.is_healthy(stream))
    }
}

/// A MANAGER payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    RaiseFlag(String),
    LowerFlag(String),
    Start(String),
    Stop(String),
    RunMember { set: String, task: String },
}

impl ManagerCommand {
    pub fn parse(payload: &str) -> TaskResult<Self> {
        let (head, arg) = payload
            .trim()
            .split_once(':')
            .ok_or_else(|| TaskError::Config(format!("manager command '{payload}' needs ':'")))?;
        let arg = arg.trim().to_string();
        if arg.is_empty() {
            return Err(TaskError::Config(format!("manager command '{payload}' has no argument")));
        }
        Ok(match head.trim().to_lowercase().as_str() {
            "raiseflag" => Self::RaiseFlag(arg),
            "lowerflag" => Self::LowerFlag(arg),
            "start" => Self::Start(arg),
            "stop" => Self::Stop(arg),
            set => Self::RunMember {
                set: set.to_string(),
                task: arg,
            },
        })
    }
}

/// What a dispatch achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Sent,
    /// Handed to the stream sink; the outcome arrives as a [`Confirmation`].
    AwaitingReply,
    /// For the manager to carry out.
    Manager(ManagerCommand),
}

/// Routes payloads by output kind.
#[derive(Clone)]
pub struct Dispatcher {
    id: String,
    sinks: Sinks,
    base_dir: PathBuf,
    admin: String,
}

impl Dispatcher {
    pub fn new(id: &str, sinks: Sinks, admin: &str) -> Self {
        Self {
            id: id.to_string(),
            sinks,
            base_dir: PathBuf::from("."),
            admin: admin.to_string(),
        }
    }

    /// Relative FILE references resolve against this directory.
    pub fn set_base_dir(&mut self, dir: &Path) {
        self.base_dir = dir.to_path_buf();
    }

    pub fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    /// Deliver one resolved payload.
    pub fn dispatch(
        &self,
        key: &TaskRef,
        output: &Output,
        payload: &str,
        reply_to: &UnboundedSender<Confirmation>,
    ) -> TaskResult<Delivery> {
        let reference = output.reference.as_str();
        match output.kind {
            OutputKind::File => self.append_file(reference, payload).map(|_| Delivery::Sent),
            OutputKind::Log => {
                self.log(reference, payload);
                Ok(Delivery::Sent)
            }
            OutputKind::System => {
                tracing::debug!("[{}] 🖥️ {key}: {payload}", self.id);
                Ok(Delivery::Sent)
            }
            OutputKind::Manager => ManagerCommand::parse(payload).map(Delivery::Manager),
            OutputKind::Email => self.email(key, reference, payload),
            OutputKind::Sms => {
                let text = payload.rsplit(';').next().unwrap_or(payload).trim();
                self.external(OutputKind::Sms, reference, truncate(text, SMS_LIMIT))
            }
            OutputKind::Stream => self.stream(key, output, payload, reply_to),
            kind @ (OutputKind::Mqtt | OutputKind::Telnet | OutputKind::I2c) => {
                self.external(kind, reference, payload)
            }
        }
    }

    fn external(&self, kind: OutputKind, reference: &str, payload: &str) -> TaskResult<Delivery> {
        let sink = self
            .sinks
            .get(kind)
            .ok_or_else(|| TaskError::Delivery(format!("no {kind} sink")))?;
        if sink.deliver(reference, payload) {
            Ok(Delivery::Sent)
        } else {
            Err(TaskError::Delivery(format!("{kind} sink refused '{reference}'")))
        }
    }

    fn email(&self, key: &TaskRef, reference: &str, payload: &str) -> TaskResult<Delivery> {
        let payload = if payload.contains(';') {
            payload.to_string()
        } else {
            format!("{key};{payload}")
        };
        let recipients: Vec<&str> = reference
            .split(';')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(TaskError::Delivery("email without recipient".into()));
        }
        for recipient in recipients {
            self.external(OutputKind::Email, recipient, &payload)?;
        }
        Ok(Delivery::Sent)
    }

    fn stream(
        &self,
        key: &TaskRef,
        output: &Output,
        payload: &str,
        reply_to: &UnboundedSender<Confirmation>,
    ) -> TaskResult<Delivery> {
        let stream_id = output.reference.as_str();
        if !self.sinks.stream_healthy(stream_id) {
            return Err(TaskError::Delivery(format!("stream '{stream_id}' is down")));
        }
        let sink = self
            .sinks
            .stream
            .as_ref()
            .ok_or_else(|| TaskError::Delivery("no stream sink".into()))?;
        match &output.reply {
            Some(reply) => {
                let request = ConfirmRequest {
                    owner: self.id.clone(),
                    key: key.clone(),
                    stream: stream_id.to_string(),
                    payload: payload.to_string(),
                    expected_reply: reply.expected.clone(),
                    interval: reply.interval,
                    retries: reply.retries,
                    reply_to: reply_to.clone(),
                };
                if sink.register_confirmation(request) {
                    Ok(Delivery::AwaitingReply)
                } else {
                    Err(TaskError::Delivery(format!(
                        "stream '{stream_id}' refused the confirmation"
                    )))
                }
            }
            None if sink.write(stream_id, payload) => Ok(Delivery::Sent),
            None => Err(TaskError::Delivery(format!("write to '{stream_id}' failed"))),
        }
    }

    fn append_file(&self, reference: &str, payload: &str) -> TaskResult<()> {
        if reference.is_empty() {
            return Err(TaskError::Delivery("file output without a path".into()));
        }
        let path = Path::new(reference);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TaskError::Delivery(format!("{}: {e}", parent.display())))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TaskError::Delivery(format!("{}: {e}", path.display())))?;
        writeln!(file, "{payload}")
            .map_err(|e| TaskError::Delivery(format!("{}: {e}", path.display())))
    }

    fn log(&self, level: &str, payload: &str) {
        let (device, message) = payload.split_once(';').unwrap_or(("-", payload));
        let (device, message) = (device.trim(), message.trim());
        match level.trim().to_lowercase().as_str() {
            "warn" | "warning" => tracing::warn!("[{}] ⚠️ {device}: {message}", self.id),
            "error" => {
                tracing::error!("[{}] ❌ {device}: {message}", self.id);
                self.alert(&format!("Error from {device}"), message);
            }
            _ => tracing::info!("[{}] 📝 {device}: {message}", self.id),
        }
    }

    /// Mail the admin, when an email sink exists.
    pub fn alert(&self, subject: &str, body: &str) {
        if let Some(mail) = self.sinks.get(OutputKind::Email)
            && !mail.deliver(&self.admin, &format!("{subject};{body}"))
        {
            tracing::warn!("[{}] ⚠️ Could not mail alert '{subject}'", self.id);
        }
    }
}

/// At most `max` characters, cut on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

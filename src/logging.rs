// SPDX-License-Identifier: GPL-3.0-only

//! Log stream shared by the daemon and attached `logs` clients
//!
//! Every tracing event in the daemon is mirrored into a [`LogBus`]: a bounded
//! history ring plus a broadcast channel. Clients replay the history and then
//! follow the broadcast until they detach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One formatted log event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogLine {
    pub fn new(level: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}: {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level,
            self.target,
            self.message
        )
    }
}

struct LogBusInner {
    history: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    sender: broadcast::Sender<LogLine>,
}

/// Append-only log stream with bounded replay
#[derive(Clone)]
pub struct LogBus {
    inner: Arc<LogBusInner>,
}

impl fmt::Debug for LogBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBus")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity * 4);
        Self {
            inner: Arc::new(LogBusInner {
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                sender,
            }),
        }
    }

    pub fn publish(&self, line: LogLine) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() == self.inner.capacity {
            history.pop_front();
        }
        history.push_back(line.clone());
        // Sent under the history lock so subscribers see no gap or duplicate
        let _ = self.inner.sender.send(line);
    }

    /// Snapshot of the history plus a receiver for everything after it
    pub fn subscribe(&self) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let receiver = self.inner.sender.subscribe();
        (history.iter().cloned().collect(), receiver)
    }

    /// Last `lines` entries of the history
    pub fn recent(&self, lines: usize) -> Vec<LogLine> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = history.len().saturating_sub(lines);
        history.iter().skip(skip).cloned().collect()
    }
}

/// Collects the `message` field and any structured fields of an event
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<String>,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Tracing layer mirroring events into a [`LogBus`]
pub struct LogBusLayer {
    bus: LogBus,
}

impl LogBusLayer {
    pub fn new(bus: LogBus) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for LogBusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.bus.publish(LogLine::new(
            metadata.level().to_string(),
            metadata.target(),
            visitor.finish(),
        ));
    }
}

/// Initialise the global subscriber
///
/// `RUST_LOG` overrides `default_filter`. With a bus, events that pass the
/// filter are also published for `logs` clients.
pub fn init(default_filter: &str, bus: Option<LogBus>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .with(bus.map(LogBusLayer::new))
        .try_init();
}

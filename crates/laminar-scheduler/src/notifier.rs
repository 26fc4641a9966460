//! Fan-out of lifecycle events and log chunks to subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use laminar_core::event::Event;
use tokio::sync::mpsc;
use tracing::warn;

/// What a subscriber is watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// The front page; receives every lifecycle event.
    Home,
    /// The all-jobs page; receives every lifecycle event.
    All,
    /// One job; receives that job's lifecycle events.
    Job { name: String },
    /// One run; receives its lifecycle events and its log chunks.
    Run { name: String, number: i64 },
}

impl Scope {
    fn admits_event(&self, name: &str, number: i64) -> bool {
        match self {
            Scope::Home | Scope::All => true,
            Scope::Job { name: n } => n == name,
            Scope::Run { name: n, number: b } => n == name && *b == number,
        }
    }

    fn admits_log(&self, name: &str, number: i64) -> bool {
        matches!(self, Scope::Run { name: n, number: b } if n == name && *b == number)
    }
}

/// One frame delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A serialized lifecycle event, `{"type": ..., "data": {...}}`.
    Event(Arc<str>),
    /// A log chunk; `complete` marks the end-of-stream sentinel.
    Log { name: String, number: i64, chunk: Bytes, complete: bool },
}

/// A registered subscription: the id to unsubscribe with and the frame
/// stream.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

struct Subscriber {
    scope: Scope,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Routes frames to subscribers by scope. Delivery per subscriber is
/// in registration-call order, so for a given run no log chunk can
/// arrive after its completion event.
#[derive(Default)]
pub(crate) struct Notifier {
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
}

impl Notifier {
    pub fn subscribe(&mut self, scope: Scope) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, Subscriber { scope, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn notify_event(&mut self, event: &Event) {
        let json: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                return;
            }
        };
        let (name, number) = (event.job_name().to_string(), event.number());
        self.fan_out(
            |scope| scope.admits_event(&name, number),
            || Frame::Event(json.clone()),
        );
    }

    pub fn notify_log(&mut self, name: &str, number: i64, chunk: Bytes, complete: bool) {
        self.fan_out(
            |scope| scope.admits_log(name, number),
            || Frame::Log {
                name: name.to_string(),
                number,
                chunk: chunk.clone(),
                complete,
            },
        );
    }

    /// Send to admitted subscribers, dropping the ones that hung up.
    fn fan_out(&mut self, admits: impl Fn(&Scope) -> bool, frame: impl Fn() -> Frame) {
        self.subscribers
            .retain(|_, sub| !admits(&sub.scope) || sub.tx.send(frame()).is_ok());
    }
}

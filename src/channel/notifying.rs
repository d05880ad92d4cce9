use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering::Relaxed},
    };
use parking_lot::Mutex;
use log::*;

use crate::{
    classify::UrcShape,
    status::{self, ProtocolError},
    };
use super::Channel;


/// origin of a [Notification]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// line pushed by the modem on its own, or not claimed by the pending command
    Unsolicited,
    /// the upload prompt
    Prompt,
    /// final status line arriving with no command pending, like the late reply of a timed out command
    Status,
}

/// lines not claimed by any command, delivered together to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// raw lines, at least one
    pub lines: Vec<String>,
    /// final status of a command given up earlier, never set for other kinds
    pub late: bool,
}
impl Notification {
    pub(crate) fn new(kind: NotificationKind, line: String) -> Self {
        Self {kind, lines: vec![line], late: false}
    }
    /// first line, identifying the notification
    pub fn line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }
    pub fn is_prompt(&self) -> bool {
        self.kind == NotificationKind::Prompt
    }
    /// failure reported by a status notification
    pub fn error(&self) -> Option<ProtocolError> {
        match self.kind {
            NotificationKind::Status => status::classify(self.line()),
            _ => None,
        }
    }
}


/// handle of a registered callback, give it back to [Channel::unsubscribe] to stop receiving notifications
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// ordered registry of notification callbacks
#[derive(Default)]
pub(super) struct Subscribers {
    callbacks: Mutex<Vec<(Subscription, Callback)>>,
    next: AtomicU64,
}
impl Subscribers {
    fn add(&self, callback: Callback) -> Subscription {
        let subscription = Subscription(self.next.fetch_add(1, Relaxed));
        self.callbacks.lock().push((subscription, callback));
        subscription
    }
    fn remove(&self, subscription: Subscription) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(s, _)| *s != subscription);
        callbacks.len() != before
    }
    /// call every callback in registration order
    pub(super) fn dispatch(&self, notification: &Notification) {
        // callbacks are called without lock so they can subscribe or unsubscribe
        let callbacks = self.callbacks.lock().iter()
            .map(|(_, callback)| callback.clone())
            .collect::<Vec<_>>();
        trace!("dispatching {:?} to {} subscribers", notification, callbacks.len());
        for callback in callbacks {
            callback(notification);
        }
    }
}

/// notification waiting for its trailing payload lines
#[derive(Debug)]
pub(super) struct Group {
    pub notification: Notification,
    pub remaining: usize,
}
impl Group {
    /// start grouping if the notification's shape announces trailing lines
    pub fn start(notification: Notification, shape: Option<&UrcShape>) -> Result<Self, Notification> {
        match shape {
            Some(shape) if shape.trailing > 0 => Ok(Self {notification, remaining: shape.trailing}),
            _ => Err(notification),
        }
    }
    /// append a payload line, returns true once the last one is received
    pub fn push(&mut self, line: String) -> bool {
        self.notification.lines.push(line);
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}


impl Channel {
    /**
        register a callback for every notification

        callbacks are called in registration order by the [Channel::run] coroutine, they must return quickly and never wait on the channel
    */
    pub fn subscribe(&self, callback: impl Fn(&Notification) + Send + Sync + 'static) -> Subscription {
        self.subscribers.add(Arc::new(callback))
    }
    /// remove a callback, returns false if it was not registered
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.subscribers.remove(subscription)
    }
    /// recognize an additional unsolicited notification
    pub fn register_urc(&self, shape: UrcShape) {
        self.state.lock().urcs.push(shape);
    }
}

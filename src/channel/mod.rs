/*!
    asynchronous AT-command channel in `std` environment.

    The central resource is the [Channel] struct which owns the transport and multiplexes it between

    - command/response exchanges, issued with [Channel::execute] and the convenience methods of [requests]
    - unsolicited notifications pushed by the modem, delivered to callbacks registered with [Channel::subscribe]
    - raw payload uploads, started by a command and released by the modem's upload prompt, see [Channel::begin_upload]

    [Channel::run] is the coroutine ingesting bytes from the modem, it **must** be running for any exchange to complete.
*/

/// command correlation and bytes ingestion, this is the tricky part of the code
mod correlating;
/// delivery of unsolicited notifications
mod notifying;
/// raw payload transfers
mod uploading;
/// command requests and their responses
pub mod requests;


pub use correlating::Channel;
pub use notifying::{Notification, NotificationKind, Subscription};
pub use uploading::{UploadOptions, UploadResult, UploadState};
pub use requests::{Request, Response};

use std::time::Duration;
use thiserror::Error;
use crate::{
    classify::{UrcShape, default_urcs},
    lines::{PROMPT, MAX_LINE},
    status::ProtocolError,
    };

/// error regarding the modem channel
#[derive(Error, Debug)]
pub enum Error {
    #[error("problem with serial transport")]
    Transport(#[from] std::io::Error),
    #[error("channel is closed")]
    Closed,
    #[error("channel is already running")]
    Running,
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
    #[error("modem reported a failure")]
    Protocol(#[from] ProtocolError),
    #[error("no final status arrived in expected time")]
    Timeout,
    #[error("modem did not wake up after {attempts} attempts")]
    WakeUp {attempts: usize},
}


/// settings of the protocol running on the transport
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// appended to every command text
    pub terminator: &'static str,
    /// timeout of requests not specifying theirs
    pub default_timeout: Duration,
    /// maximum time waiting for the reply of a timed out request before sending the next one
    pub settle: Duration,
    /// upload prompt sentinel
    pub prompt: u8,
    /// expected maximum line length, longer lines are reported with a warning
    pub max_line: usize,
    /// recognized unsolicited notifications
    pub urcs: Vec<UrcShape>,
}
impl ChannelConfig {
    pub fn terminator(mut self, terminator: &'static str) -> Self {
        self.terminator = terminator;
        self
    }
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
    pub fn prompt(mut self, prompt: u8) -> Self {
        self.prompt = prompt;
        self
    }
    pub fn max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }
    pub fn urc(mut self, shape: UrcShape) -> Self {
        self.urcs.push(shape);
        self
    }
}
impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            terminator: "\r",
            default_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(500),
            prompt: PROMPT,
            max_line: MAX_LINE,
            urcs: default_urcs(),
        }
    }
}

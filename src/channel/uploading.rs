use std::time::Duration;
use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    time::timeout,
    };
use log::*;

use crate::status::ProtocolError;
use super::{
    Channel, Error, Subscription,
    requests::Request,
    };


/// smallest reception buffer among supported modems
pub const CHUNK_SIZE: usize = 64;
/// pause after each chunk, for the modem to drain its reception buffer
pub const CHUNK_DELAY: Duration = Duration::from_millis(10);

/// settings of a raw upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOptions {
    /// maximum wait for the upload prompt after the initiating command
    pub prompt_timeout: Duration,
    /// bytes written at once
    pub chunk_size: usize,
    /// pause after each chunk
    pub chunk_delay: Duration,
}
impl UploadOptions {
    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}
impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_secs(5),
            chunk_size: CHUNK_SIZE,
            chunk_delay: CHUNK_DELAY,
        }
    }
}

/// progress of an upload session
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    /// initiating command sent, waiting for the prompt
    AwaitingPrompt,
    /// writing the payload
    Sending,
    /// payload completely written
    Done,
    /// no prompt in time, nothing written
    TimedOut,
    /// the modem answered the initiating command with a failure instead of the prompt, nothing written
    Rejected,
    /// a write failed while sending, the payload is partially written
    Aborted,
}

/// outcome of [Channel::begin_upload]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    /// true if the payload was completely written
    pub success: bool,
    /// final state of the session
    pub state: UploadState,
    /// number of payload bytes written
    pub written: usize,
    /// failure reported by the modem when rejected
    pub error: Option<ProtocolError>,
}

/// session state and its transitions
struct Session {
    state: UploadState,
    written: usize,
}
impl Session {
    fn enter(&mut self, state: UploadState) {
        debug!("upload {:?} -> {:?}", self.state, state);
        self.state = state;
    }
    fn finish(mut self, state: UploadState, error: Option<ProtocolError>) -> UploadResult {
        self.enter(state);
        UploadResult {
            success: state == UploadState::Done,
            state,
            written: self.written,
            error,
        }
    }
}

/// unsubscribe when dropped, even if the upload is cancelled
struct Unsubscribe<'c> {
    channel: &'c Channel,
    subscription: Subscription,
}
impl Drop for Unsubscribe<'_> {
    fn drop(&mut self) {
        self.channel.unsubscribe(self.subscription);
    }
}


impl Channel {
    /**
        send a command starting a raw upload, then write the payload once the modem prompts for it

        the command is not waited for a final status: the modem answers it with the prompt, upon which the payload is written by chunks with a pause after each one. If the prompt does not come in time, nothing is written.

        a failing write aborts the upload and is returned as error, the written part is not resent

        a failure status arriving while waiting for the prompt rejects the upload, unless it is the late reply of a command given up earlier. A coded error the modem would push on its own at that moment cannot be told apart from a rejection.
    */
    pub async fn begin_upload(&self, command: &str, payload: &[u8], options: UploadOptions) -> Result<UploadResult, Error> {
        Request::new(command).validate()?;
        if options.chunk_size == 0
            {return Err(Error::InvalidCommand("upload chunk size must not be zero"))}
        if !self.is_open()
            {return Err(Error::Closed)}
        let _turn = self.turn.lock().await;
        self.settle().await;
        let mut session = Session {state: UploadState::Idle, written: 0};

        // subscribe before sending, the prompt can come anytime after
        let (signal, prompted) = oneshot::channel();
        let signal = Mutex::new(Some(signal));
        let _subscription = Unsubscribe {
            channel: self,
            subscription: self.subscribe(move |notification| {
                let outcome = match notification.error() {
                    // not the answer to this command
                    Some(_) if notification.late => return,
                    Some(error) => Err(error),
                    None if notification.is_prompt() => Ok(()),
                    None => return,
                };
                if let Some(signal) = signal.lock().take() {
                    signal.send(outcome).ok();
                }
            }),
        };

        debug!("send {:?}", command);
        let mut line = command.as_bytes().to_vec();
        line.extend_from_slice(self.config.terminator.as_bytes());
        self.write_raw(&line).await?;
        session.enter(UploadState::AwaitingPrompt);

        match timeout(options.prompt_timeout, prompted).await {
            Ok(Ok(Ok(()))) => {},
            Ok(Ok(Err(error))) => {
                warn!("upload rejected: {}", error);
                return Ok(session.finish(UploadState::Rejected, Some(error)))
            },
            // the sender lives as long as the subscription, so it cannot be dropped first
            Ok(Err(_)) | Err(_) => {
                warn!("no upload prompt in {:?}", options.prompt_timeout);
                return Ok(session.finish(UploadState::TimedOut, None))
            },
        }

        session.enter(UploadState::Sending);
        for chunk in payload.chunks(options.chunk_size) {
            if let Err(err) = self.write_raw(chunk).await {
                session.enter(UploadState::Aborted);
                error!("upload aborted after {} of {} bytes: {}", session.written, payload.len(), err);
                return Err(err)
            }
            session.written += chunk.len();
            tokio::time::sleep(options.chunk_delay).await;
        }
        Ok(session.finish(UploadState::Done, None))
    }
}

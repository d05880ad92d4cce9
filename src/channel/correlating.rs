use std::{
    task::{Poll, Waker},
    future::poll_fn,
    sync::atomic::{AtomicBool, Ordering::*},
    time::Duration,
    io,
    };
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt},
    sync::Notify,
    time::{Instant, timeout, timeout_at},
    };
use parking_lot::Mutex;
use log::*;

use crate::{
    transport::{self, Reader, Writer},
    lines::{LineAssembler, LineEvent},
    classify::{self, Category, Snapshot, PendingView, UrcShape},
    status::Status,
    };
use super::{
    Error, ChannelConfig,
    requests::{Request, Response},
    notifying::{Subscribers, Notification, NotificationKind, Group},
    };


/**
    AT-command channel async implementation

    commands are executed one at a time in calling order, while notifications are delivered as soon as they are received
*/
pub struct Channel {
    /// uart RX/TX stream
    receive: tokio::sync::Mutex<Reader>,
    transmit: tokio::sync::Mutex<Writer>,
    /// exchanges waiting to use the line, tokio's mutex is fair so they are served in order
    pub(super) turn: tokio::sync::Mutex<()>,
    /// command currently waiting for its reply, and reception state
    pub(super) state: Mutex<State>,
    pub(super) subscribers: Subscribers,
    /// wakes up the reception coroutine when closing
    closing: Notify,
    /// signaled when the reply of an abandoned command arrives
    settled: Notify,
    open: AtomicBool,
    pub(super) config: ChannelConfig,
}
pub(super) struct State {
    /// at most one command waiting for reply
    pending: Option<Pending>,
    pub(super) urcs: Vec<UrcShape>,
    /// notification waiting for its trailing lines
    group: Option<Group>,
    /// commands given up whose final status may still arrive
    abandoned: usize,
    /// the next command waits for abandoned replies until then
    settle_until: Option<Instant>,
    next_token: Token,
}
/// internal struct holding data for receiving a command's reply
struct Pending {
    token: Token,
    /// command text, to recognize its echo
    command: String,
    prefix: Option<String>,
    /// intermediate lines received so far
    lines: Vec<String>,
    /// for waking up the async task waiting for the reply
    waker: Option<Waker>,
    /// final status line and its meaning, set on reception
    result: Option<Result<(String, Status), Error>>,
}
/// internal token type for pending commands
type Token = u64;


impl Channel {
    /// create a channel on any byte stream, like a serial port or a socket to a modem emulator
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
        config: ChannelConfig,
        ) -> Self {
        Self::from_halves(Box::pin(reader), Box::pin(writer), config)
    }
    /// open a serial port and create a channel on it
    #[cfg(feature = "serial")]
    pub fn open(serial: &transport::SerialConfig, config: ChannelConfig) -> Result<Self, Error> {
        let (reader, writer) = transport::open(serial)?;
        debug!("opened {} at {} bauds", serial.path, serial.baud_rate);
        Ok(Self::from_halves(reader, writer, config))
    }
    fn from_halves(reader: Reader, writer: Writer, config: ChannelConfig) -> Self {
        Self {
            receive: tokio::sync::Mutex::new(reader),
            transmit: tokio::sync::Mutex::new(writer),
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                pending: None,
                urcs: config.urcs.clone(),
                group: None,
                abandoned: 0,
                settle_until: None,
                next_token: 0,
            }),
            subscribers: Subscribers::default(),
            closing: Notify::new(),
            settled: Notify::new(),
            open: AtomicBool::new(true),
            config,
        }
    }
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
    pub fn is_open(&self) -> bool {
        self.open.load(Acquire)
    }

    /**
        coroutine responsible of receiving everything from the modem

        it **must** be running in order to receive replies and notifications. It returns when the channel is closed, or with an error if the transport fails
    */
    pub async fn run(&self) -> Result<(), Error> {
        let Ok(mut bus) = self.receive.try_lock()
            else {return Err(Error::Running)};
        let mut lines = LineAssembler::new(self.config.prompt, self.config.max_line);
        let mut receive = [0u8; 256];
        while self.is_open() {
            let received = tokio::select! {
                received = bus.read(&mut receive) => received,
                _ = self.closing.notified() => break,
            };
            let size = match received {
                Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed by peer")),
                other => other,
            };
            let size = match size {
                Ok(size) => size,
                Err(err) => {
                    error!("reception failed: {}", err);
                    self.fail_pending(Error::Transport(io::Error::new(err.kind(), err.to_string())));
                    return Err(err.into())
                },
            };
            lines.push(&receive[.. size]);
            while let Some(event) = lines.next_event() {
                self.ingest(event);
            }
        }
        debug!("reception stopped");
        Ok(())
    }

    /// route one line event to the pending command or to subscribers
    fn ingest(&self, event: LineEvent) {
        let notification = match event {
            LineEvent::Prompt => {
                trace!("received prompt");
                Some(Notification::new(NotificationKind::Prompt, char::from(self.config.prompt).to_string()))
            },
            LineEvent::Text(line) => {
                trace!("received {:?}", line);
                self.correlate(line)
            },
        };
        // subscribers are called without holding the state
        if let Some(notification) = notification {
            self.subscribers.dispatch(&notification);
        }
    }

    /// apply a received line to the channel state, returns it as a notification if no command claims it
    fn correlate(&self, line: String) -> Option<Notification> {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(group) = state.group.as_mut() {
            if group.push(line)
                {return state.group.take().map(|group| group.notification)}
            return None
        }

        let category = classify::classify(&line, &Snapshot {
            // a resolved command does not claim lines anymore
            pending: state.pending.as_ref()
                .filter(|pending| pending.result.is_none())
                .map(|pending| PendingView {
                    command: &pending.command,
                    prefix: pending.prefix.as_deref(),
                    }),
            urcs: &state.urcs,
            });
        match category {
            Category::Echo => None,
            Category::Intermediate => {
                if let Some(pending) = state.pending.as_mut()
                    {pending.lines.push(line)}
                None
            },
            Category::Final(status) => {
                if let Some(pending) = state.pending.as_mut() {
                    pending.result = Some(Ok((line, status)));
                    if let Some(waker) = pending.waker.take()
                        {waker.wake()}
                }
                None
            },
            Category::Notification => {
                if Status::parse(&line).is_some() {
                    let late = state.abandoned != 0;
                    if late {
                        state.abandoned -= 1;
                        warn!("late reply {:?} of an abandoned command", line);
                        if state.abandoned == 0
                            {self.settled.notify_waiters()}
                    }
                    let mut notification = Notification::new(NotificationKind::Status, line);
                    notification.late = late;
                    return Some(notification)
                }
                let shape = classify::shape(&line, &state.urcs).cloned();
                match Group::start(Notification::new(NotificationKind::Unsolicited, line), shape.as_ref()) {
                    Ok(group) => {
                        state.group = Some(group);
                        None
                    },
                    Err(notification) => Some(notification),
                }
            },
        }
    }

    /// resolve the pending command with an error
    fn fail_pending(&self, error: Error) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.as_mut() {
            if pending.result.is_none() {
                pending.result = Some(Err(error));
                if let Some(waker) = pending.waker.take()
                    {waker.wake()}
            }
        }
    }

    /**
        send a command and wait for its final status

        a final status reporting a failure gives an unsuccessful response carrying the structured error. No final status in time gives an unsuccessful response without error, the channel stays usable.

        only transport failures and closing are reported as errors
    */
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        request.validate()?;
        if !self.is_open()
            {return Err(Error::Closed)}
        let _turn = self.turn.lock().await;
        self.settle().await;
        if !self.is_open()
            {return Err(Error::Closed)}

        let duration = request.timeout.unwrap_or(self.config.default_timeout);
        let mut exchange = Exchange::new(self, &request);
        debug!("send {:?}", request.text);
        let mut line = request.text.into_bytes();
        line.extend_from_slice(self.config.terminator.as_bytes());
        if let Err(err) = self.write_raw(&line).await {
            error!("failed to send command: {}", err);
            return Err(err)
        }
        exchange.sent = true;
        exchange.receive(duration).await
    }

    /// write bytes to the modem outside of any command exchange
    pub async fn send_raw_without_ack(&self, data: &[u8]) -> Result<(), Error> {
        if !self.is_open()
            {return Err(Error::Closed)}
        let _turn = self.turn.lock().await;
        self.write_raw(data).await
    }
    /// write bytes, the caller must hold the turn
    pub(super) async fn write_raw(&self, data: &[u8]) -> Result<(), Error> {
        if !self.is_open()
            {return Err(Error::Closed)}
        let mut bus = self.transmit.lock().await;
        Ok(transport::write_all(&mut bus, data).await?)
    }

    /// wait for the replies of abandoned commands, so that they cannot be taken for the next command's reply
    pub(super) async fn settle(&self) {
        loop {
            // created before checking, so that a notification in between is not missed
            let settled = self.settled.notified();
            let deadline = {
                let state = self.state.lock();
                match state.settle_until {
                    Some(deadline) if state.abandoned != 0 && deadline > Instant::now() => deadline,
                    _ => break,
                }
            };
            debug!("waiting for late replies of abandoned commands");
            if timeout_at(deadline, settled).await.is_err()
                {break}
        }
    }

    /**
        close the channel

        the reception coroutine returns, the pending command fails with [Error::Closed], and so will any further command. Closing twice does nothing.
    */
    pub async fn close(&self) -> Result<(), Error> {
        if !self.open.swap(false, AcqRel)
            {return Ok(())}
        debug!("closing channel");
        self.closing.notify_one();
        self.fail_pending(Error::Closed);
        let mut bus = self.transmit.lock().await;
        bus.shutdown().await?;
        Ok(())
    }
}


/// a command registered as pending, removed from the channel when dropped
struct Exchange<'c> {
    channel: &'c Channel,
    token: Token,
    /// the command has been written, its reply may come anytime
    sent: bool,
    /// the reply has been received, or will never come
    resolved: bool,
}
impl<'c> Exchange<'c> {
    fn new(channel: &'c Channel, request: &Request) -> Self {
        let mut state = channel.state.lock();
        state.next_token = state.next_token.wrapping_add(1);
        let token = state.next_token;
        state.pending = Some(Pending {
            token,
            command: request.text.clone(),
            prefix: request.prefix.clone(),
            lines: Vec::new(),
            waker: None,
            result: None,
        });
        Self {channel, token, sent: false, resolved: false}
    }
    /// take the reply if it has been received, register the waker otherwise
    fn take_reply(&self, waker: Option<&Waker>) -> Option<Result<((String, Status), Vec<String>), Error>> {
        let mut state = self.channel.state.lock();
        let Some(pending) = state.pending.as_mut().filter(|pending| pending.token == self.token)
            else {return Some(Err(Error::Closed))};
        if let Some(result) = pending.result.take() {
            let lines = std::mem::take(&mut pending.lines);
            return Some(result.map(|reply| (reply, lines)))
        }
        if let Some(waker) = waker
            {pending.waker.replace(waker.clone());}
        None
    }
    /// wait for the final status of this command
    async fn receive(mut self, duration: Duration) -> Result<Response, Error> {
        let polling = poll_fn(|context| match self.take_reply(Some(context.waker())) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
            });
        // a reply arriving right at the deadline is still taken
        let reply = match timeout(duration, polling).await {
            Ok(result) => Some(result),
            Err(_) => self.take_reply(None),
        };
        match reply {
            Some(Ok(((line, status), lines))) => {
                self.resolved = true;
                debug!("reply {:?}", line);
                // the modem answers in order, older replies will not come anymore
                self.channel.state.lock().abandoned = 0;
                Ok(Response {
                    success: status.is_success(),
                    error: status.error(),
                    status: Some(line),
                    lines,
                })
            },
            Some(Err(err)) => {
                self.resolved = true;
                Err(err)
            },
            None => {
                warn!("no reply in {:?}", duration);
                let lines = self.channel.state.lock().pending.as_mut()
                    .filter(|pending| pending.token == self.token)
                    .map(|pending| std::mem::take(&mut pending.lines))
                    .unwrap_or_default();
                Ok(Response::timed_out(lines))
            },
        }
    }
}
impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        let mut state = self.channel.state.lock();
        state.pending.take_if(|pending| pending.token == self.token);
        if self.sent && !self.resolved {
            state.abandoned += 1;
            state.settle_until = Some(Instant::now() + self.channel.config.settle);
        }
    }
}

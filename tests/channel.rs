use std::{
    sync::Arc,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
    io,
    };
use futures_concurrency::future::{Race, Join};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
    };

use atchannel::{
    channel::*,
    classify::UrcShape,
    status::ErrorKind,
    modem::{wake_up, ECHO_OFF},
    };


/// moment and size of every write done by the channel
type Writes = Arc<Mutex<Vec<(Instant, usize)>>>;

/// transmit half recording the writes
struct Recorder<W> {
    inner: W,
    writes: Writes,
    /// index of a write attempt failing once, as if the line had a glitch
    broken: Option<usize>,
    attempts: usize,
}
impl<W: AsyncWrite + Unpin> AsyncWrite for Recorder<W> {
    fn poll_write(self: Pin<&mut Self>, context: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.attempts += 1;
        if this.broken == Some(this.attempts - 1)
            {return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "line glitch")))}
        let written = Pin::new(&mut this.inner).poll_write(context, data);
        if let Poll::Ready(Ok(size)) = written {
            this.writes.lock().push((Instant::now(), size));
        }
        written
    }
    fn poll_flush(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(context)
    }
    fn poll_shutdown(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(context)
    }
}

/// scripted modem side of the line
struct Modem {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    writes: Writes,
}
impl Modem {
    /// receive one command line, with its terminator
    async fn receive_line(&mut self) -> String {
        let mut line = Vec::new();
        self.reader.read_until(b'\r', &mut line).await.expect("modem reception failed");
        String::from_utf8(line).expect("command is not utf8")
    }
    async fn expect(&mut self, command: &str) {
        assert_eq!(self.receive_line().await, format!("{}\r", command));
    }
    async fn receive_bytes(&mut self, size: usize) -> Vec<u8> {
        let mut data = vec![0; size];
        self.reader.read_exact(&mut data).await.expect("modem reception failed");
        data
    }
    async fn reply(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.expect("modem transmission failed");
    }
    /// sizes of the writes done by the channel so far
    fn writes(&self) -> Vec<usize> {
        self.writes.lock().iter().map(|&(_, size)| size).collect()
    }
}

fn connect(config: ChannelConfig) -> (Channel, Modem) {
    connect_broken(config, None)
}
/// connect with a transmit half failing at the given write attempt
fn connect_broken(config: ChannelConfig, broken: Option<usize>) -> (Channel, Modem) {
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(ours);
    let writes = Writes::default();
    let channel = Channel::new(reader, Recorder {inner: writer, writes: writes.clone(), broken, attempts: 0}, config);
    let (reader, writer) = tokio::io::split(theirs);
    (channel, Modem {reader: BufReader::new(reader), writer, writes})
}

fn collect(channel: &Channel) -> mpsc::UnboundedReceiver<Notification> {
    let (sender, receiver) = mpsc::unbounded_channel();
    channel.subscribe(move |notification| {
        sender.send(notification.clone()).ok();
    });
    receiver
}

fn test<T, F>(config: ChannelConfig, test: T)
where
    T: FnOnce(Arc<Channel>, Modem) -> F,
    F: Future<Output = ()>,
{
    test_broken(config, None, test)
}
fn test_broken<T, F>(config: ChannelConfig, broken: Option<usize>, test: T)
where
    T: FnOnce(Arc<Channel>, Modem) -> F,
    F: Future<Output = ()>,
{
    env_logger::builder().is_test(true).try_init().ok();
    tokio::runtime::Runtime::new()
    .expect("failed to create runtime")
    .block_on(async move {
        let (channel, modem) = connect_broken(config, broken);
        let channel = Arc::new(channel);
        (
            async {
                tokio::time::timeout(Duration::from_secs(10), test(channel.clone(), modem))
                .await.expect("aborted test because took too long");
            },
            async {
                channel.run()
                .await.expect("channel reception failed");
                // closed by the test, let it finish
                std::future::pending::<()>().await
            },
        ).race().await;
    });
}

fn quick() -> ChannelConfig {
    ChannelConfig::default()
        .default_timeout(Duration::from_millis(200))
        .settle(Duration::from_millis(100))
}


#[test]
fn single_line_response() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.query("AT+CSQ", "+CSQ:"),
            async {
                modem.expect("AT+CSQ").await;
                modem.reply("\r\n+CSQ: 15,99\r\n\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert_eq!(response.lines, ["+CSQ: 15,99"]);
        assert_eq!(response.status.as_deref(), Some("OK"));
        assert_eq!(response.error, None);
        assert_eq!(response.value("+CSQ:"), Some("15,99"));
        // one write of the command and its terminator
        assert_eq!(modem.writes(), ["AT+CSQ\r".len()]);
    });
}

#[test]
fn multi_line_response_with_echo() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.command("ATI"),
            async {
                modem.expect("ATI").await;
                modem.reply("ATI\r\r\nQuectel\r\nEC21\r\nRevision: EC21EFAR06A01M4G\r\n\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert_eq!(response.lines, ["Quectel", "EC21", "Revision: EC21EFAR06A01M4G"]);
    });
}

#[test]
fn coded_error() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.query("AT+CPIN?", "+CPIN:"),
            async {
                modem.expect("AT+CPIN?").await;
                modem.reply("\r\n+CME ERROR: 10\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(!response.success);
        assert!(response.lines.is_empty());
        let error = response.error.clone().expect("no structured error");
        assert_eq!(error.code(), Some(10));
        assert_eq!(error.kind(), Some(ErrorKind::SimNotInserted));
        assert!(matches!(response.into_result(), Err(Error::Protocol(_))));
    });
}

#[test]
fn generic_error() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.command("AT+BOGUS"),
            async {
                modem.expect("AT+BOGUS").await;
                modem.reply("\r\nERROR\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.and_then(|error| error.code()), None);
        assert_eq!(response.status.as_deref(), Some("ERROR"));
    });
}

#[test]
fn long_lines_are_kept_whole() {
    test(quick(), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        let operators = (0 .. 60)
            .map(|i| format!("(1,\"Operator {:02}\",\"OP{:02}\",\"208{:02}\",7)", i, i, i))
            .collect::<Vec<_>>()
            .join(",");
        let line = format!("+COPS: {},,(0-4),(0-2)", operators);
        assert!(line.len() > ChannelConfig::default().max_line);
        let (response, _) = (
            channel.query("AT+COPS=?", "+COPS:"),
            async {
                modem.expect("AT+COPS=?").await;
                modem.reply(&format!("\r\n{}\r\n\r\nOK\r\n", line)).await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert_eq!(response.lines, [line]);

        // the end of a long line is not taken for a final status
        let filler = "x".repeat(ChannelConfig::default().max_line);
        let (response, _) = (
            channel.command("AT+QFREAD=1"),
            async {
                modem.expect("AT+QFREAD=1").await;
                modem.reply(&format!("\r\n{}OK\r\nERROR\r\n", filler)).await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(!response.success);
        assert_eq!(response.status.as_deref(), Some("ERROR"));
        assert_eq!(response.lines, [format!("{}OK", filler)]);
        assert!(notifications.try_recv().is_err());
    });
}

#[test]
fn reply_lines_starting_with_prompt() {
    test(quick(), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        let (response, _) = (
            channel.command("AT+QHTTPREAD=80"),
            async {
                modem.expect("AT+QHTTPREAD=80").await;
                modem.reply("\r\nCONNECT\r\n> quoted reply\r\n>>nested\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert_eq!(response.lines, ["CONNECT", "> quoted reply", ">>nested"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notifications.try_recv().is_err());
    });
}

#[test]
fn write_failure_aborts_command() {
    // the first write fails
    test_broken(quick(), Some(0), |channel, mut modem| async move {
        assert!(matches!(channel.command("AT").await, Err(Error::Transport(_))));
        assert!(modem.writes().is_empty());

        // nothing was sent, so nothing is waited for
        let start = Instant::now();
        let (response, _) = (
            channel.command("AT"),
            async {
                modem.expect("AT").await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        assert!(response.unwrap().success);
        assert!(start.elapsed() < quick().settle);
    });
}

#[test]
fn timeout_does_not_leak() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.execute(Request::new("AT+COPS=?").timeout(Duration::from_millis(100))),
            modem.expect("AT+COPS=?"),
        ).join().await;
        let response = response.unwrap();
        assert!(!response.success);
        assert!(response.is_timeout());
        assert_eq!(response.error, None);

        // nothing comes back, the next command is still served once the settle time elapsed
        let (response, _) = (
            channel.query("AT+CSQ", "+CSQ:"),
            async {
                modem.expect("AT+CSQ").await;
                modem.reply("\r\n+CSQ: 20,0\r\n\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert_eq!(response.lines, ["+CSQ: 20,0"]);
    });
}

#[test]
fn late_reply_is_a_notification() {
    test(quick().settle(Duration::from_secs(2)), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        let (response, _) = (
            channel.execute(Request::new("AT+COPS=?").timeout(Duration::from_millis(100))),
            modem.expect("AT+COPS=?"),
        ).join().await;
        assert!(response.unwrap().is_timeout());

        // the slow modem finally answers, right before the next command is issued
        modem.reply("\r\n+COPS: (1,\"operator\")\r\n\r\n+CME ERROR: 30\r\n").await;
        let start = Instant::now();
        let (response, _) = (
            channel.command("AT"),
            async {
                modem.expect("AT").await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert!(response.lines.is_empty());
        // the late status ended the wait, not the settle time
        assert!(start.elapsed() < Duration::from_secs(2));

        let payload = notifications.recv().await.unwrap();
        assert_eq!(payload.kind, NotificationKind::Unsolicited);
        assert_eq!(payload.line(), "+COPS: (1,\"operator\")");
        let status = notifications.recv().await.unwrap();
        assert_eq!(status.kind, NotificationKind::Status);
        assert_eq!(status.error().and_then(|error| error.code()), Some(30));
        assert!(status.late);
        assert!(notifications.try_recv().is_err());
    });
}

#[test]
fn unsolicited_while_idle() {
    test(quick(), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        modem.reply("\r\n+CREG: 1\r\n").await;
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.kind, NotificationKind::Unsolicited);
        assert_eq!(notification.lines, ["+CREG: 1"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifications.try_recv().is_err());
        assert!(modem.writes().is_empty());
    });
}

#[test]
fn unsolicited_during_command() {
    test(quick(), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        let (response, _) = (
            channel.query("AT+CSQ", "+CSQ:"),
            async {
                modem.expect("AT+CSQ").await;
                modem.reply("\r\n+CREG: 5\r\n\r\n+CSQ: 12,99\r\n\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert_eq!(response.lines, ["+CSQ: 12,99"]);
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.lines, ["+CREG: 5"]);
        assert!(notifications.try_recv().is_err());
    });
}

#[test]
fn notification_with_payload_lines() {
    test(quick(), |channel, mut modem| async move {
        let mut notifications = collect(&channel);
        channel.register_urc(UrcShape::new("+QIURC:").trailing(2));
        modem.reply("\r\n+CMT: \"+33600000000\",,\"24/01/01,12:00:00+04\"\r\nhello\r\n").await;
        modem.reply("\r\n+QIURC: \"recv\",0\r\nfirst\r\nsecond\r\n").await;
        let sms = notifications.recv().await.unwrap();
        assert_eq!(sms.lines, ["+CMT: \"+33600000000\",,\"24/01/01,12:00:00+04\"", "hello"]);
        let data = notifications.recv().await.unwrap();
        assert_eq!(data.lines, ["+QIURC: \"recv\",0", "first", "second"]);
    });
}

#[test]
fn commands_are_served_in_order() {
    test(quick(), |channel, mut modem| async move {
        let started = tokio::sync::Notify::new();
        let (first, second, _) = (
            channel.query("AT+CSQ", "+CSQ:"),
            async {
                started.notified().await;
                channel.command("AT+CGMI").await
            },
            async {
                modem.expect("AT+CSQ").await;
                // the second command is issued while the first one waits for its reply
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(modem.writes().len(), 1);
                modem.reply("\r\n+CSQ: 15,99\r\n\r\nOK\r\n").await;
                modem.expect("AT+CGMI").await;
                modem.reply("\r\nQuectel\r\n\r\nOK\r\n").await;
            },
        ).join().await;
        assert_eq!(first.unwrap().lines, ["+CSQ: 15,99"]);
        assert_eq!(second.unwrap().lines, ["Quectel"]);
    });
}

#[test]
fn cancelled_command_releases_channel() {
    test(quick(), |channel, mut modem| async move {
        let (cancelled, _) = (
            tokio::time::timeout(Duration::from_millis(50), channel.command("AT+QPOWD")),
            modem.expect("AT+QPOWD"),
        ).join().await;
        assert!(cancelled.is_err());

        let (response, _) = (
            channel.command("AT"),
            async {
                modem.expect("AT").await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        assert!(response.unwrap().success);
    });
}

#[test]
fn invalid_commands_are_not_sent() {
    test(quick(), |channel, modem| async move {
        assert!(matches!(channel.command("AT\r\nAT").await, Err(Error::InvalidCommand(_))));
        assert!(matches!(channel.command("").await, Err(Error::InvalidCommand(_))));
        assert!(modem.writes().is_empty());
    });
}

#[test]
fn raw_write() {
    test(quick(), |channel, mut modem| async move {
        channel.send_raw_without_ack(b"+++").await.unwrap();
        assert_eq!(modem.receive_bytes(3).await, b"+++");
        assert_eq!(modem.writes(), [3]);
    });
}

#[test]
fn reception_runs_once() {
    test(quick(), |channel, modem| async move {
        // keep the line connected
        let _modem = modem;
        assert!(matches!(channel.run().await, Err(Error::Running)));
    });
}

#[test]
fn close_fails_pending_and_later_commands() {
    test(quick().default_timeout(Duration::from_secs(5)), |channel, mut modem| async move {
        let (response, _) = (
            channel.command("AT+CFUN=1,1"),
            async {
                modem.expect("AT+CFUN=1,1").await;
                channel.close().await.unwrap();
            },
        ).join().await;
        assert!(matches!(response, Err(Error::Closed)));
        assert!(!channel.is_open());
        // closing twice is harmless
        channel.close().await.unwrap();
        assert!(matches!(channel.command("AT").await, Err(Error::Closed)));
        assert!(matches!(channel.send_raw_without_ack(b"x").await, Err(Error::Closed)));
    });
}

#[tokio::test]
async fn transport_failure_aborts_command() {
    let (channel, mut modem) = connect(quick().default_timeout(Duration::from_secs(5)));
    let channel = Arc::new(channel);
    let reception = tokio::spawn({
        let channel = channel.clone();
        async move {channel.run().await}
    });
    let (response, _) = (
        channel.command("AT"),
        async move {
            modem.expect("AT").await;
            // unplugged
            drop(modem);
        },
    ).join().await;
    assert!(matches!(response, Err(Error::Transport(_))));
    assert!(matches!(reception.await.unwrap(), Err(Error::Transport(_))));
    // the channel is not closed, that is left to the caller
    assert!(channel.is_open());
}


#[test]
fn upload_in_chunks() {
    test(quick(), |channel, mut modem| async move {
        let payload = (0 .. 130u8).collect::<Vec<_>>();
        let delay = Duration::from_millis(20);
        let command = "AT+QFUPL=\"RAM:data.bin\",130";
        let (result, received) = (
            channel.begin_upload(command, &payload, UploadOptions::default()
                .chunk_size(64)
                .chunk_delay(delay)),
            async {
                modem.expect(command).await;
                modem.reply("\r\n> ").await;
                modem.receive_bytes(130).await
            },
        ).join().await;
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.state, UploadState::Done);
        assert_eq!(result.written, 130);
        assert_eq!(received, payload);

        let writes = modem.writes.lock().clone();
        let sizes = writes.iter().map(|&(_, size)| size).collect::<Vec<_>>();
        assert_eq!(sizes, [command.len() + 1, 64, 64, 2]);
        for pair in writes[1 ..].windows(2) {
            assert!(pair[1].0 - pair[0].0 >= delay, "chunks not paced");
        }
    });
}

#[test]
fn upload_without_prompt() {
    test(quick(), |channel, mut modem| async move {
        let command = "AT+QFUPL=\"RAM:data.bin\",130";
        let (result, _) = (
            channel.begin_upload(command, &[0; 130], UploadOptions::default()
                .prompt_timeout(Duration::from_millis(100))
                .chunk_size(64)),
            modem.expect(command),
        ).join().await;
        let result = result.unwrap();
        assert!(!result.success);
        assert_eq!(result.state, UploadState::TimedOut);
        assert_eq!(result.written, 0);
        // only the command was written
        assert_eq!(modem.writes(), [command.len() + 1]);
    });
}

#[test]
fn upload_rejected() {
    test(quick(), |channel, mut modem| async move {
        let command = "AT+CMGS=\"+33600000000\"";
        let (result, _) = (
            channel.begin_upload(command, b"hello\x1a", UploadOptions::default()),
            async {
                modem.expect(command).await;
                modem.reply("\r\n+CMS ERROR: 330\r\n").await;
            },
        ).join().await;
        let result = result.unwrap();
        assert!(!result.success);
        assert_eq!(result.state, UploadState::Rejected);
        assert_eq!(result.error.and_then(|error| error.kind()), Some(ErrorKind::SmscAddressUnknown));
        assert_eq!(modem.writes(), [command.len() + 1]);
    });
}

#[test]
fn upload_aborted_by_write_failure() {
    // the command and the first chunk go through, the second chunk fails
    test_broken(quick(), Some(2), |channel, mut modem| async move {
        let command = "AT+QFUPL=\"RAM:data.bin\",130";
        let (result, received) = (
            channel.begin_upload(command, &[0; 130], UploadOptions::default()
                .chunk_size(64)
                .chunk_delay(Duration::ZERO)),
            async {
                modem.expect(command).await;
                modem.reply("\r\n> ").await;
                modem.receive_bytes(64).await
            },
        ).join().await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(received.len(), 64);
        // no retry of the failed chunk
        assert_eq!(modem.writes(), [command.len() + 1, 64]);

        // no pending command was left behind
        let (response, _) = (
            channel.command("AT"),
            async {
                modem.expect("AT").await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        let response = response.unwrap();
        assert!(response.success);
        assert!(response.lines.is_empty());
    });
}

#[test]
fn late_reply_does_not_reject_upload() {
    test(quick(), |channel, mut modem| async move {
        let (response, _) = (
            channel.execute(Request::new("AT+COPS=?").timeout(Duration::from_millis(100))),
            modem.expect("AT+COPS=?"),
        ).join().await;
        assert!(response.unwrap().is_timeout());

        let (result, _) = (
            channel.begin_upload("AT+CMGS=12", b"0011000B91\x1a", UploadOptions::default().chunk_delay(Duration::ZERO)),
            async {
                modem.expect("AT+CMGS=12").await;
                // the command given up finally fails, then the upload is accepted
                modem.reply("\r\n+CME ERROR: 30\r\n").await;
                modem.reply("\r\n> ").await;
                modem.receive_bytes(11).await;
            },
        ).join().await;
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.state, UploadState::Done);
    });
}

#[test]
fn upload_then_command() {
    test(quick(), |channel, mut modem| async move {
        let (result, _) = (
            channel.begin_upload("AT+CMGS=12", b"0011000B91\x1a", UploadOptions::default().chunk_delay(Duration::ZERO)),
            async {
                modem.expect("AT+CMGS=12").await;
                modem.reply("\r\n> ").await;
                modem.receive_bytes(11).await;
            },
        ).join().await;
        assert!(result.unwrap().success);

        let (response, _) = (
            channel.command("AT"),
            async {
                modem.expect("AT").await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        assert!(response.unwrap().success);
    });
}


#[test]
fn wake_up_retries() {
    test(quick().settle(Duration::from_millis(10)), |channel, mut modem| async move {
        let (awake, _) = (
            wake_up(&channel, 3, Duration::from_millis(50)),
            async {
                // asleep for the first two attempts
                modem.expect(ECHO_OFF).await;
                modem.expect(ECHO_OFF).await;
                modem.expect(ECHO_OFF).await;
                modem.reply("\r\nOK\r\n").await;
            },
        ).join().await;
        awake.unwrap();
    });
}

#[test]
fn wake_up_gives_up() {
    test(quick().settle(Duration::from_millis(10)), |channel, mut modem| async move {
        let (awake, _) = (
            wake_up(&channel, 2, Duration::from_millis(50)),
            async {
                modem.expect(ECHO_OFF).await;
                modem.expect(ECHO_OFF).await;
            },
        ).join().await;
        assert!(matches!(awake, Err(Error::WakeUp {attempts: 2})));
    });
}

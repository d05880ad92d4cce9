/*!
    assemble raw bytes received from the modem into line events

    the modem terminates its lines with `\r\n` (sometimes only one of them), and separates them by empty lines. The only thing it sends without terminator is the upload prompt, which must be reported as soon as it is received since the modem then waits for the payload.

    a line starting with the prompt character is only a prompt if nothing follows it (but one space) in the received bytes. Otherwise it is text and kept intact. A prompt split from the rest of its line by the transport is still taken for a prompt.
*/

use bytes::BytesMut;
use log::*;


/// default sentinel character sent by modems when ready to receive an upload payload
pub const PROMPT: u8 = b'>';
/// default expected maximum length of a line, longer lines are still emitted whole but with a warning
pub const MAX_LINE: usize = 1024;

/// event produced by [LineAssembler]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    /// a complete line, without its terminator
    Text(String),
    /// the upload prompt sentinel, emitted without waiting for a terminator
    Prompt,
}

/**
    accumulates received bytes until complete lines can be extracted

    bytes are fed with [Self::push] as they come from the transport, then events are retrieved with [Self::next_event] until it returns `None`
*/
#[derive(Debug)]
pub struct LineAssembler {
    /// bytes of the current partial line
    buffer: BytesMut,
    /// bytes received but not yet examined
    incoming: BytesMut,
    prompt: u8,
    max_line: usize,
    /// a bare prompt was just emitted, a single space following it must be skipped
    after_prompt: bool,
}
impl LineAssembler {
    pub fn new(prompt: u8, max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line),
            incoming: BytesMut::new(),
            prompt,
            max_line: max_line.max(1),
            after_prompt: false,
        }
    }
    /// feed received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }
    /// extract the next complete event, if any
    pub fn next_event(&mut self) -> Option<LineEvent> {
        while !self.incoming.is_empty() {
            let byte = self.incoming.split_to(1)[0];

            if self.after_prompt {
                self.after_prompt = false;
                if byte == b' '  {continue}
            }
            match byte {
                b'\r' | b'\n' => {
                    // empty lines only separate responses
                    if !self.buffer.is_empty()
                        {return Some(self.take_line())}
                },
                byte => {
                    self.buffer.extend_from_slice(&[byte]);
                    if self.buffer.len() == self.max_line + 1 {
                        warn!("line longer than {} bytes", self.max_line);
                    }
                },
            }
        }
        // nothing follows the sentinel, the modem is waiting for the payload
        if self.is_prompt() {
            self.after_prompt = self.buffer.len() == 1;
            self.buffer.clear();
            return Some(LineEvent::Prompt)
        }
        None
    }
    /// number of bytes of the current partial line
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
    /// forget any partial line and pending bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.incoming.clear();
        self.after_prompt = false;
    }

    /// the partial line is the sentinel alone, possibly with its trailing space
    fn is_prompt(&self) -> bool {
        matches!(&self.buffer[..], [sentinel] | [sentinel, b' '] if *sentinel == self.prompt)
    }
    fn take_line(&mut self) -> LineEvent {
        let line = self.buffer.split();
        LineEvent::Text(String::from_utf8_lossy(&line).into_owned())
    }
}
impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(PROMPT, MAX_LINE)
    }
}
impl Iterator for LineAssembler {
    type Item = LineEvent;
    fn next(&mut self) -> Option<LineEvent> {
        self.next_event()
    }
}

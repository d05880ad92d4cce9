use std::time::Duration;
use crate::status::ProtocolError;
use super::{Channel, Error};


/**
    command to send and how to recognize its reply

    - without prefix, every line until the final status is part of the reply (multi-line responses)
    - with a prefix, only lines starting with it are, others are notifications (single line responses)
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// command text, without terminator
    pub text: String,
    /// expected start of reply lines
    pub prefix: Option<String>,
    /// maximum wait for the final status, [super::ChannelConfig::default_timeout] if not set
    pub timeout: Option<Duration>,
}
impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {text: text.into(), prefix: None, timeout: None}
    }
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    /// check the command can be sent as one line
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.text.is_empty()
            {return Err(Error::InvalidCommand("empty command"))}
        if self.text.contains(['\r', '\n'])
            {return Err(Error::InvalidCommand("command contains a line terminator"))}
        Ok(())
    }
}

/// reply of the modem to a [Request]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// true if the final status line reported success
    pub success: bool,
    /// intermediate lines, in reception order
    pub lines: Vec<String>,
    /// final status line, `None` if none arrived in time
    pub status: Option<String>,
    /// structured failure, if the final status line reported one
    pub error: Option<ProtocolError>,
}
impl Response {
    pub(crate) fn timed_out(lines: Vec<String>) -> Self {
        Self {success: false, lines, status: None, error: None}
    }
    /// true if no final status line arrived
    pub fn is_timeout(&self) -> bool {
        self.status.is_none()
    }
    /// first intermediate line, the payload of single line responses
    pub fn line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }
    /// first intermediate line with the given prefix removed and surrounding spaces trimmed
    pub fn value(&self, prefix: &str) -> Option<&str> {
        self.lines.iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }
    /// convert into the intermediate lines, or the failure that prevented them
    pub fn into_result(self) -> Result<Vec<String>, Error> {
        if self.success
            {return Ok(self.lines)}
        // a failure without error can only be a timeout
        match self.error {
            Some(error) => Err(Error::Protocol(error)),
            None => Err(Error::Timeout),
        }
    }
}


impl Channel {
    /// execute a command with the default timeout, collecting every reply line
    pub async fn command(&self, text: &str) -> Result<Response, Error> {
        self.execute(Request::new(text)).await
    }
    /// execute a command with the default timeout, collecting only reply lines starting with `prefix`
    pub async fn query(&self, text: &str, prefix: &str) -> Result<Response, Error> {
        self.execute(Request::new(text).prefix(prefix)).await
    }
}

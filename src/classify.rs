/*!
    decide what an assembled line means

    the same line shape can be a reply payload or a pushed notification (`+CREG: 1` answers `AT+CREG?` but is also sent unsolicited on registration change), so the category depends on the command currently waiting for its reply.
*/

use crate::status::Status;


/**
    shape of an unsolicited notification

    a notification starting with `prefix` is followed by `trailing` payload lines which belong to the same notification (for instance `+CMT:` is followed by the message body)
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrcShape {
    pub prefix: String,
    pub trailing: usize,
}
impl UrcShape {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {prefix: prefix.into(), trailing: 0}
    }
    /// set the number of payload lines following the notification header
    pub fn trailing(mut self, lines: usize) -> Self {
        self.trailing = lines;
        self
    }
    pub fn matches(&self, line: &str) -> bool {
        line.starts_with(self.prefix.as_str())
    }
    /// whether `command` is the command querying or setting this notification's subject
    fn belongs_to(&self, command: &str) -> bool {
        let name = self.prefix.trim_end_matches(':');
        let command = command.trim();
        command.get(.. 2).is_some_and(|at| at.eq_ignore_ascii_case("AT"))
            && command[2 ..].starts_with(name)
    }
}

/// notifications commonly pushed by 27.007 modems
pub fn default_urcs() -> Vec<UrcShape> {
    vec![
        UrcShape::new("+CREG:"),
        UrcShape::new("+CGREG:"),
        UrcShape::new("+CEREG:"),
        UrcShape::new("RING"),
        UrcShape::new("+CRING:"),
        UrcShape::new("+CLIP:"),
        UrcShape::new("+CMTI:"),
        UrcShape::new("+CMT:").trailing(1),
        UrcShape::new("+CBM:").trailing(1),
        UrcShape::new("+CUSD:"),
        UrcShape::new("+CPIN:"),
        UrcShape::new("+CTZV:"),
    ]
}


/// command waiting for its reply, as seen by the classifier
#[derive(Copy, Clone, Debug)]
pub struct PendingView<'s> {
    /// command text as sent, without terminator
    pub command: &'s str,
    /// expected prefix of the reply lines, for single line responses
    pub prefix: Option<&'s str>,
}
/// state of the channel needed to classify a line
#[derive(Copy, Clone, Debug)]
pub struct Snapshot<'s> {
    pub pending: Option<PendingView<'s>>,
    pub urcs: &'s [UrcShape],
}

/// category of an assembled line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Category {
    /// the modem echoing the pending command
    Echo,
    /// payload line of the pending command's reply
    Intermediate,
    /// final status line of the pending command's reply
    Final(Status),
    /// anything not claimed by the pending command, including status lines arriving with no command pending
    Notification,
}

/**
    classify a line according to the current channel state

    rules are applied in order:
    - the pending command's echo
    - final status lines, which only end a reply if a command is pending
    - reply lines, matched by prefix if one was given, otherwise any line not looking like someone else's notification
    - everything else is a notification, nothing is discarded
*/
pub fn classify(line: &str, snapshot: &Snapshot<'_>) -> Category {
    let Some(pending) = snapshot.pending
        else {return Category::Notification};

    if line.trim() == pending.command.trim()
        {return Category::Echo}
    if let Some(status) = Status::parse(line)
        {return Category::Final(status)}

    let claimed = match pending.prefix {
        Some(prefix) => line.starts_with(prefix),
        None => ! snapshot.urcs.iter()
            .any(|urc| urc.matches(line) && ! urc.belongs_to(pending.command)),
    };
    if claimed
        {Category::Intermediate}
    else
        {Category::Notification}
}

/// find the notification shape matching this line
pub fn shape<'u>(line: &str, urcs: &'u [UrcShape]) -> Option<&'u UrcShape> {
    urcs.iter().find(|urc| urc.matches(line))
}

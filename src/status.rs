/*!
    final status lines and their structured errors

    a command's reply always ends with one final status line. This module recognizes them and maps failures to [ProtocolError], using the numeric code tables of 3GPP TS 27.007 (`+CME ERROR`, equipment) and TS 27.005 (`+CMS ERROR`, message service).

    everything here is pure, no I/O and no state.
*/

use thiserror::Error;


/// final status line of a command reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// `OK`
    Ok,
    /// plain failure without detail: `ERROR`, `NO CARRIER`, `BUSY`, `NO ANSWER`, `NO DIALTONE`
    Error(String),
    /// `+CME ERROR: <payload>` or `+CMS ERROR: <payload>`
    Coded(Family, String),
}
/// family of a coded error
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    /// `+CME ERROR`, mobile equipment or network
    Equipment,
    /// `+CMS ERROR`, message service
    Message,
}

const SUCCESS: &str = "OK";
const FAILURES: [&str; 5] = ["ERROR", "NO CARRIER", "BUSY", "NO ANSWER", "NO DIALTONE"];
const EQUIPMENT: &str = "+CME ERROR:";
const MESSAGE: &str = "+CMS ERROR:";

impl Status {
    /// recognize a final status line, returns `None` for any other line
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line == SUCCESS
            {return Some(Status::Ok)}
        if FAILURES.contains(&line)
            {return Some(Status::Error(line.to_string()))}
        if let Some(payload) = line.strip_prefix(EQUIPMENT)
            {return Some(Status::Coded(Family::Equipment, payload.trim().to_string()))}
        if let Some(payload) = line.strip_prefix(MESSAGE)
            {return Some(Status::Coded(Family::Message, payload.trim().to_string()))}
        None
    }
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok)
    }
    /// structured error carried by this status, `None` on success
    pub fn error(&self) -> Option<ProtocolError> {
        match self {
            Status::Ok => None,
            Status::Error(text) => Some(ProtocolError::Generic {text: text.clone()}),
            Status::Coded(family, payload) => Some(coded(*family, payload)),
        }
    }
}

/**
    map a final status line to its structured error

    returns `None` for success and for lines that are not final status lines
*/
pub fn classify(line: &str) -> Option<ProtocolError> {
    Status::parse(line)?.error()
}

fn coded(family: Family, payload: &str) -> ProtocolError {
    match payload.parse::<u16>() {
        Ok(code) => ProtocolError::Coded {
            family,
            code: Some(code),
            kind: ErrorKind::from_code(family, code),
            text: payload.to_string(),
        },
        // verbose mode (`AT+CMEE=2`) reports the description instead of the number
        Err(_) => {
            let found = table(family).iter()
                .find(|(_, kind)| kind.description().eq_ignore_ascii_case(payload));
            ProtocolError::Coded {
                family,
                code: found.map(|&(code, _)| code),
                kind: found.map(|&(_, kind)| kind).unwrap_or(ErrorKind::Unknown),
                text: payload.to_string(),
            }
        },
    }
}


/// structured failure reported by the modem in a final status line
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// failure without further detail
    #[error("modem failure ({text})")]
    Generic {text: String},
    /// failure with a code, the raw code is kept even when not in the tables
    #[error("{}", describe(.family, .code, .kind, .text))]
    Coded {
        family: Family,
        code: Option<u16>,
        kind: ErrorKind,
        /// raw payload following the error marker
        text: String,
    },
}
impl ProtocolError {
    /// numeric code, if the modem reported one or it could be recovered from its description
    pub fn code(&self) -> Option<u16> {
        match self {
            ProtocolError::Generic {..} => None,
            ProtocolError::Coded {code, ..} => *code,
        }
    }
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ProtocolError::Generic {..} => None,
            ProtocolError::Coded {kind, ..} => Some(*kind),
        }
    }
}
/// message of a coded failure, the table description when known and the raw payload otherwise
fn describe(family: &Family, code: &Option<u16>, kind: &ErrorKind, text: &str) -> String {
    let family = match family {
        Family::Equipment => "equipment",
        Family::Message => "message service",
    };
    match (code, kind) {
        (Some(code), ErrorKind::Unknown) => format!("{} error {}: {}", family, code, text),
        (Some(code), kind) => format!("{} error {}: {}", family, code, kind.description()),
        (None, _) => format!("{} error: {}", family, text),
    }
}


macro_rules! error_kinds {
    ( $( $kind:ident => $description:literal, )* ) => {
        /// descriptive kind of a coded error
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum ErrorKind {
            $( $kind, )*
            /// code absent from the tables, see [ProtocolError::code] for the raw value
            Unknown,
        }
        impl ErrorKind {
            /// human readable description, as used by modems in verbose mode
            pub fn description(self) -> &'static str {
                match self {
                    $( ErrorKind::$kind => $description, )*
                    ErrorKind::Unknown => "unknown",
                }
            }
        }
    };
}
error_kinds! {
    PhoneFailure => "phone failure",
    NoConnection => "no connection to phone",
    AdaptorLinkReserved => "phone-adaptor link reserved",
    OperationNotAllowed => "operation not allowed",
    OperationNotSupported => "operation not supported",
    PhSimPinRequired => "PH-SIM PIN required",
    SimNotInserted => "SIM not inserted",
    SimPinRequired => "SIM PIN required",
    SimPukRequired => "SIM PUK required",
    SimFailure => "SIM failure",
    SimBusy => "SIM busy",
    SimWrong => "SIM wrong",
    IncorrectPassword => "incorrect password",
    SimPin2Required => "SIM PIN2 required",
    SimPuk2Required => "SIM PUK2 required",
    MemoryFull => "memory full",
    InvalidIndex => "invalid index",
    NotFound => "not found",
    MemoryFailure => "memory failure",
    TextTooLong => "text string too long",
    InvalidText => "invalid characters in text string",
    DialStringTooLong => "dial string too long",
    InvalidDialString => "invalid characters in dial string",
    NoNetworkService => "no network service",
    NetworkTimeout => "network timeout",
    EmergencyCallsOnly => "network not allowed - emergency calls only",
    UnknownError => "unknown error",
    MeFailure => "ME failure",
    SmsServiceReserved => "SMS service of ME reserved",
    InvalidPduParameter => "invalid PDU mode parameter",
    InvalidTextParameter => "invalid text mode parameter",
    InvalidMemoryIndex => "invalid memory index",
    SmscAddressUnknown => "SMSC address unknown",
    NoCnmaExpected => "no +CNMA acknowledgement expected",
}

use ErrorKind::*;

/// TS 27.007 `+CME ERROR` codes
const EQUIPMENT_CODES: &[(u16, ErrorKind)] = &[
    (0, PhoneFailure),
    (1, NoConnection),
    (2, AdaptorLinkReserved),
    (3, OperationNotAllowed),
    (4, OperationNotSupported),
    (5, PhSimPinRequired),
    (10, SimNotInserted),
    (11, SimPinRequired),
    (12, SimPukRequired),
    (13, SimFailure),
    (14, SimBusy),
    (15, SimWrong),
    (16, IncorrectPassword),
    (17, SimPin2Required),
    (18, SimPuk2Required),
    (20, MemoryFull),
    (21, InvalidIndex),
    (22, NotFound),
    (23, MemoryFailure),
    (24, TextTooLong),
    (25, InvalidText),
    (26, DialStringTooLong),
    (27, InvalidDialString),
    (30, NoNetworkService),
    (31, NetworkTimeout),
    (32, EmergencyCallsOnly),
    (100, UnknownError),
];
/// TS 27.005 `+CMS ERROR` codes
const MESSAGE_CODES: &[(u16, ErrorKind)] = &[
    (300, MeFailure),
    (301, SmsServiceReserved),
    (302, OperationNotAllowed),
    (303, OperationNotSupported),
    (304, InvalidPduParameter),
    (305, InvalidTextParameter),
    (310, SimNotInserted),
    (311, SimPinRequired),
    (312, PhSimPinRequired),
    (313, SimFailure),
    (314, SimBusy),
    (315, SimWrong),
    (316, SimPukRequired),
    (317, SimPin2Required),
    (318, SimPuk2Required),
    (320, MemoryFailure),
    (321, InvalidMemoryIndex),
    (322, MemoryFull),
    (330, SmscAddressUnknown),
    (331, NoNetworkService),
    (332, NetworkTimeout),
    (340, NoCnmaExpected),
    (500, UnknownError),
];

fn table(family: Family) -> &'static [(u16, ErrorKind)] {
    match family {
        Family::Equipment => EQUIPMENT_CODES,
        Family::Message => MESSAGE_CODES,
    }
}

impl ErrorKind {
    /// look up a numeric code, codes absent from the tables give [ErrorKind::Unknown]
    pub fn from_code(family: Family, code: u16) -> Self {
        table(family).iter()
            .find(|&&(c, _)| c == code)
            .map(|&(_, kind)| kind)
            .unwrap_or(Unknown)
    }
}

//! WMP wire codec
//!
//! WMP is a line-oriented ASCII protocol. Commands are written as one line
//! terminated by `\r`; the gateway answers with lines terminated by `\r\n`.
//!
//! ```text
//! > SET,1:SETPTEMP,220
//! < ACK
//! < CHN,1:SETPTEMP,220
//! ```

use crate::error::ParseError;
use crate::types::{DeviceInfo, FunctionId};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Write as _;
use tokio_util::codec::{Decoder, Encoder};

/// Longest line accepted from the gateway before it is discarded
pub const MAX_LINE_LENGTH: usize = 1024;

/// Outbound WMP command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the gateway for its identity; doubles as the session handshake
    Id,
    /// Ask for extended gateway information
    Info,
    /// Keepalive, resets the gateway's watchdog
    Ping,
    /// Ask for the values a function accepts
    Limits(String),
    /// Read one function
    Get { unit: u8, function: String },
    /// Read every function of a unit
    GetAll { unit: u8 },
    /// Write one function
    Set {
        unit: u8,
        function: String,
        value: String,
    },
}

impl Command {
    /// Wire form, without the line terminator
    pub fn encode(&self) -> String {
        match self {
            Command::Id => "ID".to_string(),
            Command::Info => "INFO".to_string(),
            Command::Ping => "PING".to_string(),
            Command::Limits(function) => format!("LIMITS:{}", function),
            Command::Get { unit, function } => format!("GET,{}:{}", unit, function),
            Command::GetAll { unit } => format!("GET,{}:*", unit),
            Command::Set {
                unit,
                function,
                value,
            } => format!("SET,{}:{},{}", unit, function, value),
        }
    }
}

/// Inbound WMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Command accepted
    Ack,
    /// Command rejected
    Err,
    /// Keepalive reply carrying the current RSSI
    Pong(i32),
    /// `ID:model,mac,ip,protocol,version,rssi`
    Id(DeviceInfo),
    /// `INFO:key,value`
    Info { key: String, value: String },
    /// `LIMITS:function,[v1,v2,...]`
    Limits { function: String, values: Vec<String> },
    /// `CHN,unit:function,value`, sent on change and in reply to `GET`
    Change { function: FunctionId, value: String },
}

impl Message {
    /// Render the message the way the gateway sends it, without terminator
    pub fn to_line(&self) -> String {
        match self {
            Message::Ack => "ACK".to_string(),
            Message::Err => "ERR".to_string(),
            Message::Pong(rssi) => format!("PONG:{}", rssi),
            Message::Id(info) => {
                let mut line = format!(
                    "ID:{},{},{},{},{},",
                    info.model, info.mac, info.ip, info.protocol, info.firmware_version
                );
                if let Some(rssi) = info.rssi {
                    let _ = write!(line, "{}", rssi);
                }
                line
            }
            Message::Info { key, value } => format!("INFO:{},{}", key, value),
            Message::Limits { function, values } => {
                format!("LIMITS:{},[{}]", function, values.join(","))
            }
            Message::Change { function, value } => {
                format!("CHN,{}:{},{}", function.unit, function.name, value)
            }
        }
    }
}

/// Decode one line received from the gateway
///
/// Never panics: anything that does not match the grammar comes back as a
/// [`ParseError`] holding the raw line.
pub fn decode(line: &str) -> Result<Message, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ParseError::new(line, "empty line"));
    }

    match line {
        "ACK" => return Ok(Message::Ack),
        "ERR" => return Ok(Message::Err),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("CHN,") {
        return decode_change(line, rest);
    }

    let Some((head, args)) = line.split_once(':') else {
        return Err(ParseError::new(line, "unknown message"));
    };

    match head {
        "ID" => decode_id(line, args),
        "PONG" => args
            .trim()
            .parse::<i32>()
            .map(Message::Pong)
            .map_err(|_| ParseError::new(line, "PONG without numeric RSSI")),
        "LIMITS" => decode_limits(line, args),
        "INFO" => {
            let (key, value) = args
                .split_once(',')
                .ok_or_else(|| ParseError::new(line, "INFO without value"))?;
            Ok(Message::Info {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        _ => Err(ParseError::new(line, "unknown message")),
    }
}

fn decode_change(line: &str, rest: &str) -> Result<Message, ParseError> {
    let (target, value) = rest
        .split_once(',')
        .ok_or_else(|| ParseError::new(line, "CHN without value"))?;
    let (unit, name) = target
        .split_once(':')
        .ok_or_else(|| ParseError::new(line, "CHN target is not unit:function"))?;
    let unit = unit
        .parse::<u8>()
        .map_err(|_| ParseError::new(line, "CHN unit is not a number"))?;
    if !is_function_name(name) {
        return Err(ParseError::new(line, "CHN function name is invalid"));
    }

    Ok(Message::Change {
        function: FunctionId::new(unit, name),
        value: value.to_string(),
    })
}

fn decode_id(line: &str, args: &str) -> Result<Message, ParseError> {
    let fields: Vec<&str> = args.split(',').collect();
    if fields.len() < 6 {
        return Err(ParseError::new(line, "ID reply has fewer than 6 fields"));
    }

    Ok(Message::Id(DeviceInfo {
        model: fields[0].to_string(),
        mac: fields[1].to_string(),
        ip: fields[2].to_string(),
        protocol: fields[3].to_string(),
        firmware_version: fields[4].to_string(),
        rssi: fields[5].trim().parse::<i32>().ok(),
    }))
}

fn decode_limits(line: &str, args: &str) -> Result<Message, ParseError> {
    let (function, list) = args
        .split_once(',')
        .ok_or_else(|| ParseError::new(line, "LIMITS without value list"))?;
    if !is_function_name(function) {
        return Err(ParseError::new(line, "LIMITS function name is invalid"));
    }
    let inner = list
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .ok_or_else(|| ParseError::new(line, "LIMITS value list is not bracketed"))?;

    let values = if inner.is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(str::to_string).collect()
    };

    Ok(Message::Limits {
        function: function.to_string(),
        values,
    })
}

fn is_function_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Frames the TCP byte stream into WMP lines
///
/// Decoding yields `Ok(Message)` for well-formed lines and `Err(ParseError)`
/// for the rest, so a single bad line never closes the stream. Only socket
/// errors surface as `io::Error`.
#[derive(Debug, Default)]
pub struct WmpCodec {
    discarding: bool,
}

impl WmpCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for WmpCodec {
    type Item = Result<Message, ParseError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let terminator = src.iter().position(|b| *b == b'\r' || *b == b'\n');

            let Some(idx) = terminator else {
                if src.len() > MAX_LINE_LENGTH {
                    let head = ascii_line(&src[..32]);
                    src.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Ok(Some(Err(ParseError::new(head, "line too long"))));
                    }
                }
                return Ok(None);
            };

            let raw = src.split_to(idx);
            src.advance(1);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if raw.is_empty() {
                continue;
            }
            if raw.len() > MAX_LINE_LENGTH {
                return Ok(Some(Err(ParseError::new(
                    ascii_line(&raw[..32]),
                    "line too long",
                ))));
            }

            return Ok(Some(decode(&ascii_line(&raw))));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let raw = src.split();
        Ok(Some(decode(&ascii_line(&raw))))
    }
}

/// Lossy ASCII view of a raw line; other bytes become `?`
fn ascii_line(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

impl Encoder<Command> for WmpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = command.encode();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\r');
        Ok(())
    }
}

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::{Number, Value};

use crate::{
    canvas::{CanvasSnapshot, Rgb},
    constants::LEGACY_PING,
};

const INVALID_JSON_MESSAGE: &str = "Message must be JSON";
const INVALID_ARGUMENTS_MESSAGE: &str =
    "Expected: {type:'set_pixel', x:int, y:int, color:[r,g,b]} where 0-255";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidJson,
    InvalidArguments,
    OutOfBounds,
    UnknownType,
}

/// A validation failure reported back to the sender only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_json() -> Self {
        Self::new(ErrorKind::InvalidJson, INVALID_JSON_MESSAGE)
    }

    pub fn invalid_arguments() -> Self {
        Self::new(ErrorKind::InvalidArguments, INVALID_ARGUMENTS_MESSAGE)
    }

    pub fn unknown_type(received: &str) -> Self {
        Self::new(ErrorKind::UnknownType, format!("Unknown type: {received}"))
    }

    pub fn out_of_bounds(x: &Coordinate, y: &Coordinate, width: usize, height: usize) -> Self {
        Self::new(
            ErrorKind::OutOfBounds,
            format!("Pixel ({x},{y}) outside canvas {width}x{height}"),
        )
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::Error {
            error: err.kind,
            message: err.message,
        }
    }
}

/// First float magnitude that no longer fits `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// An integer coordinate as sent by a client.
///
/// Integers outside `i64` can never address a cell. They keep their decimal
/// text so the `out_of_bounds` reply can echo them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coordinate {
    Index(i64),
    Beyond(String),
}

impl Coordinate {
    /// Reads an integral JSON number. serde_json hands integers past `u64`
    /// and the literal `-0` over as floats, so a float with no fractional
    /// part counts as an integer too.
    fn from_number(number: &Number) -> Option<Self> {
        if let Some(value) = number.as_i64() {
            return Some(Coordinate::Index(value));
        }
        if let Some(value) = number.as_u64() {
            return Some(Coordinate::Beyond(value.to_string()));
        }

        let value = number.as_f64()?;
        if !value.is_finite() || value.fract() != 0.0 {
            return None;
        }
        if (-I64_LIMIT..I64_LIMIT).contains(&value) {
            Some(Coordinate::Index(value as i64))
        } else {
            Some(Coordinate::Beyond(format!("{value:.0}")))
        }
    }

    pub fn index(&self) -> Option<i64> {
        match self {
            Coordinate::Index(value) => Some(*value),
            Coordinate::Beyond(_) => None,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coordinate::Index(value) => write!(f, "{value}"),
            Coordinate::Beyond(text) => f.write_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for Coordinate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = Number::deserialize(deserializer)?;
        Coordinate::from_number(&number)
            .ok_or_else(|| D::Error::custom(format!("coordinate {number} is not an integer")))
    }
}

/// `[r, g, b]` with every channel an integer in `0..=255`.
fn color<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Rgb, D::Error> {
    let channels = <[Number; 3]>::deserialize(deserializer)?;
    let mut rgb = [0u8; 3];
    for (slot, number) in rgb.iter_mut().zip(&channels) {
        *slot = Coordinate::from_number(number)
            .and_then(|channel| channel.index())
            .and_then(|channel| u8::try_from(channel).ok())
            .ok_or_else(|| D::Error::custom(format!("color channel {number} is not in 0-255")))?;
    }
    Ok(Rgb(rgb))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetPixel {
    pub x: Coordinate,
    pub y: Coordinate,
    #[serde(deserialize_with = "color")]
    pub color: Rgb,
}

/// Everything a client can send, after JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Either the bare legacy `ping` text or `{"type":"ping"}`.
    Ping,
    SetPixel(SetPixel),
    GetCanvas,
    /// A `type` we do not recognize, rendered as received. Non-string types
    /// keep their JSON form; a missing `type` renders as `null`.
    Unknown(String),
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        if text == LEGACY_PING {
            return Ok(ClientMessage::Ping);
        }
        Self::from_json(text)
    }

    /// Binary frames are parsed as JSON only; the bare `ping` shortcut is a
    /// text frame thing.
    pub fn from_binary(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::invalid_json())?;
        Self::from_json(text)
    }

    fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::invalid_json())?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => return Ok(ClientMessage::Unknown(other.to_string())),
            None => return Ok(ClientMessage::Unknown(Value::Null.to_string())),
        };

        match kind {
            "ping" => Ok(ClientMessage::Ping),
            "get_canvas" => Ok(ClientMessage::GetCanvas),
            "set_pixel" => serde_json::from_value(value)
                .map(ClientMessage::SetPixel)
                .map_err(|_| ProtocolError::invalid_arguments()),
            other => Ok(ClientMessage::Unknown(other.to_string())),
        }
    }
}

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        width: usize,
        height: usize,
    },
    Pong,
    PixelUpdate {
        x: i64,
        y: i64,
        color: Rgb,
    },
    Canvas {
        width: usize,
        height: usize,
        data: CanvasSnapshot,
    },
    Error {
        error: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

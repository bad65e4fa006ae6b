use std::io;

use crate::codec::Tag;

/// Failure reported by the badge itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `EMEM`
    NoMemory,
    /// `EDAT`
    NoData,
    /// `EAPC`
    CreateFailed,
    /// `EAPE`
    EraseFailed,
    /// `EAPW`
    WriteFailed,
    /// `ESTR`
    StringFailure,
    /// `FAIL`, or an `er` reply in the structured family
    Failure,
    /// `ns` reply in the structured family
    NotSupported,
}

impl ErrorKind {
    pub fn from_tag(tag: Tag) -> Option<Self> {
        match &tag.to_bytes() {
            b"EMEM" => Some(ErrorKind::NoMemory),
            b"EDAT" => Some(ErrorKind::NoData),
            b"EAPC" => Some(ErrorKind::CreateFailed),
            b"EAPE" => Some(ErrorKind::EraseFailed),
            b"EAPW" => Some(ErrorKind::WriteFailed),
            b"ESTR" => Some(ErrorKind::StringFailure),
            b"FAIL" => Some(ErrorKind::Failure),
            _ => None,
        }
    }

    /// Short status reply of the structured family (`ok` is not an error)
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        match reply {
            b"er" => Some(ErrorKind::Failure),
            b"ns" => Some(ErrorKind::NotSupported),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ErrorKind::NoMemory => "Memory allocation failed",
            ErrorKind::NoData => "No data received",
            ErrorKind::CreateFailed => "Unable to create file",
            ErrorKind::EraseFailed => "Unable to erase flash",
            ErrorKind::WriteFailed => "Unable to write file",
            ErrorKind::StringFailure => "Operation failed (bad argument)",
            ErrorKind::Failure => "Operation failed",
            ErrorKind::NotSupported => "Operation not supported",
        };
        f.write_str(msg)
    }
}

/// What a frame or record failed to agree on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    Length { declared: u32, actual: usize },
    Crc { declared: u32, computed: u32 },
    Marker(u16),
    Oversized { declared: usize, max: usize },
}

impl std::fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFault::Length { declared, actual } => {
                write!(f, "length {declared} declared, {actual} received")
            }
            IntegrityFault::Crc { declared, computed } => write!(
                f,
                "crc 0x{declared:08x} declared, 0x{computed:08x} computed"
            ),
            IntegrityFault::Marker(marker) => {
                write!(f, "bad marker 0x{marker:04x}")
            }
            IntegrityFault::Oversized { declared, max } => {
                write!(f, "length {declared} exceeds {max}")
            }
        }
    }
}

/// Identity a reply is matched against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationKey {
    Message { opcode: u16, message_id: u32 },
    Tag(Tag),
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationKey::Message { opcode, message_id } => {
                write!(f, "opcode {opcode:#06x} id {message_id}")
            }
            CorrelationKey::Tag(tag) => write!(f, "{tag}"),
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    Serial(serialport::Error),
    DeviceNotFound,
    TransportWrite {
        written: usize,
        requested: usize,
        cause: Option<io::Error>,
    },
    TransportRead(io::Error),
    SyncTimeout(Tag),
    FrameIntegrity(IntegrityFault),
    Correlation {
        expected: CorrelationKey,
        received: Option<CorrelationKey>,
    },
    Device(ErrorKind),
    UnknownToken(Tag),
    NotAcknowledged(Tag),
    InvalidPayload(String),
    TimedOut { partial: Vec<u8> },
    Busy,
    Idle,
}

impl std::error::Error for ProtocolError {}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Usb(err) => write!(f, "USB error: {}", err),
            ProtocolError::Transfer(err) => {
                write!(f, "Transfer error: {}", err)
            }
            ProtocolError::Serial(err) => write!(f, "Serial error: {}", err),
            ProtocolError::DeviceNotFound => write!(f, "Badge not found"),
            ProtocolError::TransportWrite {
                written,
                requested,
                cause,
            } => {
                write!(f, "Write failed after {written} of {requested} bytes")?;
                if let Some(err) = cause {
                    write!(f, ": {err}")?;
                }
                Ok(())
            }
            ProtocolError::TransportRead(err) => {
                write!(f, "Read failed: {}", err)
            }
            ProtocolError::SyncTimeout(marker) => {
                write!(f, "No {marker} marker received")
            }
            ProtocolError::FrameIntegrity(fault) => {
                write!(f, "Frame integrity error: {fault}")
            }
            ProtocolError::Correlation { expected, received } => {
                match received {
                    Some(received) => write!(
                        f,
                        "Reply mismatch: expected {expected}, got {received}"
                    ),
                    None => write!(f, "Reply mismatch: {expected} not echoed"),
                }
            }
            ProtocolError::Device(kind) => write!(f, "Badge error: {kind}"),
            ProtocolError::UnknownToken(tag) => {
                write!(f, "Unknown response token {tag}")
            }
            ProtocolError::NotAcknowledged(tag) => {
                write!(f, "Command {tag} was not acknowledged")
            }
            ProtocolError::InvalidPayload(msg) => {
                write!(f, "Invalid reply payload: {msg}")
            }
            ProtocolError::TimedOut { partial } => {
                write!(f, "Timeout ({} bytes received)", partial.len())
            }
            ProtocolError::Busy => write!(f, "A request is already pending"),
            ProtocolError::Idle => write!(f, "No request is pending"),
        }
    }
}

impl From<nusb::Error> for ProtocolError {
    fn from(err: nusb::Error) -> Self {
        ProtocolError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for ProtocolError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        ProtocolError::Transfer(err)
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(err: serialport::Error) -> Self {
        ProtocolError::Serial(err)
    }
}

impl From<IntegrityFault> for ProtocolError {
    fn from(fault: IntegrityFault) -> Self {
        ProtocolError::FrameIntegrity(fault)
    }
}

impl From<ErrorKind> for ProtocolError {
    fn from(kind: ErrorKind) -> Self {
        ProtocolError::Device(kind)
    }
}

//! Wire encoding of both command families
//!
//! Everything is little-endian. The structured family uses a 12 byte
//! header:
//!
//! ```text
//! u16 opcode | u32 payload_length | u16 0xADDE | u32 message_id | payload
//! ```
//!
//! The token family wraps a tagged command body into a sync frame:
//!
//! ```text
//! marker[4] | u32 length | u32 crc32(body) | body
//! ```

use bytes::{Buf, BufMut};

use crate::error::{IntegrityFault, ProtocolError};

/// Fixed marker of a structured header (`DE AD` on the wire)
pub const PACKET_MARKER: u16 = 0xADDE;
pub const PACKET_HEADER_LEN: usize = 12;
pub const FRAME_HEADER_LEN: usize = 12;

/// A 4-byte ASCII token
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; 4]);

impl Tag {
    pub const OKOK: Tag = Tag(*b"OKOK");
    pub const WUSB: Tag = Tag(*b"WUSB");
    pub const FPGA: Tag = Tag(*b"FPGA");
    pub const FILE: Tag = Tag(*b"FILE");
    pub const DIRR: Tag = Tag(*b"DIRR");
    pub const APLS: Tag = Tag(*b"APLS");
    pub const APOW: Tag = Tag(*b"APOW");
    pub const APRM: Tag = Tag(*b"APRM");
    pub const FSLS: Tag = Tag(*b"FSLS");

    /// Tokens the badge uses to report a failure
    pub const ERRORS: [Tag; 7] = [
        Tag(*b"EMEM"),
        Tag(*b"EDAT"),
        Tag(*b"EAPC"),
        Tag(*b"EAPE"),
        Tag(*b"EAPW"),
        Tag(*b"ESTR"),
        Tag(*b"FAIL"),
    ];

    pub const fn new(bytes: [u8; 4]) -> Self {
        Tag(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        Some(Tag(data.get(..4)?.try_into().ok()?))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({self})")
    }
}

/// Opcodes of the structured family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    ExecFile = 0,
    Heartbeat = 1,
    AppBoot = 3,
    GetDir = 0x1000,
    ReadFile = 0x1001,
    WriteFile = 0x1002,
    DeleteFile = 0x1003,
    DuplicateFile = 0x1004,
    MoveFile = 0x1005,
    MakeDir = 0x1006,
    ListApps = 0x1007,
    DeleteApp = 0x1008,
    WriteApp = 0x1009,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Opcode::ExecFile,
            1 => Opcode::Heartbeat,
            3 => Opcode::AppBoot,
            0x1000 => Opcode::GetDir,
            0x1001 => Opcode::ReadFile,
            0x1002 => Opcode::WriteFile,
            0x1003 => Opcode::DeleteFile,
            0x1004 => Opcode::DuplicateFile,
            0x1005 => Opcode::MoveFile,
            0x1006 => Opcode::MakeDir,
            0x1007 => Opcode::ListApps,
            0x1008 => Opcode::DeleteApp,
            0x1009 => Opcode::WriteApp,
            _ => return None,
        })
    }
}

/// Header shared by structured requests and replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: u16,
    pub payload_len: u32,
    pub message_id: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut raw = [0u8; PACKET_HEADER_LEN];
        let mut buf = &mut raw[..];
        buf.put_u16_le(self.opcode);
        buf.put_u32_le(self.payload_len);
        buf.put_u16_le(PACKET_MARKER);
        buf.put_u32_le(self.message_id);
        raw
    }

    /// Decode the first [PACKET_HEADER_LEN] bytes of `data`
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(IntegrityFault::Length {
                declared: PACKET_HEADER_LEN as u32,
                actual: data.len(),
            }
            .into());
        }
        let opcode = data.get_u16_le();
        let payload_len = data.get_u32_le();
        let marker = data.get_u16_le();
        let message_id = data.get_u32_le();
        if marker != PACKET_MARKER {
            return Err(IntegrityFault::Marker(marker).into());
        }
        Ok(PacketHeader {
            opcode,
            payload_len,
            message_id,
        })
    }
}

/// Structured request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub message_id: u32,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(opcode: Opcode, message_id: u32, payload: Vec<u8>) -> Self {
        Request {
            opcode,
            message_id,
            payload,
        }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            opcode: self.opcode as u16,
            payload_len: self.payload.len() as u32,
            message_id: self.message_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Structured reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Commands of the token family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenCommand {
    ListApps,
    ListDir { path: String },
    InstallApp { name: String, data: Vec<u8>, run: bool },
    RemoveApp { name: String },
}

impl TokenCommand {
    pub fn tag(&self) -> Tag {
        match self {
            TokenCommand::ListApps => Tag::APLS,
            TokenCommand::ListDir { .. } => Tag::FSLS,
            TokenCommand::InstallApp { .. } => Tag::APOW,
            TokenCommand::RemoveApp { .. } => Tag::APRM,
        }
    }

    /// Whether the badge sends a second `OKOK` once the command completed.
    /// Counted listings stream their records right after the echo instead.
    pub fn expects_completion(&self) -> bool {
        !matches!(self, TokenCommand::ListApps)
    }

    /// Tag followed by the command fields
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(self.tag().as_bytes());
        match self {
            TokenCommand::ListApps => {}
            TokenCommand::ListDir { path } => {
                body.extend_from_slice(path.as_bytes());
                body.push(0);
            }
            TokenCommand::InstallApp { name, data, run } => {
                body.put_u32_le(name.len() as u32);
                body.extend_from_slice(name.as_bytes());
                body.push(*run as u8);
                body.extend_from_slice(data);
            }
            TokenCommand::RemoveApp { name } => {
                body.extend_from_slice(name.as_bytes());
                body.push(0);
            }
        }
        body
    }
}

/// A command of either family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Packet(Request),
    Token(TokenCommand),
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Packet(request) => request.encode(),
            Command::Token(cmd) => Frame::new(Tag::WUSB, cmd.body()).encode(),
        }
    }
}

/// Marker, length and CRC protected unit of transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub marker: Tag,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(marker: Tag, payload: Vec<u8>) -> Self {
        Frame { marker, payload }
    }

    pub fn header(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        let mut buf = &mut raw[..];
        buf.put_slice(self.marker.as_bytes());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(crc32(&self.payload));
        raw
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a complete frame, checking declared length and CRC
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let marker = Tag::from_slice(data).ok_or(IntegrityFault::Length {
            declared: FRAME_HEADER_LEN as u32,
            actual: data.len(),
        })?;
        if data.len() < FRAME_HEADER_LEN {
            return Err(IntegrityFault::Length {
                declared: FRAME_HEADER_LEN as u32,
                actual: data.len(),
            }
            .into());
        }
        let mut fields = &data[4..FRAME_HEADER_LEN];
        let length = fields.get_u32_le();
        let declared = fields.get_u32_le();
        let payload = &data[FRAME_HEADER_LEN..];
        if payload.len() != length as usize {
            return Err(IntegrityFault::Length {
                declared: length,
                actual: payload.len(),
            }
            .into());
        }
        let computed = crc32(payload);
        if computed != declared {
            return Err(IntegrityFault::Crc { declared, computed }.into());
        }
        Ok(Frame::new(marker, payload.to_vec()))
    }
}

/// Frames understood by the FPGA loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Drop whatever is bound to `fid`
    Clear { fid: u32 },
    /// Bind `fid` to a file on the badge
    RemoteFile { fid: u32, path: String },
    /// Bind `fid` to the given data
    DataBlock { fid: u32, data: Vec<u8> },
    /// The bitstream itself, always sent last
    Bitstream(Vec<u8>),
}

impl Binding {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Binding::Clear { fid } => {
                out.push(b'C');
                out.put_u32_le(*fid);
                out.put_bytes(0, 8);
            }
            Binding::RemoteFile { fid, path } => {
                put_block(&mut out, b'F', *fid, path.as_bytes());
            }
            Binding::DataBlock { fid, data } => {
                put_block(&mut out, b'D', *fid, data);
            }
            Binding::Bitstream(data) => put_block(&mut out, b'B', 0, data),
        }
        out
    }
}

fn put_block(out: &mut Vec<u8>, kind: u8, fid: u32, data: &[u8]) {
    out.push(kind);
    out.put_u32_le(fid);
    out.put_u32_le(data.len() as u32);
    out.put_u32_le(crc32(data));
    out.extend_from_slice(data);
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Find the first of `markers` in `data`
///
/// Returns the marker and its offset, i.e. the number of leading noise bytes
/// to drop before the marker.
pub fn recognize(data: &[u8], markers: &[Tag]) -> Option<(Tag, usize)> {
    data.windows(4).enumerate().find_map(|(offset, window)| {
        markers
            .iter()
            .find(|m| m.as_bytes() == window)
            .map(|m| (*m, offset))
    })
}

/// Number of leading bytes that cannot be part of any of `markers`
///
/// Keeps the longest suffix that may be the start of a marker split across
/// two reads.
pub fn discardable(data: &[u8], markers: &[Tag]) -> usize {
    let keep = (1..4)
        .rev()
        .find(|&n| {
            data.len() >= n
                && markers
                    .iter()
                    .any(|m| m.as_bytes().starts_with(&data[data.len() - n..]))
        })
        .unwrap_or(0);
    data.len() - keep
}

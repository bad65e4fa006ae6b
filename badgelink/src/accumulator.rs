//! Incremental reassembly of replies
//!
//! Physical reads never line up with message boundaries, so both
//! accumulators take arbitrarily sized fragments and only ever look at
//! bytes that are already buffered. Feeding a reply in one piece or one
//! byte at a time yields the same result.
//!
//! A token family reply looks like:
//!
//! ```text
//! OKOK <tag> OKOK [FILE|DIRR record...] WUSB
//! OKOK APLS u32 count | u32 buffer_size | {u32 fid | u32 name_len | name}* WUSB
//! ```
//!
//! where a `FILE`/`DIRR` record is `u32 name_len | name | u32 size | u32 mtime`.

use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};

use crate::codec::{
    PACKET_HEADER_LEN, Packet, PacketHeader, Tag, discardable, recognize,
};
use crate::error::{ErrorKind, IntegrityFault, ProtocolError};

const MAX_NAME_LEN: usize = 4096;
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Outcome of feeding bytes to an accumulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// More input is needed
    Pending,
    Done(T),
}

/// Common interface of both reply families
pub trait Accumulate {
    type Output;

    fn feed(&mut self, data: &[u8])
    -> Result<Progress<Self::Output>, ProtocolError>;

    /// Bytes received but not consumed yet
    fn buffered(&self) -> &[u8];

    fn reset(&mut self);

    /// Clear the accumulator, handing back the raw bytes of the unfinished
    /// reply
    fn take_partial(&mut self) -> Vec<u8> {
        let partial = self.buffered().to_vec();
        self.reset();
        partial
    }
}

/// Classification of the latest token seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Ok,
    CommandEcho,
    Failed(ErrorKind),
    UnknownToken([u8; 4]),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u32,
    pub mtime: u32,
}

/// Application stored in AppFS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEntry {
    pub name: String,
    pub fid: Option<u32>,
    pub size: Option<u32>,
}

/// One element of a token family reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ack,
    Echo(Tag),
    Entry(EntryKind, DirectoryEntry),
    App(AppEntry),
    Unknown(Tag),
}

/// Complete token family reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReply {
    pub command: Tag,
    pub failure: Option<ErrorKind>,
    pub records: Vec<Record>,
}

impl TokenReply {
    pub fn echoed(&self) -> bool {
        self.records.iter().any(|r| matches!(r, Record::Echo(_)))
    }

    /// `OKOK` seen before the echo (command received)
    pub fn received(&self) -> bool {
        self.records
            .iter()
            .take_while(|r| !matches!(r, Record::Echo(_)))
            .any(|r| matches!(r, Record::Ack))
    }

    /// `OKOK` seen after the echo (command completed)
    pub fn completed(&self) -> bool {
        self.records
            .iter()
            .skip_while(|r| !matches!(r, Record::Echo(_)))
            .any(|r| matches!(r, Record::Ack))
    }

    pub fn entries(&self) -> impl Iterator<Item = (EntryKind, &DirectoryEntry)> {
        self.records.iter().filter_map(|r| match r {
            Record::Entry(kind, entry) => Some((*kind, entry)),
            _ => None,
        })
    }

    pub fn apps(&self) -> impl Iterator<Item = &AppEntry> {
        self.records.iter().filter_map(|r| match r {
            Record::App(app) => Some(app),
            _ => None,
        })
    }

    pub fn unknown(&self) -> impl Iterator<Item = Tag> + '_ {
        self.records.iter().filter_map(|r| match r {
            Record::Unknown(tag) => Some(*tag),
            _ => None,
        })
    }

    /// Reject the reply if it carried unknown tokens
    pub fn strict(self) -> Result<Self, ProtocolError> {
        let unknown = self.unknown().next();
        match unknown {
            Some(tag) => Err(ProtocolError::UnknownToken(tag)),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entry(EntryKind),
    App,
}

impl RecordKind {
    /// Bytes in front of the name
    fn header_len(self) -> usize {
        match self {
            RecordKind::Entry(_) => 4,
            RecordKind::App => 8,
        }
    }

    /// Bytes after the name
    fn trailer_len(self) -> usize {
        match self {
            RecordKind::Entry(_) => 8,
            RecordKind::App => 0,
        }
    }
}

/// Parser state of [ResponseAccumulator]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingSync,
    ReadingToken,
    ReadingListHeader,
    ReadingRecordHeader {
        kind: RecordKind,
        remaining: u32,
    },
    ReadingRecordBody {
        kind: RecordKind,
        name_len: usize,
        fid: u32,
        remaining: u32,
    },
    Terminal,
}

/// State machine reassembling a token family reply
///
/// Leading noise is dropped until a known token shows up. From then on
/// every 4 bytes form a token; unknown tokens are recorded and skipped.
/// `FILE`/`DIRR` tokens and the echo of a counted listing switch to record
/// parsing, which waits until the complete record is buffered.
pub struct ResponseAccumulator {
    command: Tag,
    counted: bool,
    known: Vec<Tag>,
    buf: BytesMut,
    // everything fed since the first token, parsed or not
    received: BytesMut,
    state: State,
    status: ResponseStatus,
    records: Vec<Record>,
    discarded: usize,
}

impl ResponseAccumulator {
    pub fn new(command: Tag) -> Self {
        let mut known = vec![Tag::OKOK, Tag::WUSB, command];
        known.extend_from_slice(&Tag::ERRORS);
        ResponseAccumulator {
            command,
            counted: command == Tag::APLS,
            known,
            buf: BytesMut::with_capacity(1024),
            received: BytesMut::new(),
            state: State::AwaitingSync,
            status: ResponseStatus::Pending,
            records: Vec::new(),
            discarded: 0,
        }
    }

    pub fn command(&self) -> Tag {
        self.command
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Records completed so far
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Noise bytes dropped while waiting for the first token
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Give up on the current reply
    pub fn expire(&mut self) -> Vec<u8> {
        let partial = self.take_partial();
        self.status = ResponseStatus::TimedOut;
        partial
    }

    fn step(&mut self) -> Result<Option<TokenReply>, ProtocolError> {
        loop {
            match self.state {
                State::AwaitingSync => {
                    match recognize(&self.buf, &self.known) {
                        Some((tag, offset)) => {
                            if offset > 0 {
                                warn!("Dropped {offset} bytes before {tag}");
                            }
                            self.discard(offset);
                            self.state = State::ReadingToken;
                        }
                        None => {
                            let n = discardable(&self.buf, &self.known);
                            self.discard(n);
                            return Ok(None);
                        }
                    }
                }
                State::ReadingToken => {
                    let Some(tag) = Tag::from_slice(&self.buf) else {
                        return Ok(None);
                    };
                    self.buf.advance(4);
                    if let Some(reply) = self.token(tag) {
                        return Ok(Some(reply));
                    }
                }
                State::ReadingListHeader => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    let count = self.buf.get_u32_le();
                    let size = self.buf.get_u32_le();
                    debug!("{count} apps listed ({size} bytes of names)");
                    self.state = if count > 0 {
                        State::ReadingRecordHeader {
                            kind: RecordKind::App,
                            remaining: count,
                        }
                    } else {
                        State::ReadingToken
                    };
                }
                State::ReadingRecordHeader { kind, remaining } => {
                    if self.buf.len() < kind.header_len() {
                        return Ok(None);
                    }
                    let fid = match kind {
                        RecordKind::App => self.buf.get_u32_le(),
                        RecordKind::Entry(_) => 0,
                    };
                    let name_len = self.buf.get_u32_le() as usize;
                    if name_len > MAX_NAME_LEN {
                        return Err(IntegrityFault::Oversized {
                            declared: name_len,
                            max: MAX_NAME_LEN,
                        }
                        .into());
                    }
                    self.state = State::ReadingRecordBody {
                        kind,
                        name_len,
                        fid,
                        remaining,
                    };
                }
                State::ReadingRecordBody {
                    kind,
                    name_len,
                    fid,
                    remaining,
                } => {
                    if self.buf.len() < name_len + kind.trailer_len() {
                        return Ok(None);
                    }
                    let name = String::from_utf8_lossy(&self.buf[..name_len])
                        .into_owned();
                    self.buf.advance(name_len);
                    let record = match kind {
                        RecordKind::Entry(entry_kind) => {
                            let size = self.buf.get_u32_le();
                            let mtime = self.buf.get_u32_le();
                            Record::Entry(
                                entry_kind,
                                DirectoryEntry { name, size, mtime },
                            )
                        }
                        RecordKind::App => Record::App(AppEntry {
                            name,
                            fid: Some(fid),
                            size: None,
                        }),
                    };
                    trace!("Record {record:?}");
                    self.records.push(record);
                    self.state = if remaining > 1 {
                        State::ReadingRecordHeader {
                            kind,
                            remaining: remaining - 1,
                        }
                    } else {
                        State::ReadingToken
                    };
                }
                State::Terminal => {
                    if !self.buf.is_empty() {
                        trace!("Ignoring {} bytes after reply", self.buf.len());
                        self.buf.clear();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn token(&mut self, tag: Tag) -> Option<TokenReply> {
        trace!("Token {tag}");
        if tag == Tag::OKOK {
            self.status = ResponseStatus::Ok;
            self.records.push(Record::Ack);
        } else if tag == self.command {
            self.status = ResponseStatus::CommandEcho;
            self.records.push(Record::Echo(tag));
            if self.counted {
                self.state = State::ReadingListHeader;
            }
        } else if tag == Tag::WUSB {
            if self.records.is_empty() {
                // idle sync marker still in flight
                debug!("Skipping stray {tag}");
            } else {
                return Some(self.finish(None));
            }
        } else if let Some(kind) = ErrorKind::from_tag(tag) {
            self.status = ResponseStatus::Failed(kind);
            return Some(self.finish(Some(kind)));
        } else if tag == Tag::FILE || tag == Tag::DIRR {
            let kind = if tag == Tag::FILE {
                EntryKind::File
            } else {
                EntryKind::Directory
            };
            self.state = State::ReadingRecordHeader {
                kind: RecordKind::Entry(kind),
                remaining: 1,
            };
        } else {
            warn!("Unknown response token {tag}");
            self.status = ResponseStatus::UnknownToken(tag.to_bytes());
            self.records.push(Record::Unknown(tag));
        }
        None
    }

    fn finish(&mut self, failure: Option<ErrorKind>) -> TokenReply {
        self.state = State::Terminal;
        if !self.buf.is_empty() {
            debug!("{} bytes left after {}", self.buf.len(), self.command);
            self.buf.clear();
        }
        TokenReply {
            command: self.command,
            failure,
            records: std::mem::take(&mut self.records),
        }
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            trace!("Discarding {n} bytes");
            self.buf.advance(n);
            self.received.advance(n);
            self.discarded += n;
        }
    }
}

impl Accumulate for ResponseAccumulator {
    type Output = TokenReply;

    fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<Progress<TokenReply>, ProtocolError> {
        self.buf.extend_from_slice(data);
        self.received.extend_from_slice(data);
        Ok(match self.step()? {
            Some(reply) => Progress::Done(reply),
            None => Progress::Pending,
        })
    }

    fn buffered(&self) -> &[u8] {
        &self.buf
    }

    fn take_partial(&mut self) -> Vec<u8> {
        let partial = self.received.to_vec();
        self.reset();
        partial
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.received.clear();
        self.records.clear();
        self.state = State::AwaitingSync;
        self.status = ResponseStatus::Pending;
        self.discarded = 0;
    }
}

/// Reassembles one structured reply: header, then `payload_len` bytes
pub struct PacketAccumulator {
    buf: BytesMut,
    header: Option<PacketHeader>,
}

impl PacketAccumulator {
    pub fn new() -> Self {
        PacketAccumulator {
            buf: BytesMut::with_capacity(1024),
            header: None,
        }
    }

    /// Header of the reply being received, once complete
    pub fn header(&self) -> Option<&PacketHeader> {
        self.header.as_ref()
    }
}

impl Default for PacketAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulate for PacketAccumulator {
    type Output = Packet;

    fn feed(&mut self, data: &[u8]) -> Result<Progress<Packet>, ProtocolError> {
        self.buf.extend_from_slice(data);

        let header = match self.header {
            Some(header) => header,
            None => {
                if self.buf.len() < PACKET_HEADER_LEN {
                    return Ok(Progress::Pending);
                }
                let header = PacketHeader::decode(&self.buf)?;
                if header.payload_len as usize > MAX_PAYLOAD_LEN {
                    return Err(IntegrityFault::Oversized {
                        declared: header.payload_len as usize,
                        max: MAX_PAYLOAD_LEN,
                    }
                    .into());
                }
                self.buf.advance(PACKET_HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        let len = header.payload_len as usize;
        if self.buf.len() < len {
            return Ok(Progress::Pending);
        }
        let payload = self.buf.split_to(len).to_vec();
        if !self.buf.is_empty() {
            debug!("{} bytes left after reply", self.buf.len());
        }
        self.reset();
        Ok(Progress::Done(Packet { header, payload }))
    }

    fn buffered(&self) -> &[u8] {
        &self.buf
    }

    fn take_partial(&mut self) -> Vec<u8> {
        let mut partial = match self.header.take() {
            Some(header) => header.encode().to_vec(),
            None => Vec::new(),
        };
        partial.extend_from_slice(&self.buf);
        self.reset();
        partial
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.header = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Opcode, Request};

    fn entry(kind: &[u8; 4], name: &str, size: u32, mtime: u32) -> Vec<u8> {
        let mut raw = kind.to_vec();
        raw.extend_from_slice(&(name.len() as u32).to_le_bytes());
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(&size.to_le_bytes());
        raw.extend_from_slice(&mtime.to_le_bytes());
        raw
    }

    fn listing(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut raw = b"OKOKFSLSOKOK".to_vec();
        for e in entries {
            raw.extend_from_slice(e);
        }
        raw.extend_from_slice(b"WUSB");
        raw
    }

    fn feed_all<A: Accumulate>(
        acc: &mut A,
        data: &[u8],
        chunk: usize,
    ) -> Option<A::Output> {
        for piece in data.chunks(chunk) {
            if let Progress::Done(out) = acc.feed(piece).unwrap() {
                return Some(out);
            }
        }
        None
    }

    #[test]
    fn test_install_sequence() {
        let mut acc = ResponseAccumulator::new(Tag::APOW);
        let reply = feed_all(&mut acc, b"OKOKAPOWOKOKWUSB", 128).unwrap();
        assert_eq!(
            reply.records,
            vec![Record::Ack, Record::Echo(Tag::APOW), Record::Ack]
        );
        assert!(reply.received() && reply.echoed() && reply.completed());
        assert_eq!(reply.failure, None);
        assert!(reply.clone().strict().is_ok());
        assert_eq!(acc.state(), State::Terminal);
    }

    #[test]
    fn test_listing_sizes() {
        for n in [0usize, 1, 5] {
            let entries: Vec<Vec<u8>> = (0..n)
                .map(|i| {
                    let kind = if i % 2 == 0 { b"FILE" } else { b"DIRR" };
                    entry(kind, &format!("entry{i}.bin"), 1000 * i as u32, 42)
                })
                .collect();
            let mut acc = ResponseAccumulator::new(Tag::FSLS);
            let reply = feed_all(&mut acc, &listing(&entries), 64).unwrap();
            let parsed: Vec<_> = reply.entries().collect();
            assert_eq!(parsed.len(), n);
            for (i, (kind, e)) in parsed.iter().enumerate() {
                let expected = if i % 2 == 0 {
                    EntryKind::File
                } else {
                    EntryKind::Directory
                };
                assert_eq!(*kind, expected);
                assert_eq!(e.name, format!("entry{i}.bin"));
                assert_eq!(e.size, 1000 * i as u32);
                assert_eq!(e.mtime, 42);
            }
            assert!(acc.buffered().is_empty());
        }
    }

    #[test]
    fn test_chunking_invariance() {
        let mut data = b"\x00\xffnoise".to_vec();
        data.extend(listing(&[
            entry(b"FILE", "a.py", 12, 1),
            entry(b"DIRR", "lib", 0, 2),
            b"XYZW".to_vec(),
            entry(b"FILE", "", 0, 3),
            entry(b"FILE", "longer name.txt", 65536, 4),
        ]));

        let mut whole = ResponseAccumulator::new(Tag::FSLS);
        let expected = feed_all(&mut whole, &data, data.len()).unwrap();
        assert_eq!(expected.entries().count(), 4);
        assert_eq!(expected.unknown().collect::<Vec<_>>(), [Tag::new(*b"XYZW")]);
        assert!(matches!(
            expected.clone().strict(),
            Err(ProtocolError::UnknownToken(tag)) if tag == Tag::new(*b"XYZW")
        ));

        for size in [1, 2, 3, 5, 7, 13] {
            let mut acc = ResponseAccumulator::new(Tag::FSLS);
            assert_eq!(feed_all(&mut acc, &data, size).unwrap(), expected);
            assert!(acc.buffered().is_empty());
        }
    }

    #[test]
    fn test_record_waits_for_bytes() {
        let mut acc = ResponseAccumulator::new(Tag::FSLS);
        let raw = listing(&[entry(b"FILE", "main.py", 300, 9)]);
        // up to and including half of the name
        let split = 12 + 4 + 4 + 3;
        assert_eq!(acc.feed(&raw[..split]).unwrap(), Progress::Pending);
        assert!(matches!(acc.state(), State::ReadingRecordBody { .. }));
        assert_eq!(acc.records().len(), 3);
        let Progress::Done(reply) = acc.feed(&raw[split..]).unwrap() else {
            panic!("reply not complete");
        };
        let (_, e) = reply.entries().next().unwrap();
        assert_eq!(e.name, "main.py");
        assert_eq!(e.size, 300);
    }

    #[test]
    fn test_app_listing() {
        let mut raw = b"OKOKAPLS".to_vec();
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&9u32.to_le_bytes());
        for (fid, name) in [(3u32, "demo"), (7, "snake")] {
            raw.extend_from_slice(&fid.to_le_bytes());
            raw.extend_from_slice(&(name.len() as u32).to_le_bytes());
            raw.extend_from_slice(name.as_bytes());
        }
        raw.extend_from_slice(b"WUSB");

        let mut acc = ResponseAccumulator::new(Tag::APLS);
        let reply = feed_all(&mut acc, &raw, 1).unwrap();
        let apps: Vec<_> = reply.apps().cloned().collect();
        assert_eq!(
            apps,
            vec![
                AppEntry {
                    name: "demo".into(),
                    fid: Some(3),
                    size: None
                },
                AppEntry {
                    name: "snake".into(),
                    fid: Some(7),
                    size: None
                },
            ]
        );
        assert!(reply.received() && reply.echoed());
    }

    #[test]
    fn test_error_token() {
        let mut acc = ResponseAccumulator::new(Tag::APOW);
        let reply = feed_all(&mut acc, b"OKOKAPOWEAPE", 3).unwrap();
        assert_eq!(reply.failure, Some(ErrorKind::EraseFailed));
        assert_eq!(
            acc.status(),
            ResponseStatus::Failed(ErrorKind::EraseFailed)
        );
    }

    #[test]
    fn test_noise_and_stray_sync() {
        let mut acc = ResponseAccumulator::new(Tag::APRM);
        assert_eq!(acc.feed(b"garbageWU").unwrap(), Progress::Pending);
        // possible start of a marker is kept
        assert_eq!(acc.buffered(), b"WU");
        let reply = feed_all(&mut acc, b"SBOKOKAPRMOKOKWUSB", 4).unwrap();
        assert_eq!(reply.records.len(), 3);
        assert_eq!(acc.discarded(), 7);
    }

    #[test]
    fn test_oversized_name() {
        let mut acc = ResponseAccumulator::new(Tag::FSLS);
        let mut raw = b"OKOKFSLSOKOKFILE".to_vec();
        raw.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            acc.feed(&raw),
            Err(ProtocolError::FrameIntegrity(IntegrityFault::Oversized {
                ..
            }))
        ));
    }

    #[test]
    fn test_expire() {
        let mut acc = ResponseAccumulator::new(Tag::APOW);
        acc.feed(b"noiseOKOK").unwrap();
        acc.feed(b"AP").unwrap();
        assert_eq!(acc.expire(), b"OKOKAP");
        assert_eq!(acc.status(), ResponseStatus::TimedOut);
        assert!(acc.buffered().is_empty() && acc.records().is_empty());
        assert_eq!(acc.state(), State::AwaitingSync);
    }

    #[test]
    fn test_packet_reply() {
        let reply = Request::new(Opcode::GetDir, 7, b"/apps\nfone.bin".to_vec())
            .encode();
        let mut acc = PacketAccumulator::new();
        let packet = feed_all(&mut acc, &reply, 1).unwrap();
        assert_eq!(packet.header.message_id, 7);
        assert_eq!(packet.header.opcode, 0x1000);
        assert_eq!(packet.payload, b"/apps\nfone.bin");
        assert!(acc.buffered().is_empty() && acc.header().is_none());
    }

    #[test]
    fn test_packet_empty_payload() {
        let reply = Request::new(Opcode::Heartbeat, 2, vec![]).encode();
        let mut acc = PacketAccumulator::new();
        assert_eq!(acc.feed(&reply[..11]).unwrap(), Progress::Pending);
        let Progress::Done(packet) = acc.feed(&reply[11..]).unwrap() else {
            panic!("reply not complete");
        };
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_packet_partial_keeps_header() {
        let reply = Request::new(Opcode::ReadFile, 3, vec![7; 40]).encode();
        let mut acc = PacketAccumulator::new();
        assert_eq!(acc.feed(&reply[..20]).unwrap(), Progress::Pending);
        assert!(acc.header().is_some());
        assert_eq!(acc.take_partial(), &reply[..20]);
        assert!(acc.header().is_none() && acc.buffered().is_empty());
    }

    #[test]
    fn test_packet_bad_marker() {
        let mut acc = PacketAccumulator::new();
        assert!(matches!(
            acc.feed(&[0u8; 12]),
            Err(ProtocolError::FrameIntegrity(IntegrityFault::Marker(0)))
        ));
    }
}

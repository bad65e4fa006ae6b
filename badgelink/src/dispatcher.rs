use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::accumulator::{
    Accumulate, PacketAccumulator, Progress, ResponseAccumulator, TokenReply,
};
use crate::codec::{
    Command, Frame, Opcode, Packet, Request, Tag, TokenCommand, discardable,
    recognize,
};
use crate::config::LinkConfig;
use crate::error::{CorrelationKey, ProtocolError};
use crate::sender::ChunkedSender;
use crate::transport::Transport;

/// Validated reply to a [Command]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Packet(Packet),
    Tokens(TokenReply),
}

enum Exchange {
    Packet {
        opcode: u16,
        message_id: u32,
        acc: PacketAccumulator,
    },
    Token {
        completion: bool,
        acc: ResponseAccumulator,
    },
}

impl Exchange {
    fn expected(&self) -> CorrelationKey {
        match self {
            Exchange::Packet {
                opcode, message_id, ..
            } => CorrelationKey::Message {
                opcode: *opcode,
                message_id: *message_id,
            },
            Exchange::Token { acc, .. } => CorrelationKey::Tag(acc.command()),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<Progress<Reply>, ProtocolError> {
        Ok(match self {
            Exchange::Packet { acc, .. } => match acc.feed(data)? {
                Progress::Done(packet) => Progress::Done(Reply::Packet(packet)),
                Progress::Pending => Progress::Pending,
            },
            Exchange::Token { acc, .. } => match acc.feed(data)? {
                Progress::Done(reply) => Progress::Done(Reply::Tokens(reply)),
                Progress::Pending => Progress::Pending,
            },
        })
    }

    fn expire(&mut self) -> Vec<u8> {
        match self {
            Exchange::Packet { acc, .. } => acc.take_partial(),
            Exchange::Token { acc, .. } => acc.expire(),
        }
    }

    /// Match a complete reply against the request
    fn validate(&self, reply: Reply) -> Result<Reply, ProtocolError> {
        match (self, reply) {
            (
                Exchange::Packet {
                    opcode, message_id, ..
                },
                Reply::Packet(packet),
            ) => {
                let header = packet.header;
                if header.opcode != *opcode || header.message_id != *message_id
                {
                    return Err(ProtocolError::Correlation {
                        expected: self.expected(),
                        received: Some(CorrelationKey::Message {
                            opcode: header.opcode,
                            message_id: header.message_id,
                        }),
                    });
                }
                Ok(Reply::Packet(packet))
            }
            (Exchange::Token { completion, .. }, Reply::Tokens(reply)) => {
                if let Some(kind) = reply.failure {
                    return Err(ProtocolError::Device(kind));
                }
                if !reply.echoed() {
                    return Err(ProtocolError::Correlation {
                        expected: self.expected(),
                        received: None,
                    });
                }
                if !reply.received() || (*completion && !reply.completed()) {
                    return Err(ProtocolError::NotAcknowledged(reply.command));
                }
                Ok(Reply::Tokens(reply))
            }
            (_, reply) => Err(ProtocolError::Correlation {
                expected: self.expected(),
                received: Some(match reply {
                    Reply::Packet(packet) => CorrelationKey::Message {
                        opcode: packet.header.opcode,
                        message_id: packet.header.message_id,
                    },
                    Reply::Tokens(tokens) => CorrelationKey::Tag(tokens.command),
                }),
            }),
        }
    }
}

struct PendingRequest {
    exchange: Exchange,
    deadline: Instant,
}

/// Keeps exactly one request in flight on a [Transport]
///
/// A request is started with [Dispatcher::begin] and driven to completion by
/// calling [Dispatcher::poll] until it returns [Progress::Done], or by
/// [Dispatcher::call] which does both. Each poll performs at most one
/// bounded transport read, so the deadline of the exchange always holds.
/// Any error, timeout included, ends the exchange.
pub struct Dispatcher<T: Transport> {
    transport: T,
    config: LinkConfig,
    sender: ChunkedSender,
    message_id: u32,
    pending: Option<PendingRequest>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let sender = ChunkedSender::new(config.chunk_size, config.chunk_delay);
        Dispatcher {
            transport,
            config,
            sender,
            message_id: 0,
            pending: None,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn next_message_id(&mut self) -> u32 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    /// Read until `marker` shows up or `timeout` expires
    ///
    /// Anything received up to and including the marker is dropped.
    pub fn synchronize(
        &mut self,
        marker: Tag,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }
        debug!("Waiting for {marker}");
        let deadline = Instant::now() + timeout;
        let markers = [marker];
        let mut buf = Vec::new();
        loop {
            let data = self.read_once()?;
            buf.extend_from_slice(&data);
            if let Some((_, offset)) = recognize(&buf, &markers) {
                if offset > 0 {
                    debug!("Skipped {offset} bytes before {marker}");
                }
                info!("Synchronized on {marker}");
                return Ok(());
            }
            let n = discardable(&buf, &markers);
            buf.drain(..n);
            if Instant::now() >= deadline {
                return Err(ProtocolError::SyncTimeout(marker));
            }
            if data.is_empty() {
                thread::sleep(self.config.poll_interval);
            }
        }
    }

    pub fn begin(
        &mut self,
        command: Command,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.begin_with_progress(command, timeout, |_, _| {})
    }

    /// Send `command` and register it as the pending request
    ///
    /// The header goes out in a write of its own, the body follows in
    /// paced chunks, reporting `progress(sent, total)` along the way. The
    /// deadline starts once the body is sent.
    pub fn begin_with_progress<F>(
        &mut self,
        command: Command,
        timeout: Duration,
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }

        let (exchange, header, body) = match command {
            Command::Packet(request) => (
                Exchange::Packet {
                    opcode: request.opcode as u16,
                    message_id: request.message_id,
                    acc: PacketAccumulator::new(),
                },
                request.header().encode().to_vec(),
                request.payload,
            ),
            Command::Token(cmd) => {
                let frame = Frame::new(Tag::WUSB, cmd.body());
                (
                    Exchange::Token {
                        completion: cmd.expects_completion(),
                        acc: ResponseAccumulator::new(cmd.tag()),
                    },
                    frame.header().to_vec(),
                    frame.payload,
                )
            }
        };
        debug!("Sending {} ({} bytes)", exchange.expected(), body.len());

        self.write_header(&header)?;
        self.sender
            .send_with_progress(&mut self.transport, &body, progress)?;

        self.pending = Some(PendingRequest {
            exchange,
            deadline: Instant::now() + timeout,
        });
        Ok(())
    }

    /// Perform one read for the pending request
    pub fn poll(&mut self) -> Result<Progress<Reply>, ProtocolError> {
        self.step().map(|(progress, _)| progress)
    }

    /// Like [Dispatcher::poll], also telling whether the read returned data
    fn step(&mut self) -> Result<(Progress<Reply>, bool), ProtocolError> {
        let mut pending = self.pending.take().ok_or(ProtocolError::Idle)?;

        let data = self.read_once()?;
        if !data.is_empty() {
            trace!("Read {} bytes", data.len());
            if let Progress::Done(reply) = pending.exchange.feed(&data)? {
                let reply = pending.exchange.validate(reply)?;
                return Ok((Progress::Done(reply), true));
            }
        }

        if Instant::now() >= pending.deadline {
            let partial = pending.exchange.expire();
            warn!(
                "{} timed out ({} bytes received)",
                pending.exchange.expected(),
                partial.len()
            );
            return Err(ProtocolError::TimedOut { partial });
        }

        self.pending = Some(pending);
        Ok((Progress::Pending, !data.is_empty()))
    }

    /// Poll until the pending request resolves
    ///
    /// Sleeps `poll_interval` only after reads that came back empty.
    pub fn wait(&mut self) -> Result<Reply, ProtocolError> {
        loop {
            match self.step()? {
                (Progress::Done(reply), _) => return Ok(reply),
                (Progress::Pending, true) => {}
                (Progress::Pending, false) => {
                    thread::sleep(self.config.poll_interval)
                }
            }
        }
    }

    pub fn call(
        &mut self,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, ProtocolError> {
        self.begin(command, timeout)?;
        self.wait()
    }

    /// Structured request with a fresh message id
    pub fn call_packet(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Packet, ProtocolError> {
        self.call_packet_with_progress(opcode, payload, |_, _| {})
    }

    pub fn call_packet_with_progress<F>(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
        progress: F,
    ) -> Result<Packet, ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        let request = Request::new(opcode, self.next_message_id(), payload);
        let expected = CorrelationKey::Message {
            opcode: opcode as u16,
            message_id: request.message_id,
        };
        let timeout = self.config.timeout;
        self.begin_with_progress(Command::Packet(request), timeout, progress)?;
        match self.wait()? {
            Reply::Packet(packet) => Ok(packet),
            Reply::Tokens(reply) => Err(ProtocolError::Correlation {
                expected,
                received: Some(CorrelationKey::Tag(reply.command)),
            }),
        }
    }

    pub fn call_token(
        &mut self,
        command: TokenCommand,
    ) -> Result<TokenReply, ProtocolError> {
        self.call_token_with_progress(command, |_, _| {})
    }

    pub fn call_token_with_progress<F>(
        &mut self,
        command: TokenCommand,
        progress: F,
    ) -> Result<TokenReply, ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        let expected = CorrelationKey::Tag(command.tag());
        let timeout = self.config.timeout;
        self.begin_with_progress(Command::Token(command), timeout, progress)?;
        match self.wait()? {
            Reply::Tokens(reply) => Ok(reply),
            Reply::Packet(packet) => Err(ProtocolError::Correlation {
                expected,
                received: Some(CorrelationKey::Message {
                    opcode: packet.header.opcode,
                    message_id: packet.header.message_id,
                }),
            }),
        }
    }

    /// Send a bulk upload frame; no reply is expected
    pub fn send_frame<F>(
        &mut self,
        frame: &Frame,
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }
        debug!("Sending {} frame ({} bytes)", frame.marker, frame.payload.len());
        self.write_header(&frame.header())?;
        self.sender
            .send_with_progress(&mut self.transport, &frame.payload, progress)?;
        Ok(())
    }

    /// Send raw bytes, paced like any other payload
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }
        self.sender.send(&mut self.transport, data)?;
        Ok(())
    }

    fn write_header(&mut self, header: &[u8]) -> Result<(), ProtocolError> {
        match self.transport.write(header) {
            Ok(n) if n == header.len() => Ok(()),
            Ok(n) => Err(ProtocolError::TransportWrite {
                written: n,
                requested: header.len(),
                cause: None,
            }),
            Err(err) => Err(ProtocolError::TransportWrite {
                written: 0,
                requested: header.len(),
                cause: Some(err),
            }),
        }
    }

    /// One bounded read outside of any exchange
    pub fn read(&mut self) -> Result<Vec<u8>, ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }
        self.read_once()
    }

    fn read_once(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.transport
            .read(self.config.read_size, self.config.read_timeout)
            .map_err(ProtocolError::TransportRead)
    }
}

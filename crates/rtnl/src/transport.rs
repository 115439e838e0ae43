//! Correlation-number transport over the rtnetlink socket.
//!
//! Every outbound request gets a fresh monotonically increasing
//! sequence number. Inbound traffic is classified into acks (matched
//! by sequence number), broadcast notifications (no sequence number,
//! dispatched by message type) and multi-part dump fragments, which
//! are reassembled per sequence number and delivered one logical
//! message at a time once the terminating DONE arrives.
//!
//! The transport never interprets object semantics; a malformed inner
//! message is skipped with a debug log and the socket stays up.

use async_trait::async_trait;
use netlink_packet_core::{
    NetlinkBuffer, NetlinkHeader, NetlinkMessage, NetlinkPayload,
};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use crate::error::{Result, RtnlError};
use crate::message::RtnlMessage;
use crate::socket::AsyncRtnlSocket;

/// Netlink message flags (linux/netlink.h).
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;
pub const NLM_F_DUMP: u16 = 0x300;

const RECV_BUFFER_LEN: usize = 64 * 1024;

/// A classified inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlEvent {
    /// Reply to a request, matched by correlation number. `code` is 0
    /// for success or a negative errno.
    Ack { seq: u32, code: i32 },
    /// Unsolicited broadcast, or one reassembled part of a dump.
    Notification(RtnlMessage),
    /// A multi-part dump for `seq` has been fully delivered.
    DumpComplete { seq: u32 },
}

/// The sending half of the transport, as a trait so the engine can be
/// driven by a recording mock in tests.
#[async_trait]
pub trait RtnlSender: Send {
    /// Serializes and writes one request, returning its correlation
    /// number. An encode failure aborts only this request; a send
    /// failure surfaces as a local error to the caller.
    async fn send_request(&mut self, message: RtnlMessage, extra_flags: u16) -> Result<u32>;
}

/// Transport over the kernel socket.
pub struct RtnlTransport {
    socket: AsyncRtnlSocket,
    next_seq: u32,
    /// Multi-part dump fragments, keyed by correlation number.
    partial_dumps: HashMap<u32, Vec<RtnlMessage>>,
    buffer: Vec<u8>,
}

impl RtnlTransport {
    pub fn new(socket: AsyncRtnlSocket) -> Self {
        Self {
            socket,
            next_seq: 0,
            partial_dumps: HashMap::new(),
            buffer: vec![0u8; RECV_BUFFER_LEN],
        }
    }

    fn allocate_seq(&mut self) -> u32 {
        // 0 is reserved for unsolicited kernel broadcasts.
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.next_seq
    }

    /// Receives one datagram and classifies every message in it.
    pub async fn recv_events(&mut self) -> Result<Vec<RtnlEvent>> {
        let mut buf = std::mem::take(&mut self.buffer);
        let result = self.socket.recv(&mut buf).await;
        self.buffer = buf;
        let len = result?;
        Ok(self.process_datagram(len))
    }

    /// Walks the messages in the first `len` bytes of the receive
    /// buffer. Malformed messages are skipped individually; a
    /// corrupted length field drops the remainder of the datagram.
    fn process_datagram(&mut self, len: usize) -> Vec<RtnlEvent> {
        let mut events = Vec::new();
        let mut offset = 0;

        while offset < len {
            let remaining = &self.buffer[offset..len];
            let msg_len = match NetlinkBuffer::new_checked(&remaining) {
                Ok(nl_buf) => nl_buf.length() as usize,
                Err(e) => {
                    warn!(error = %e, "invalid netlink framing, dropping rest of datagram");
                    break;
                }
            };
            if msg_len == 0 || msg_len > remaining.len() {
                warn!(msg_len, "netlink message length out of bounds, dropping rest of datagram");
                break;
            }

            match NetlinkMessage::<RtnlMessage>::deserialize(&remaining[..msg_len]) {
                Ok(msg) => self.classify(msg, &mut events),
                Err(e) => {
                    // One bad message does not poison the socket or
                    // any other in-flight request.
                    debug!(error = %e, "discarding malformed netlink message");
                }
            }

            offset += (msg_len + 3) & !3;
        }

        trace!(count = events.len(), "classified inbound netlink events");
        events
    }

    fn classify(&mut self, msg: NetlinkMessage<RtnlMessage>, events: &mut Vec<RtnlEvent>) {
        let seq = msg.header.sequence_number;
        let multipart = msg.header.flags & NLM_F_MULTI != 0;

        match msg.payload {
            NetlinkPayload::Error(err) => {
                events.push(RtnlEvent::Ack {
                    seq,
                    code: err.raw_code(),
                });
            }
            NetlinkPayload::Done(_) => {
                for part in self.partial_dumps.remove(&seq).unwrap_or_default() {
                    events.push(RtnlEvent::Notification(part));
                }
                events.push(RtnlEvent::DumpComplete { seq });
            }
            NetlinkPayload::InnerMessage(inner) => {
                if multipart {
                    self.partial_dumps.entry(seq).or_default().push(inner);
                } else {
                    events.push(RtnlEvent::Notification(inner));
                }
            }
            _ => trace!("ignoring noop/overrun netlink message"),
        }
    }
}

#[async_trait]
impl RtnlSender for RtnlTransport {
    async fn send_request(&mut self, message: RtnlMessage, extra_flags: u16) -> Result<u32> {
        let seq = self.allocate_seq();

        let mut header = NetlinkHeader::default();
        header.message_type = message.message_type();
        header.flags = NLM_F_REQUEST | NLM_F_ACK | extra_flags;
        header.sequence_number = seq;

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        if packet.buffer_len() > RECV_BUFFER_LEN {
            return Err(RtnlError::Encode(format!(
                "message of {} bytes exceeds the transport frame size",
                packet.buffer_len()
            )));
        }
        packet.serialize(&mut buf);

        self.socket.send(&buf).await?;
        trace!(seq, msg_type = packet.header.message_type, "sent netlink request");
        Ok(seq)
    }
}

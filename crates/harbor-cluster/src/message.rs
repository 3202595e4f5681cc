//! Binary wire format for peer messages.
//!
//! A frame on the peer transport is `[length: u32][payload]`, where the
//! payload is `[type: i32][body]`. The transport only deals with the length
//! prefix; this module encodes and decodes payloads. All multi-byte
//! integers are big-endian. Table bodies are JSON.
//!
//! Before any frame flows, both ends of a fresh connection exchange a
//! [`Handshake`] record.

use std::io;
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::election::Vote;
use crate::partition::{ReplicaAssignmentTable, ReplicaNodeIndex, SlotAssignmentTable};
use crate::slots::{SlotRange, FIRST_SLOT, SLOT_COUNT};
use crate::NodeId;

/// Longest advertised address accepted in a handshake.
const MAX_IP_LEN: usize = 255;

// Safe read helpers that return io::Error instead of panicking on truncated input.

fn safe_get_i32(buf: &mut &[u8]) -> io::Result<i32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_i32())
}

fn safe_get_bytes(buf: &mut &[u8]) -> io::Result<Bytes> {
    let len = safe_get_i32(buf)?;
    let len = usize::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("negative length {len}"))
    })?;
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("need {len} bytes, have {}", buf.len()),
        ));
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

fn decode_node_id(buf: &mut &[u8]) -> io::Result<NodeId> {
    safe_get_i32(buf).map(NodeId)
}

fn decode_slot(buf: &mut &[u8]) -> io::Result<u16> {
    let slot = safe_get_i32(buf)?;
    match u16::try_from(slot) {
        Ok(s) if (FIRST_SLOT..=SLOT_COUNT).contains(&s) => Ok(s),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("slot {slot} outside {FIRST_SLOT}..={SLOT_COUNT}"),
        )),
    }
}

fn decode_json<T: DeserializeOwned>(buf: &[u8]) -> io::Result<T> {
    serde_json::from_slice(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn encode_json<T: Serialize>(buf: &mut BytesMut, value: &T) {
    // maps keyed by integers and string ranges always serialize
    let json = serde_json::to_vec(value).unwrap_or_default();
    buf.put_slice(&json);
}

/// The type tag of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Vote,
    SlotsAllocation,
    NodeSlots,
    SlotsReplicaAllocation,
    NodeSlotsReplicas,
    ReplicaNodeId,
    ReplicaNodeIds,
    ControllerNodeId,
    RequestSlotsData,
    TransferSlots,
    UpdateSlots,
    UpdateNodeSlots,
    UpdateReplicaNodeId,
}

impl MessageKind {
    /// Wire code of this kind.
    pub fn code(self) -> i32 {
        match self {
            MessageKind::Vote => 1,
            MessageKind::SlotsAllocation => 2,
            MessageKind::NodeSlots => 3,
            MessageKind::SlotsReplicaAllocation => 4,
            MessageKind::NodeSlotsReplicas => 5,
            MessageKind::ReplicaNodeId => 6,
            MessageKind::ReplicaNodeIds => 7,
            MessageKind::ControllerNodeId => 8,
            MessageKind::RequestSlotsData => 9,
            MessageKind::TransferSlots => 10,
            MessageKind::UpdateSlots => 11,
            MessageKind::UpdateNodeSlots => 12,
            MessageKind::UpdateReplicaNodeId => 13,
        }
    }

    /// Looks up a kind by wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => MessageKind::Vote,
            2 => MessageKind::SlotsAllocation,
            3 => MessageKind::NodeSlots,
            4 => MessageKind::SlotsReplicaAllocation,
            5 => MessageKind::NodeSlotsReplicas,
            6 => MessageKind::ReplicaNodeId,
            7 => MessageKind::ReplicaNodeIds,
            8 => MessageKind::ControllerNodeId,
            9 => MessageKind::RequestSlotsData,
            10 => MessageKind::TransferSlots,
            11 => MessageKind::UpdateSlots,
            12 => MessageKind::UpdateNodeSlots,
            13 => MessageKind::UpdateReplicaNodeId,
            _ => return None,
        })
    }
}

/// A decoded peer message.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// One candidate's vote for a round.
    Vote(Vote),
    /// The full slot assignment table.
    SlotsAllocation(SlotAssignmentTable),
    /// The receiving node's own primary ranges.
    NodeSlots(Vec<SlotRange>),
    /// The full replica assignment table.
    SlotsReplicaAllocation(ReplicaAssignmentTable),
    /// Ranges the receiving node backs up for others.
    NodeSlotsReplicas(Vec<SlotRange>),
    /// The node backing up the receiver's primaries.
    ReplicaNodeId(NodeId),
    /// The full owner → backing node index.
    ReplicaNodeIds(ReplicaNodeIndex),
    /// Announces the elected controller.
    ControllerNodeId(NodeId),
    /// A late joiner asks for its slot data.
    RequestSlotsData(NodeId),
    /// Asks the receiver to move a range of its slots to `target`.
    TransferSlots { target: NodeId, range: SlotRange },
    /// Serialized contents of one slot, handed over to the receiver.
    UpdateSlots { slot: u16, data: Bytes },
    /// Replaces the receiver's primary ranges.
    UpdateNodeSlots(Vec<SlotRange>),
    /// Replaces the receiver's backing node.
    UpdateReplicaNodeId(NodeId),
}

impl PeerMessage {
    /// The type tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Vote(_) => MessageKind::Vote,
            PeerMessage::SlotsAllocation(_) => MessageKind::SlotsAllocation,
            PeerMessage::NodeSlots(_) => MessageKind::NodeSlots,
            PeerMessage::SlotsReplicaAllocation(_) => MessageKind::SlotsReplicaAllocation,
            PeerMessage::NodeSlotsReplicas(_) => MessageKind::NodeSlotsReplicas,
            PeerMessage::ReplicaNodeId(_) => MessageKind::ReplicaNodeId,
            PeerMessage::ReplicaNodeIds(_) => MessageKind::ReplicaNodeIds,
            PeerMessage::ControllerNodeId(_) => MessageKind::ControllerNodeId,
            PeerMessage::RequestSlotsData(_) => MessageKind::RequestSlotsData,
            PeerMessage::TransferSlots { .. } => MessageKind::TransferSlots,
            PeerMessage::UpdateSlots { .. } => MessageKind::UpdateSlots,
            PeerMessage::UpdateNodeSlots(_) => MessageKind::UpdateNodeSlots,
            PeerMessage::UpdateReplicaNodeId(_) => MessageKind::UpdateReplicaNodeId,
        }
    }

    /// Serializes the message to a payload (type tag + body).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32(self.kind().code());
        match self {
            PeerMessage::Vote(vote) => {
                buf.put_i32(vote.voter.0);
                buf.put_i32(vote.controller.0);
                buf.put_i32(vote.round as i32);
            }
            PeerMessage::SlotsAllocation(table) => encode_json(buf, table),
            PeerMessage::NodeSlots(ranges)
            | PeerMessage::NodeSlotsReplicas(ranges)
            | PeerMessage::UpdateNodeSlots(ranges) => encode_json(buf, ranges),
            PeerMessage::SlotsReplicaAllocation(table) => encode_json(buf, table),
            PeerMessage::ReplicaNodeIds(index) => encode_json(buf, index),
            PeerMessage::ReplicaNodeId(id)
            | PeerMessage::ControllerNodeId(id)
            | PeerMessage::RequestSlotsData(id)
            | PeerMessage::UpdateReplicaNodeId(id) => buf.put_i32(id.0),
            PeerMessage::TransferSlots { target, range } => {
                buf.put_i32(target.0);
                put_bytes(buf, range.to_string().as_bytes());
            }
            PeerMessage::UpdateSlots { slot, data } => {
                buf.put_i32(i32::from(*slot));
                put_bytes(buf, data);
            }
        }
    }

    /// Deserializes a message from a payload.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty message",
            ));
        }

        let code = safe_get_i32(&mut buf)?;
        let kind = MessageKind::from_code(code).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type: {code}"),
            )
        })?;

        match kind {
            MessageKind::Vote => {
                let voter = decode_node_id(&mut buf)?;
                let controller = decode_node_id(&mut buf)?;
                let round = safe_get_i32(&mut buf)?;
                let round = u32::try_from(round).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("negative round {round}"))
                })?;
                Ok(PeerMessage::Vote(Vote {
                    voter,
                    controller,
                    round,
                }))
            }
            MessageKind::SlotsAllocation => Ok(PeerMessage::SlotsAllocation(decode_json(buf)?)),
            MessageKind::NodeSlots => Ok(PeerMessage::NodeSlots(decode_json(buf)?)),
            MessageKind::SlotsReplicaAllocation => {
                Ok(PeerMessage::SlotsReplicaAllocation(decode_json(buf)?))
            }
            MessageKind::NodeSlotsReplicas => {
                Ok(PeerMessage::NodeSlotsReplicas(decode_json(buf)?))
            }
            MessageKind::ReplicaNodeId => Ok(PeerMessage::ReplicaNodeId(decode_node_id(&mut buf)?)),
            MessageKind::ReplicaNodeIds => Ok(PeerMessage::ReplicaNodeIds(decode_json(buf)?)),
            MessageKind::ControllerNodeId => {
                Ok(PeerMessage::ControllerNodeId(decode_node_id(&mut buf)?))
            }
            MessageKind::RequestSlotsData => {
                Ok(PeerMessage::RequestSlotsData(decode_node_id(&mut buf)?))
            }
            MessageKind::TransferSlots => {
                let target = decode_node_id(&mut buf)?;
                let raw = safe_get_bytes(&mut buf)?;
                let text = std::str::from_utf8(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let range = text.parse::<SlotRange>()?;
                Ok(PeerMessage::TransferSlots { target, range })
            }
            MessageKind::UpdateSlots => {
                let slot = decode_slot(&mut buf)?;
                let data = safe_get_bytes(&mut buf)?;
                Ok(PeerMessage::UpdateSlots { slot, data })
            }
            MessageKind::UpdateNodeSlots => Ok(PeerMessage::UpdateNodeSlots(decode_json(buf)?)),
            MessageKind::UpdateReplicaNodeId => {
                Ok(PeerMessage::UpdateReplicaNodeId(decode_node_id(&mut buf)?))
            }
        }
    }
}

/// The identity record exchanged once on every new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub node_id: NodeId,
    pub is_controller_candidate: bool,
    pub ip: IpAddr,
    pub client_port: u16,
    pub is_controller: bool,
}

impl Handshake {
    /// Serializes the record.
    ///
    /// Layout: `nodeId:i32 candidate:bool ipLen:i32 ip clientPort:i32 controller:bool`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_i32(self.node_id.0);
        buf.put_u8(u8::from(self.is_controller_candidate));
        put_bytes(&mut buf, self.ip.to_string().as_bytes());
        buf.put_i32(i32::from(self.client_port));
        buf.put_u8(u8::from(self.is_controller));
        buf.freeze()
    }

    /// Reads one record from a stream.
    ///
    /// The record is variable-length, so it is read field by field.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        let node_id = NodeId(r.read_i32().await?);
        let is_controller_candidate = r.read_u8().await? != 0;
        let ip_len = r.read_i32().await?;
        let ip_len = match usize::try_from(ip_len) {
            Ok(n) if n <= MAX_IP_LEN => n,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("handshake ip length {ip_len} out of bounds"),
                ))
            }
        };
        let mut ip_raw = vec![0u8; ip_len];
        r.read_exact(&mut ip_raw).await?;
        let ip = parse_ip(&ip_raw)?;
        let client_port = parse_port(r.read_i32().await?)?;
        let is_controller = r.read_u8().await? != 0;
        Ok(Self {
            node_id,
            is_controller_candidate,
            ip,
            client_port,
            is_controller,
        })
    }
}

fn parse_ip(raw: &[u8]) -> io::Result<IpAddr> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid handshake ip"))
}

fn parse_port(port: i32) -> io::Result<u16> {
    u16::try_from(port).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid handshake port {port}"),
        )
    })
}

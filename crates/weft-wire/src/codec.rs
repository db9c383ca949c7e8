//! Frame encoding and decoding.
//!
//! [`Message`] covers every protocol frame. `encode` produces the exact
//! byte layout from the frame table; `decode` validates every length and
//! flag and rejects truncated or over-long frames without panicking.
//! Signal frames (`0xF0..=0xF2`) are transport-private: their body is
//! carried verbatim and never inspected here.

use weft_types::id::{MessageId, NodeId};
use weft_types::record::Record;
use weft_types::{ID_LEN, MSG_ID_LEN};

use crate::{Result, WireError, MAX_NODES_PER_REPLY, MAX_RECORD_PAYLOAD};

/// PING frame type code.
pub const TYPE_PING: u8 = 0x01;
/// PONG frame type code.
pub const TYPE_PONG: u8 = 0x02;
/// FIND_NODE frame type code.
pub const TYPE_FIND_NODE: u8 = 0x03;
/// FIND_NODE_RESPONSE frame type code.
pub const TYPE_FIND_NODE_RESPONSE: u8 = 0x04;
/// STORE frame type code.
pub const TYPE_STORE: u8 = 0x05;
/// FIND_VALUE frame type code.
pub const TYPE_FIND_VALUE: u8 = 0x06;
/// FIND_VALUE_RESPONSE frame type code.
pub const TYPE_FIND_VALUE_RESPONSE: u8 = 0x07;
/// STORE_ACK frame type code.
pub const TYPE_STORE_ACK: u8 = 0x08;
/// HAS_VALUE frame type code.
pub const TYPE_HAS_VALUE: u8 = 0x09;
/// HAS_VALUE_RESPONSE frame type code.
pub const TYPE_HAS_VALUE_RESPONSE: u8 = 0x0A;
/// First transport-private signal code (offer).
pub const TYPE_SIGNAL_FIRST: u8 = 0xF0;
/// Last transport-private signal code (ICE).
pub const TYPE_SIGNAL_LAST: u8 = 0xF2;

/// The payload of a FIND_VALUE_RESPONSE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueReply {
    /// The responder holds the value.
    Found(Record),
    /// The responder does not hold the value; here are its closest peers.
    Closest(Vec<NodeId>),
}

/// A decoded protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe carrying the sender's id.
    Ping { node_id: NodeId },
    /// Liveness reply carrying the sender's id.
    Pong { node_id: NodeId },
    /// Request for the responder's closest peers to `target`.
    FindNode { msg_id: MessageId, target: NodeId },
    /// Closest-peer reply.
    FindNodeResponse { msg_id: MessageId, nodes: Vec<NodeId> },
    /// Replicate a record under `key`.
    Store {
        msg_id: MessageId,
        key: NodeId,
        record: Record,
    },
    /// Request for the value under `key`, or the closest peers to it.
    FindValue { msg_id: MessageId, key: NodeId },
    /// Value-or-peers reply.
    FindValueResponse { msg_id: MessageId, reply: ValueReply },
    /// Acknowledgement that a STORE was accepted.
    StoreAck { msg_id: MessageId },
    /// Existence probe for `key`, used during replica repair.
    HasValue { msg_id: MessageId, key: NodeId },
    /// Existence reply.
    HasValueResponse { msg_id: MessageId, has: bool },
    /// Transport-private signaling frame, forwarded opaquely.
    Signal { code: u8, body: Vec<u8> },
}

impl Message {
    /// The frame's type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Ping { .. } => TYPE_PING,
            Message::Pong { .. } => TYPE_PONG,
            Message::FindNode { .. } => TYPE_FIND_NODE,
            Message::FindNodeResponse { .. } => TYPE_FIND_NODE_RESPONSE,
            Message::Store { .. } => TYPE_STORE,
            Message::FindValue { .. } => TYPE_FIND_VALUE,
            Message::FindValueResponse { .. } => TYPE_FIND_VALUE_RESPONSE,
            Message::StoreAck { .. } => TYPE_STORE_ACK,
            Message::HasValue { .. } => TYPE_HAS_VALUE,
            Message::HasValueResponse { .. } => TYPE_HAS_VALUE_RESPONSE,
            Message::Signal { code, .. } => *code,
        }
    }

    /// Serialize this frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooManyNodes`] for node lists beyond the
    /// one-byte count, [`WireError::PayloadTooLarge`] for oversized record
    /// JSON, and [`WireError::Record`] if the record fails to serialize.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(self.type_code());
        match self {
            Message::Ping { node_id } | Message::Pong { node_id } => {
                out.extend_from_slice(node_id);
            }
            Message::FindNode { msg_id, target } => {
                out.extend_from_slice(msg_id);
                out.extend_from_slice(target);
            }
            Message::FindNodeResponse { msg_id, nodes } => {
                out.extend_from_slice(msg_id);
                push_node_list(&mut out, nodes)?;
            }
            Message::Store {
                msg_id,
                key,
                record,
            } => {
                out.extend_from_slice(msg_id);
                out.extend_from_slice(key);
                push_record(&mut out, record)?;
            }
            Message::FindValue { msg_id, key } | Message::HasValue { msg_id, key } => {
                out.extend_from_slice(msg_id);
                out.extend_from_slice(key);
            }
            Message::FindValueResponse { msg_id, reply } => {
                out.extend_from_slice(msg_id);
                match reply {
                    ValueReply::Found(record) => {
                        out.push(1);
                        push_record(&mut out, record)?;
                    }
                    ValueReply::Closest(nodes) => {
                        out.push(0);
                        push_node_list(&mut out, nodes)?;
                    }
                }
            }
            Message::StoreAck { msg_id } => {
                out.extend_from_slice(msg_id);
            }
            Message::HasValueResponse { msg_id, has } => {
                out.extend_from_slice(msg_id);
                out.push(u8::from(*has));
            }
            Message::Signal { body, .. } => {
                out.extend_from_slice(body);
            }
        }
        Ok(out)
    }

    /// Parse a frame from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if the frame ends early,
    /// [`WireError::TrailingBytes`] if bytes remain after the layout,
    /// [`WireError::UnknownType`] for unregistered type codes, and
    /// [`WireError::InvalidFlag`] / [`WireError::Record`] /
    /// [`WireError::PayloadTooLarge`] for malformed bodies.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let mut r = Reader::new(frame);
        let code = r.take_u8()?;

        // Signal frames are opaque: everything after the type byte is body.
        if (TYPE_SIGNAL_FIRST..=TYPE_SIGNAL_LAST).contains(&code) {
            return Ok(Message::Signal {
                code,
                body: r.take_rest().to_vec(),
            });
        }

        let msg = match code {
            TYPE_PING => Message::Ping {
                node_id: r.take_id()?,
            },
            TYPE_PONG => Message::Pong {
                node_id: r.take_id()?,
            },
            TYPE_FIND_NODE => Message::FindNode {
                msg_id: r.take_msg_id()?,
                target: r.take_id()?,
            },
            TYPE_FIND_NODE_RESPONSE => Message::FindNodeResponse {
                msg_id: r.take_msg_id()?,
                nodes: r.take_node_list()?,
            },
            TYPE_STORE => Message::Store {
                msg_id: r.take_msg_id()?,
                key: r.take_id()?,
                record: r.take_record()?,
            },
            TYPE_FIND_VALUE => Message::FindValue {
                msg_id: r.take_msg_id()?,
                key: r.take_id()?,
            },
            TYPE_FIND_VALUE_RESPONSE => {
                let msg_id = r.take_msg_id()?;
                let reply = match r.take_flag()? {
                    true => ValueReply::Found(r.take_record()?),
                    false => ValueReply::Closest(r.take_node_list()?),
                };
                Message::FindValueResponse { msg_id, reply }
            }
            TYPE_STORE_ACK => Message::StoreAck {
                msg_id: r.take_msg_id()?,
            },
            TYPE_HAS_VALUE => Message::HasValue {
                msg_id: r.take_msg_id()?,
                key: r.take_id()?,
            },
            TYPE_HAS_VALUE_RESPONSE => Message::HasValueResponse {
                msg_id: r.take_msg_id()?,
                has: r.take_flag()?,
            },
            other => return Err(WireError::UnknownType(other)),
        };

        r.finish()?;
        Ok(msg)
    }
}

/// Append `count[1] node_id[32]*count`, refusing lists beyond the count field.
fn push_node_list(out: &mut Vec<u8>, nodes: &[NodeId]) -> Result<()> {
    if nodes.len() > MAX_NODES_PER_REPLY {
        return Err(WireError::TooManyNodes(nodes.len()));
    }
    out.push(nodes.len() as u8);
    for id in nodes {
        out.extend_from_slice(id);
    }
    Ok(())
}

/// Append `len[4 BE] record_json[len]`, enforcing the payload cap.
fn push_record(out: &mut Vec<u8>, record: &Record) -> Result<()> {
    let json = serde_json::to_vec(record).map_err(|e| WireError::Record(e.to_string()))?;
    if json.len() > MAX_RECORD_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            len: json.len(),
            max: MAX_RECORD_PAYLOAD,
        });
    }
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    Ok(())
}

/// Bounds-checked frame reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(WireError::Truncated {
                needed: n - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_flag(&mut self) -> Result<bool> {
        match self.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidFlag(other)),
        }
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(arr))
    }

    fn take_id(&mut self) -> Result<NodeId> {
        let bytes = self.take(ID_LEN)?;
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(id)
    }

    fn take_msg_id(&mut self) -> Result<MessageId> {
        let bytes = self.take(MSG_ID_LEN)?;
        let mut id = [0u8; MSG_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(id)
    }

    fn take_node_list(&mut self) -> Result<Vec<NodeId>> {
        let count = self.take_u8()? as usize;
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(self.take_id()?);
        }
        Ok(nodes)
    }

    fn take_record(&mut self) -> Result<Record> {
        let len = self.take_u32()? as usize;
        if len > MAX_RECORD_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                len,
                max: MAX_RECORD_PAYLOAD,
            });
        }
        let json = self.take(len)?;
        serde_json::from_slice(json).map_err(|e| WireError::Record(e.to_string()))
    }

    fn finish(&self) -> Result<()> {
        let trailing = self.buf.len() - self.pos;
        if trailing > 0 {
            return Err(WireError::TrailingBytes(trailing));
        }
        Ok(())
    }
}

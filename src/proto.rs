//! The protocol related structs and enums.
//!
//! # Protocol Specification
//!
//! Every message travels as a frame on a worker link: a 32-byte header (the
//! response and notify reference ids, four little-endian `i64`), a one-byte
//! tag, the serialized fields of the message in declaration order, and the
//! 10-byte frame boundary (see `procmesh_channel`).
//!
//! The header addresses cells, not messages: `response` names the cell that
//! receives the result of a call (on the callee for [`Message::Call`], on the
//! caller for [`Message::CallFetch`]), `notify` names the caller-side cell a
//! [`Message::CallWait`] completion is delivered to. The null id `(0, 0)`
//! means no response is expected.
//!
//! Functions cross the wire by name plus a serialized environment
//! ([`RemoteFunc`]); the callee resolves the name against its function
//! registry. Argument payloads are opaque at this layer: they are decoded by
//! the invoked handler, inside a cluster decode context so any remote
//! references inside them canonicalize properly.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

use procmesh_channel::FrameHeader;

use crate::cluster::ProcessId;
use crate::error::RemoteException;

/// A serialized value as it crosses the wire or sits in a cell.
pub type Payload = Vec<u8>;

/// What a computation produced: a serialized value or a captured failure.
/// Cells store outcomes so remote failures flow through the same channels as
/// values.
pub type Outcome = Result<Payload, RemoteException>;

/// Identity of a remote reference: the node that created it and a sequence
/// number unique on that node. The owner of the backing cell is *not* part of
/// the identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RefId {
    /// The node that created the reference.
    pub whence: ProcessId,
    /// Sequence number on the creating node.
    pub id: i64,
}

impl RefId {
    /// The null reference id, meaning "no cell".
    pub const NULL: RefId = RefId { whence: 0, id: 0 };

    /// Whether this is the null id.
    pub fn is_null(&self) -> bool {
        *self == RefId::NULL
    }
}

impl std::fmt::Display for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {})", self.whence, self.id)
    }
}

/// The frame header of a message: which cells the response and the completion
/// notification are addressed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// The cell receiving the result of the call.
    pub response: RefId,
    /// The cell receiving the completion notification of a `CallWait`.
    pub notify: RefId,
}

impl MsgHeader {
    /// A header with only a response cell.
    pub fn new(response: RefId) -> MsgHeader {
        MsgHeader {
            response,
            notify: RefId::NULL,
        }
    }

    /// A header with both a response and a notify cell.
    pub fn with_notify(response: RefId, notify: RefId) -> MsgHeader {
        MsgHeader { response, notify }
    }

    /// Encode into the raw wire header.
    pub fn to_frame(self) -> FrameHeader {
        FrameHeader([
            self.response.whence,
            self.response.id,
            self.notify.whence,
            self.notify.id,
        ])
    }

    /// Decode from the raw wire header.
    pub fn from_frame(frame: FrameHeader) -> MsgHeader {
        let [rw, ri, nw, ni] = frame.0;
        MsgHeader {
            response: RefId { whence: rw, id: ri },
            notify: RefId { whence: nw, id: ni },
        }
    }
}

/// A function as it crosses the wire: a name resolved against the callee's
/// registry, plus a serialized environment for closure-like functions. The
/// environment must not contain remote references; references travel in the
/// call arguments instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFunc {
    /// Registry name of the function.
    pub name: String,
    /// Serialized captured environment, empty for plain functions.
    pub env: Payload,
}

impl RemoteFunc {
    /// A plain registered function with no environment.
    pub fn new<S: Into<String>>(name: S) -> RemoteFunc {
        RemoteFunc {
            name: name.into(),
            env: Vec::new(),
        }
    }

    /// A closure-like function: a registered name plus a serialized captured
    /// environment.
    pub fn with_env<S: Into<String>, E: Serialize>(
        name: S,
        env: &E,
    ) -> Result<RemoteFunc, anyhow::Error> {
        Ok(RemoteFunc {
            name: name.into(),
            env: bincode::serialize(env)?,
        })
    }
}

/// The invocation request carried by `Call`, `CallFetch`, `CallWait` and
/// `RemoteDo` messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMsg {
    /// The function to invoke.
    pub func: RemoteFunc,
    /// Serialized arguments, decoded by the invoked handler.
    pub args: Payload,
}

/// First message on a worker-to-worker link: who is talking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyMsg {
    /// The cluster id of the sending process.
    pub from_pid: ProcessId,
}

/// Sent by the master to a joining worker: its assigned id and the peers it
/// must connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPgrpMsg {
    /// The id assigned to the joining worker.
    pub pid: ProcessId,
    /// The other members of the group, as `(pid, address)` pairs.
    pub peers: Vec<(ProcessId, String)>,
}

/// Sent by a worker to the master once it has connected to all its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCompleteMsg {
    /// Where this worker accepts peer connections, if it listens.
    pub listen_addr: Option<String>,
    /// How many peers the worker connected to.
    pub nworkers: usize,
}

/// A value (or captured failure) delivered to the cell named by the frame
/// header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMsg {
    /// The delivered outcome.
    pub value: Outcome,
}

/// A message of the cluster protocol.
///
/// The variants are listed in tag order. The tags are part of the wire format
/// and must not change.
#[derive(Debug, Clone)]
pub enum Message {
    /// Invoke a function, storing the result on the callee and notifying a
    /// caller-side cell on completion. Tag 1.
    CallWait(CallMsg),
    /// Acknowledge an `IdentifySocket`. Tag 2.
    IdentifySocketAck,
    /// Identify the sending process on a fresh link. Tag 3.
    IdentifySocket(IdentifyMsg),
    /// A worker finished joining the group. Tag 4.
    JoinComplete(JoinCompleteMsg),
    /// The master tells a joining worker about the group. Tag 5.
    JoinPgrp(JoinPgrpMsg),
    /// Invoke a function discarding the result. Tag 6.
    RemoteDo(CallMsg),
    /// Deliver a result to the cell named in the header. Tag 7.
    Result(ResultMsg),
    /// Invoke a function, storing the result in a callee-side cell. Tag 8.
    Call(CallMsg),
    /// Invoke a function, sending the result back to a caller-side cell.
    /// Tag 9.
    CallFetch(CallMsg),
}

/// Wire tag of [`Message::CallWait`].
pub const TAG_CALL_WAIT: u8 = 1;
/// Wire tag of [`Message::IdentifySocketAck`].
pub const TAG_IDENTIFY_ACK: u8 = 2;
/// Wire tag of [`Message::IdentifySocket`].
pub const TAG_IDENTIFY: u8 = 3;
/// Wire tag of [`Message::JoinComplete`].
pub const TAG_JOIN_COMPLETE: u8 = 4;
/// Wire tag of [`Message::JoinPgrp`].
pub const TAG_JOIN_PGRP: u8 = 5;
/// Wire tag of [`Message::RemoteDo`].
pub const TAG_REMOTE_DO: u8 = 6;
/// Wire tag of [`Message::Result`].
pub const TAG_RESULT: u8 = 7;
/// Wire tag of [`Message::Call`].
pub const TAG_CALL: u8 = 8;
/// Wire tag of [`Message::CallFetch`].
pub const TAG_CALL_FETCH: u8 = 9;

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::CallWait(_) => TAG_CALL_WAIT,
            Message::IdentifySocketAck => TAG_IDENTIFY_ACK,
            Message::IdentifySocket(_) => TAG_IDENTIFY,
            Message::JoinComplete(_) => TAG_JOIN_COMPLETE,
            Message::JoinPgrp(_) => TAG_JOIN_PGRP,
            Message::RemoteDo(_) => TAG_REMOTE_DO,
            Message::Result(_) => TAG_RESULT,
            Message::Call(_) => TAG_CALL,
            Message::CallFetch(_) => TAG_CALL_FETCH,
        }
    }

    /// Whether this message is part of the socket identification exchange.
    /// Identification messages are the only traffic allowed on a link that is
    /// not `Connected` yet.
    pub fn is_identity(&self) -> bool {
        matches!(
            self,
            Message::IdentifySocket(_) | Message::IdentifySocketAck | Message::JoinPgrp(_)
        )
    }
}

// The wire form of a message is the tag byte followed by the serialized
// fields, so Serialize/Deserialize are written by hand instead of derived
// (derive would emit a 4-byte variant index).
impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.tag())?;
        match self {
            Message::CallWait(m) | Message::RemoteDo(m) | Message::Call(m)
            | Message::CallFetch(m) => tuple.serialize_element(m)?,
            Message::IdentifySocketAck => tuple.serialize_element(&())?,
            Message::IdentifySocket(m) => tuple.serialize_element(m)?,
            Message::JoinComplete(m) => tuple.serialize_element(m)?,
            Message::JoinPgrp(m) => tuple.serialize_element(m)?,
            Message::Result(m) => tuple.serialize_element(m)?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Message, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = Message;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a tagged protocol message")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Message, A::Error> {
                let tag: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("missing message tag"))?;
                let missing = || de::Error::custom("missing message body");
                Ok(match tag {
                    TAG_CALL_WAIT => Message::CallWait(seq.next_element()?.ok_or_else(missing)?),
                    TAG_IDENTIFY_ACK => {
                        let () = seq.next_element()?.ok_or_else(missing)?;
                        Message::IdentifySocketAck
                    }
                    TAG_IDENTIFY => Message::IdentifySocket(seq.next_element()?.ok_or_else(missing)?),
                    TAG_JOIN_COMPLETE => {
                        Message::JoinComplete(seq.next_element()?.ok_or_else(missing)?)
                    }
                    TAG_JOIN_PGRP => Message::JoinPgrp(seq.next_element()?.ok_or_else(missing)?),
                    TAG_REMOTE_DO => Message::RemoteDo(seq.next_element()?.ok_or_else(missing)?),
                    TAG_RESULT => Message::Result(seq.next_element()?.ok_or_else(missing)?),
                    TAG_CALL => Message::Call(seq.next_element()?.ok_or_else(missing)?),
                    TAG_CALL_FETCH => Message::CallFetch(seq.next_element()?.ok_or_else(missing)?),
                    _ => return Err(de::Error::custom(format!("unknown message tag {}", tag))),
                })
            }
        }

        deserializer.deserialize_tuple(2, MessageVisitor)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_tag_is_first_byte() {
        let msg = Message::Call(CallMsg {
            func: RemoteFunc::new("echo"),
            args: vec![1, 2, 3],
        });
        let bytes = bincode::serialize(&msg).unwrap();
        assert_eq!(bytes[0], TAG_CALL);
        let msg = Message::IdentifySocketAck;
        let bytes = bincode::serialize(&msg).unwrap();
        assert_eq!(bytes, vec![TAG_IDENTIFY_ACK]);
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::CallWait(CallMsg {
            func: RemoteFunc::new("work"),
            args: vec![9, 9],
        });
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<Message>(&bytes).unwrap() {
            Message::CallWait(m) => {
                assert_eq!(m.func.name, "work");
                assert_eq!(m.args, vec![9, 9]);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(bincode::deserialize::<Message>(&[42, 0, 0]).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = MsgHeader::with_notify(
            RefId { whence: 1, id: 7 },
            RefId { whence: 3, id: 12 },
        );
        assert_eq!(MsgHeader::from_frame(header.to_frame()), header);
        assert!(MsgHeader::default().response.is_null());
    }
}

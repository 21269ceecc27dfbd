//! Messages exchanged between the coordinator and cluster members
//!
//! Frame format: [TAG u16 LE][PAYLOAD]
//!
//! The tag selects the variant and therefore the decoder for the payload.
//! Tags at or above [`CUSTOM_TAG_BASE`] are reserved for application
//! payloads the coordinator forwards without interpreting.

use crate::common::{Error, Result};
use crate::coordinator::OperationId;
use serde::{Deserialize, Serialize};

/// First tag available to application-defined payloads
pub const CUSTOM_TAG_BASE: u16 = 0x8000;

const TAG_PREPARE: u16 = 1;
const TAG_COMMIT: u16 = 2;
const TAG_ABORT: u16 = 3;

const TAG_PREPARED: u16 = 1;
const TAG_COMMITTED: u16 = 2;
const TAG_ABORTED: u16 = 3;
const TAG_NODE_FAILED: u16 = 4;

const TAG_APPLIED: u16 = 1;
const TAG_SUBMIT_FAILED: u16 = 2;

/// A tagged, binary-encodable message.
pub trait Message: Sized {
    /// Human readable message family, used in errors
    const KIND: &'static str;

    fn type_tag(&self) -> u16;

    fn encode_payload(&self) -> Result<Vec<u8>>;

    /// Tag → decoder dispatch for this message family.
    fn decode_payload(tag: u16, payload: &[u8]) -> Result<Self>;

    fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&self.type_tag().to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 2 {
            return Err(Error::Serialization(format!(
                "truncated {} frame ({} bytes)",
                Self::KIND,
                frame.len()
            )));
        }
        let tag = u16::from_le_bytes([frame[0], frame[1]]);
        Self::decode_payload(tag, &frame[2..])
    }
}

/// A change to the cluster's structure, voted on by every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralChange {
    AddNode { name: String },
    RemoveNode { name: String },
}

impl StructuralChange {
    /// Node the change is about
    pub fn node(&self) -> &str {
        match self {
            StructuralChange::AddNode { name } | StructuralChange::RemoveNode { name } => name,
        }
    }
}

impl std::fmt::Display for StructuralChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralChange::AddNode { name } => write!(f, "add node {}", name),
            StructuralChange::RemoveNode { name } => write!(f, "remove node {}", name),
        }
    }
}

/// A single node-local step of a submit operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRequest {
    Prepare { change: StructuralChange },
    Commit { prepared: OperationId },
    Abort { prepared: OperationId },
    Custom { tag: u16, payload: Vec<u8> },
}

/// A member's answer to a [`NodeRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeResponse {
    Prepared,
    Committed,
    Aborted,
    /// Node-local execution failed; routed back like any other answer
    Failed { reason: String },
    Custom { tag: u16, payload: Vec<u8> },
}

/// Final result of a submit operation, delivered to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Applied {
        change: StructuralChange,
        hosts: Vec<String>,
    },
    Failed {
        reason: String,
    },
    Custom {
        tag: u16,
        payload: Vec<u8>,
    },
}

#[derive(Serialize, Deserialize)]
struct AppliedPayload {
    change: StructuralChange,
    hosts: Vec<String>,
}

fn custom_payload(kind: &'static str, tag: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if tag < CUSTOM_TAG_BASE {
        return Err(Error::Serialization(format!(
            "custom {} tag {} collides with a reserved tag",
            kind, tag
        )));
    }
    Ok(payload.to_vec())
}

fn expect_empty(kind: &'static str, tag: u16, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(Error::Serialization(format!(
            "unexpected {} byte payload for {} tag {}",
            payload.len(),
            kind,
            tag
        )))
    }
}

impl Message for NodeRequest {
    const KIND: &'static str = "node request";

    fn type_tag(&self) -> u16 {
        match self {
            NodeRequest::Prepare { .. } => TAG_PREPARE,
            NodeRequest::Commit { .. } => TAG_COMMIT,
            NodeRequest::Abort { .. } => TAG_ABORT,
            NodeRequest::Custom { tag, .. } => *tag,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            NodeRequest::Prepare { change } => Ok(bincode::serialize(change)?),
            NodeRequest::Commit { prepared } | NodeRequest::Abort { prepared } => {
                Ok(bincode::serialize(prepared)?)
            }
            NodeRequest::Custom { tag, payload } => custom_payload(Self::KIND, *tag, payload),
        }
    }

    fn decode_payload(tag: u16, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_PREPARE => Ok(NodeRequest::Prepare {
                change: bincode::deserialize(payload)?,
            }),
            TAG_COMMIT => Ok(NodeRequest::Commit {
                prepared: bincode::deserialize(payload)?,
            }),
            TAG_ABORT => Ok(NodeRequest::Abort {
                prepared: bincode::deserialize(payload)?,
            }),
            tag if tag >= CUSTOM_TAG_BASE => Ok(NodeRequest::Custom {
                tag,
                payload: payload.to_vec(),
            }),
            tag => Err(Error::UnknownMessageType {
                kind: Self::KIND,
                tag,
            }),
        }
    }
}

impl Message for NodeResponse {
    const KIND: &'static str = "node response";

    fn type_tag(&self) -> u16 {
        match self {
            NodeResponse::Prepared => TAG_PREPARED,
            NodeResponse::Committed => TAG_COMMITTED,
            NodeResponse::Aborted => TAG_ABORTED,
            NodeResponse::Failed { .. } => TAG_NODE_FAILED,
            NodeResponse::Custom { tag, .. } => *tag,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            NodeResponse::Prepared | NodeResponse::Committed | NodeResponse::Aborted => {
                Ok(Vec::new())
            }
            NodeResponse::Failed { reason } => Ok(bincode::serialize(reason)?),
            NodeResponse::Custom { tag, payload } => custom_payload(Self::KIND, *tag, payload),
        }
    }

    fn decode_payload(tag: u16, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_PREPARED => expect_empty(Self::KIND, tag, payload).map(|_| NodeResponse::Prepared),
            TAG_COMMITTED => {
                expect_empty(Self::KIND, tag, payload).map(|_| NodeResponse::Committed)
            }
            TAG_ABORTED => expect_empty(Self::KIND, tag, payload).map(|_| NodeResponse::Aborted),
            TAG_NODE_FAILED => Ok(NodeResponse::Failed {
                reason: bincode::deserialize(payload)?,
            }),
            tag if tag >= CUSTOM_TAG_BASE => Ok(NodeResponse::Custom {
                tag,
                payload: payload.to_vec(),
            }),
            tag => Err(Error::UnknownMessageType {
                kind: Self::KIND,
                tag,
            }),
        }
    }
}

impl std::fmt::Display for NodeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeResponse::Prepared => write!(f, "prepared"),
            NodeResponse::Committed => write!(f, "committed"),
            NodeResponse::Aborted => write!(f, "aborted"),
            NodeResponse::Failed { reason } => write!(f, "failed: {}", reason),
            NodeResponse::Custom { tag, payload } => {
                write!(f, "custom #{} ({} bytes)", tag, payload.len())
            }
        }
    }
}

impl Message for SubmitResponse {
    const KIND: &'static str = "submit response";

    fn type_tag(&self) -> u16 {
        match self {
            SubmitResponse::Applied { .. } => TAG_APPLIED,
            SubmitResponse::Failed { .. } => TAG_SUBMIT_FAILED,
            SubmitResponse::Custom { tag, .. } => *tag,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            SubmitResponse::Applied { change, hosts } => Ok(bincode::serialize(&AppliedPayload {
                change: change.clone(),
                hosts: hosts.clone(),
            })?),
            SubmitResponse::Failed { reason } => Ok(bincode::serialize(reason)?),
            SubmitResponse::Custom { tag, payload } => custom_payload(Self::KIND, *tag, payload),
        }
    }

    fn decode_payload(tag: u16, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_APPLIED => {
                let AppliedPayload { change, hosts } = bincode::deserialize(payload)?;
                Ok(SubmitResponse::Applied { change, hosts })
            }
            TAG_SUBMIT_FAILED => Ok(SubmitResponse::Failed {
                reason: bincode::deserialize(payload)?,
            }),
            tag if tag >= CUSTOM_TAG_BASE => Ok(SubmitResponse::Custom {
                tag,
                payload: payload.to_vec(),
            }),
            tag => Err(Error::UnknownMessageType {
                kind: Self::KIND,
                tag,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = NodeRequest::Commit {
            prepared: OperationId::new(7),
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[..2], &TAG_COMMIT.to_le_bytes());
        assert_eq!(&frame[2..], &7u64.to_le_bytes());

        let frame = NodeResponse::Prepared.encode().unwrap();
        assert_eq!(frame, TAG_PREPARED.to_le_bytes().to_vec());
    }

    #[test]
    fn test_applied_keeps_host_order() {
        let reply = SubmitResponse::Applied {
            change: StructuralChange::AddNode {
                name: "three".into(),
            },
            hosts: vec!["one".into(), "two".into(), "three".into()],
        };
        let decoded = SubmitResponse::decode(&reply.encode().unwrap()).unwrap();
        match decoded {
            SubmitResponse::Applied { hosts, .. } => assert_eq!(hosts, ["one", "two", "three"]),
            other => panic!("Expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag() {
        let frame = 99u16.to_le_bytes();
        match NodeRequest::decode(&frame) {
            Err(Error::UnknownMessageType { kind, tag }) => {
                assert_eq!(kind, "node request");
                assert_eq!(tag, 99);
            }
            other => panic!("Expected UnknownMessageType, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(
            NodeResponse::decode(&[1]),
            Err(Error::Serialization(_))
        ));

        let mut frame = NodeRequest::Prepare {
            change: StructuralChange::RemoveNode { name: "two".into() },
        }
        .encode()
        .unwrap();
        frame.truncate(frame.len() - 1);
        assert!(matches!(
            NodeRequest::decode(&frame),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected_for_empty_payloads() {
        let mut frame = NodeResponse::Aborted.encode().unwrap();
        frame.push(0xFF);
        assert!(NodeResponse::decode(&frame).is_err());
    }

    #[test]
    fn test_custom_payloads() {
        let request = NodeRequest::Custom {
            tag: CUSTOM_TAG_BASE + 4,
            payload: b"schema".to_vec(),
        };
        assert_eq!(NodeRequest::decode(&request.encode().unwrap()).unwrap(), request);

        let reserved = NodeResponse::Custom {
            tag: 3,
            payload: vec![],
        };
        assert!(matches!(reserved.encode(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_change_display() {
        let change = StructuralChange::AddNode { name: "four".into() };
        assert_eq!(change.to_string(), "add node four");
        assert_eq!(change.node(), "four");
    }
}

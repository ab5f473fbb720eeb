//! Wire messages exchanged over a session's WebSocket.
//!
//! Every text frame is a JSON envelope:
//!
//! ```text
//! {"event": "<name>", "payload": "<string>", "submission": <u64, optional>}
//! ```
//!
//! Events:
//! - `sc_update_to_author` (client → server): payload is a serialized change set
//! - `sc_author_accepted` (server → client): submission admitted, empty payload
//! - `sc_author_output` (server → client): payload is one output line, no terminator
//! - `sc_author_complete` (server → client): payload is the JSON outcome
//! - `sc_author_rejected` (server → client): payload is the reason

use serde::{Deserialize, Serialize};

use crate::bridge::{BridgeEvent, Outcome, SubmissionId};
use crate::constants::{EVENT_ACCEPTED, EVENT_COMPLETE, EVENT_OUTPUT, EVENT_REJECTED, EVENT_SUBMIT};
use crate::transport::TransportError;

/// JSON envelope carried in each text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload, always a string.
    #[serde(default)]
    pub payload: String,
    /// Submission the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<SubmissionId>,
}

impl Envelope {
    fn new(event: &str, payload: String, submission: Option<SubmissionId>) -> Self {
        Self {
            event: event.to_string(),
            payload,
            submission,
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }

    fn decode(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("invalid envelope: {e}")))
    }

    fn require_submission(&self) -> Result<SubmissionId, TransportError> {
        self.submission.ok_or_else(|| {
            TransportError::Protocol(format!("{} event without submission id", self.event))
        })
    }
}

/// Message sent by a viewer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Author this serialized change set.
    Submit {
        /// Serialized change set.
        payload: String,
    },
}

impl ClientMessage {
    /// Encode as a text frame.
    pub fn encode(&self) -> String {
        match self {
            Self::Submit { payload } => Envelope::new(EVENT_SUBMIT, payload.clone(), None).encode(),
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let envelope = Envelope::decode(text)?;
        match envelope.event.as_str() {
            EVENT_SUBMIT => Ok(Self::Submit {
                payload: envelope.payload,
            }),
            other => Err(TransportError::Protocol(format!("unknown client event: {other}"))),
        }
    }
}

/// Message sent by the server to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Submission admitted to the queue.
    Accepted {
        /// Id assigned at admission.
        submission: SubmissionId,
    },
    /// One line of authoring output.
    Output {
        /// Submission that produced the line.
        submission: SubmissionId,
        /// Line text without terminator.
        line: String,
    },
    /// Submission finished; no further output follows for it.
    Completed {
        /// Finished submission.
        submission: SubmissionId,
        /// How it finished.
        outcome: Outcome,
    },
    /// A submission or message was refused.
    Rejected {
        /// Submission, when one had already been assigned.
        submission: Option<SubmissionId>,
        /// Why.
        reason: String,
    },
}

impl ServerMessage {
    /// Encode as a text frame.
    pub fn encode(&self) -> String {
        let envelope = match self {
            Self::Accepted { submission } => Envelope::new(EVENT_ACCEPTED, String::new(), Some(*submission)),
            Self::Output { submission, line } => {
                Envelope::new(EVENT_OUTPUT, line.clone(), Some(*submission))
            }
            Self::Completed {
                submission,
                outcome,
            } => {
                let payload =
                    serde_json::to_string(outcome).expect("outcome serialization cannot fail");
                Envelope::new(EVENT_COMPLETE, payload, Some(*submission))
            }
            Self::Rejected { submission, reason } => {
                Envelope::new(EVENT_REJECTED, reason.clone(), *submission)
            }
        };
        envelope.encode()
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let envelope = Envelope::decode(text)?;
        match envelope.event.as_str() {
            EVENT_ACCEPTED => Ok(Self::Accepted {
                submission: envelope.require_submission()?,
            }),
            EVENT_OUTPUT => Ok(Self::Output {
                submission: envelope.require_submission()?,
                line: envelope.payload,
            }),
            EVENT_COMPLETE => {
                let submission = envelope.require_submission()?;
                let outcome = serde_json::from_str(&envelope.payload)
                    .map_err(|e| TransportError::Protocol(format!("invalid outcome: {e}")))?;
                Ok(Self::Completed {
                    submission,
                    outcome,
                })
            }
            EVENT_REJECTED => Ok(Self::Rejected {
                submission: envelope.submission,
                reason: envelope.payload,
            }),
            other => Err(TransportError::Protocol(format!("unknown server event: {other}"))),
        }
    }
}

impl From<BridgeEvent> for ServerMessage {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Line { submission, line } => Self::Output { submission, line },
            BridgeEvent::Completed {
                submission,
                outcome,
            } => Self::Completed {
                submission,
                outcome,
            },
        }
    }
}

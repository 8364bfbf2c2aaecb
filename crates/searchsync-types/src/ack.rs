//! Acknowledgements sent back to change originators.
//!
//! An originator that wants to know when its change became durable in the
//! search index attaches an [`AckRecipient`] to the change. The pipeline
//! resolves every recipient exactly once with either a success or a failure
//! acknowledgement.

use tokio::sync::mpsc;

use crate::ids::ThingId;

/// Outcome reported to an originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    /// The change (or a newer revision) is durable in the index
    Success,
    /// The change could not be made durable
    Failure(String),
}

impl AckStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AckStatus::Success)
    }
}

/// Acknowledgement of one change for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Correlation id chosen by the recipient
    pub correlation_id: String,
    /// Thing the change belongs to
    pub thing_id: ThingId,
    /// Revision the pipeline wrote (or tried to write)
    pub revision: i64,
    /// Success or failure
    pub status: AckStatus,
}

impl Acknowledgement {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Callback channel for one pending acknowledgement.
#[derive(Clone)]
pub struct AckRecipient {
    correlation_id: String,
    sender: mpsc::UnboundedSender<Acknowledgement>,
}

impl AckRecipient {
    pub fn new(
        correlation_id: impl Into<String>,
        sender: mpsc::UnboundedSender<Acknowledgement>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sender,
        }
    }

    /// Create a recipient together with the receiving end of its channel.
    pub fn channel(
        correlation_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Acknowledgement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(correlation_id, tx), rx)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Two recipients are the same callback if they share correlation id and channel.
    pub fn is_same(&self, other: &AckRecipient) -> bool {
        self.correlation_id == other.correlation_id && self.sender.same_channel(&other.sender)
    }

    /// Deliver an acknowledgement. Returns false if the originator went away.
    pub fn send(&self, thing_id: &ThingId, revision: i64, status: AckStatus) -> bool {
        self.sender
            .send(Acknowledgement {
                correlation_id: self.correlation_id.clone(),
                thing_id: thing_id.clone(),
                revision,
                status,
            })
            .is_ok()
    }
}

impl std::fmt::Debug for AckRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckRecipient")
            .field("correlation_id", &self.correlation_id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

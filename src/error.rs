//! Error types for the rendezvous and transit relay services.

use thiserror::Error;

use crate::message::ClientMessage;

/// Failures surfaced by the [`crate::store::Store`] backing the rendezvous state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Client-caused protocol errors. The `Display` text is exactly what the
/// rendezvous server puts in the `{"type":"error","error":...}` frame, so the
/// strings below must not be changed casually -- they are the wire contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing 'type'")]
    MissingType,
    #[error("unknown type")]
    UnknownType,
    #[error("{0} requires '{1}'")]
    MissingField(&'static str, &'static str),
    #[error("missing '{0}'")]
    MissingFieldBare(&'static str),
    #[error("must bind first")]
    MustBindFirst,
    #[error("already bound")]
    AlreadyBound,
    #[error("bind requires 'appid'")]
    BindRequiresAppId,
    #[error("bind requires 'side'")]
    BindRequiresSide,
    #[error("you already allocated one, don't be greedy")]
    AlreadyAllocated,
    #[error("must claim a nameplate before releasing it")]
    MustClaimBeforeReleasing,
    #[error("release does not match held nameplate")]
    ReleaseMismatch,
    #[error("you already have a mailbox open")]
    MailboxAlreadyOpen,
    #[error("must open mailbox before adding")]
    MustOpenBeforeAdding,
    #[error("must open mailbox before closing")]
    MustOpenBeforeClosing,
    #[error("crowded")]
    Crowded,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    /// Render this error as the wire `{"type":"error",...}` frame responding to `orig`.
    pub fn into_message(self, orig: &ClientMessage) -> crate::message::ServerMessage {
        crate::message::ServerMessage::error(orig, &self.to_string())
    }
}

/// Failures specific to the transit relay's handshake.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitError {
    #[error("bad handshake")]
    BadHandshake,
    #[error("impatient")]
    Impatient,
}

impl TransitError {
    /// The literal line (including trailing newline) the relay writes back.
    pub fn wire_line(&self) -> &'static str {
        match self {
            TransitError::BadHandshake => "bad handshake\n",
            TransitError::Impatient => "impatient\n",
        }
    }
}

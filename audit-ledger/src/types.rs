//! Core types for the audit ledger
//!
//! `AuditEvent` is the only persisted entity. Its serde field names are the
//! wire names shared with every other consumer of the ledger, so they must
//! not change.

use crate::{value::Value, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of lifecycle transition an event records
///
/// Free-form so new workflow steps need no ledger release; the constants
/// below are the kinds the scholarship workflow emits today.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Application created
    pub const APPLICATION_CREATED: &'static str = "POSTULACION_CREADA";
    /// Application submitted for review
    pub const APPLICATION_SUBMITTED: &'static str = "POSTULACION_ENVIADA";
    /// Automated scoring finished
    pub const AUTOMATED_REVIEW: &'static str = "EVALUACION_IA";
    /// Manual review finished
    pub const MANUAL_REVIEW: &'static str = "EVALUACION_MANUAL";
    /// Forwarded to the council
    pub const SENT_TO_COUNCIL: &'static str = "ENVIO_CONSEJO";
    /// Council decision recorded
    pub const COUNCIL_DECISION: &'static str = "DECISION_CONSEJO";
    /// Scholarship granted
    pub const SCHOLARSHIP_GRANTED: &'static str = "BECA_ASIGNADA";
    /// Scholarship rejected
    pub const SCHOLARSHIP_REJECTED: &'static str = "BECA_RECHAZADA";
    /// Supporting document uploaded
    pub const DOCUMENT_UPLOADED: &'static str = "DOCUMENTO_SUBIDO";
    /// Generic status change
    pub const STATUS_CHANGED: &'static str = "CAMBIO_ESTADO";

    /// Kinds emitted by the scholarship workflow
    pub const KNOWN: [&'static str; 10] = [
        Self::APPLICATION_CREATED,
        Self::APPLICATION_SUBMITTED,
        Self::AUTOMATED_REVIEW,
        Self::MANUAL_REVIEW,
        Self::SENT_TO_COUNCIL,
        Self::COUNCIL_DECISION,
        Self::SCHOLARSHIP_GRANTED,
        Self::SCHOLARSHIP_REJECTED,
        Self::DOCUMENT_UPLOADED,
        Self::STATUS_CHANGED,
    ];

    /// Create new event type
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for one of the workflow's standard kinds
    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(&self.0.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventType {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for EventType {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// A committed ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Caller-supplied unique id (primary key)
    pub id: String,

    /// Kind of transition
    #[serde(rename = "tipo")]
    pub event_type: EventType,

    /// Application this event belongs to
    #[serde(rename = "postulacion_id")]
    pub correlation_id: String,

    /// Who triggered the event
    #[serde(rename = "usuario_id")]
    pub actor_id: String,

    /// Display name of the actor
    #[serde(rename = "usuario_nombre")]
    pub actor_name: String,

    /// Caller data, opaque to the ledger
    #[serde(rename = "datos")]
    pub payload: Value,

    /// Ledger annotations (empty mapping at commit)
    pub metadata: Value,

    /// Commit time, RFC 3339 UTC with fixed nanosecond width
    pub timestamp: String,

    /// Reserved; the ledger never fills it
    #[serde(default)]
    pub block_number: Option<i64>,

    /// Id of the enclosing commit
    pub transaction_id: String,
}

impl AuditEvent {
    /// Build the committed record from a request and its commit context
    pub fn commit(event: NewEvent, ctx: &CommitContext) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            correlation_id: event.correlation_id,
            actor_id: event.actor_id,
            actor_name: event.actor_name,
            payload: event.payload,
            metadata: Value::empty_mapping(),
            timestamp: ctx.timestamp.clone(),
            block_number: None,
            transaction_id: ctx.transaction_id.clone(),
        }
    }

    /// Sort key within a correlation group
    pub fn history_order(&self) -> (&str, &str) {
        (&self.timestamp, &self.transaction_id)
    }
}

/// Registration request: everything the caller supplies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Unique event id
    pub id: String,
    /// Kind of transition
    pub event_type: EventType,
    /// Application id
    pub correlation_id: String,
    /// Actor id
    pub actor_id: String,
    /// Actor display name
    pub actor_name: String,
    /// Opaque payload
    pub payload: Value,
}

impl NewEvent {
    /// Create a registration request
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<EventType>,
        correlation_id: impl Into<String>,
        actor_id: impl Into<String>,
        actor_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            correlation_id: correlation_id.into(),
            actor_id: actor_id.into(),
            actor_name: actor_name.into(),
            payload,
        }
    }

    /// Check identifier preconditions
    ///
    /// Ids become storage keys and index key components, where NUL is the
    /// field separator.
    pub fn validate_identifiers(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidEvent("event id must not be empty".to_string()));
        }
        check_no_nul("id", &self.id)?;
        check_no_nul("correlation id", &self.correlation_id)
    }
}

fn check_no_nul(field: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::InvalidEvent(format!(
            "{} must not contain NUL bytes",
            field
        )));
    }
    Ok(())
}

/// Commit metadata handed out by the record store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitContext {
    /// Opaque commit id
    pub transaction_id: String,
    /// Commit time
    pub timestamp: String,
}

/// Returned by a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Registered event id
    pub event_id: String,
    /// Commit id
    pub transaction_id: String,
    /// Commit time
    pub timestamp: String,
    /// SHA-256 of the stored record, hex
    pub hash: String,
}

/// Opaque continuation marker for paged listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub(crate) fn after(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub(crate) fn last_key(&self) -> &str {
        &self.0
    }

    /// Restore a token previously handed to a client
    pub fn from_opaque(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text for handing to a client
    pub fn as_opaque(&self) -> &str {
        &self.0
    }
}

/// One page of a key-ordered listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Events in ascending id order
    pub events: Vec<AuditEvent>,
    /// Present while more events follow
    pub next_page_token: Option<PageToken>,
}

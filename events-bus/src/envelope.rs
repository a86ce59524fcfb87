use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventBusError, Result};

/// Closed set of event kinds the bus carries.
///
/// The wire form is the dotted name (`appointment.scheduled`). Keeping the
/// set closed means a typo in a producer fails at compile time instead of
/// silently creating a stream nobody consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    ClientCreated,
    ClientUpdated,
    ClientArchived,
    ProviderCreated,
    ProviderUpdated,
    ProviderDeactivated,
    AppointmentScheduled,
    AppointmentRescheduled,
    AppointmentCancelled,
    AppointmentCompleted,
    NoteCreated,
    NoteSigned,
    NoteAmended,
    LedgerEntryPosted,
    LedgerEntryVoided,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::ClientCreated => "client.created",
            Self::ClientUpdated => "client.updated",
            Self::ClientArchived => "client.archived",
            Self::ProviderCreated => "provider.created",
            Self::ProviderUpdated => "provider.updated",
            Self::ProviderDeactivated => "provider.deactivated",
            Self::AppointmentScheduled => "appointment.scheduled",
            Self::AppointmentRescheduled => "appointment.rescheduled",
            Self::AppointmentCancelled => "appointment.cancelled",
            Self::AppointmentCompleted => "appointment.completed",
            Self::NoteCreated => "note.created",
            Self::NoteSigned => "note.signed",
            Self::NoteAmended => "note.amended",
            Self::LedgerEntryPosted => "ledger.entry_posted",
            Self::LedgerEntryVoided => "ledger.entry_voided",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "user.created" => Self::UserCreated,
            "user.updated" => Self::UserUpdated,
            "user.deleted" => Self::UserDeleted,
            "client.created" => Self::ClientCreated,
            "client.updated" => Self::ClientUpdated,
            "client.archived" => Self::ClientArchived,
            "provider.created" => Self::ProviderCreated,
            "provider.updated" => Self::ProviderUpdated,
            "provider.deactivated" => Self::ProviderDeactivated,
            "appointment.scheduled" => Self::AppointmentScheduled,
            "appointment.rescheduled" => Self::AppointmentRescheduled,
            "appointment.cancelled" => Self::AppointmentCancelled,
            "appointment.completed" => Self::AppointmentCompleted,
            "note.created" => Self::NoteCreated,
            "note.signed" => Self::NoteSigned,
            "note.amended" => Self::NoteAmended,
            "ledger.entry_posted" => Self::LedgerEntryPosted,
            "ledger.entry_voided" => Self::LedgerEntryVoided,
            other => {
                return Err(EventBusError::Validation(format!(
                    "unknown event type `{other}`"
                )))
            }
        };
        Ok(kind)
    }
}

impl TryFrom<String> for EventKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse().map_err(|e: EventBusError| e.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Delivery urgency hint carried on every envelope. The bus itself treats
/// all severities identically; consumers may branch on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(EventBusError::Validation(format!(
                "unknown severity `{other}`"
            ))),
        }
    }
}

/// One event as carried on the stream.
///
/// Producers fill in the kind, resource coordinates and metadata; the
/// publish path stamps `correlation_id`, `environment` and `published_at`.
/// Metadata values are free text and are scrubbed before they reach the
/// wire, so they may hold operator-facing notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventKind,
    pub resource_type: String,
    pub resource_id: String,
    pub severity: Severity,
    pub correlation_id: Option<String>,
    pub environment: String,
    pub metadata: HashMap<String, String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    pub fn new(event_type: EventKind, resource_type: &str, resource_id: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            severity: Severity::Normal,
            correlation_id: None,
            environment: String::new(),
            metadata: HashMap::new(),
            published_at: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Flatten into the wire field map. Metadata is carried as one JSON
    /// object field so arbitrary keys cannot collide with envelope fields.
    pub fn to_fields(&self) -> Result<HashMap<String, String>> {
        let metadata = serde_json::to_string(&self.metadata)
            .map_err(|e| EventBusError::Validation(format!("metadata not serializable: {e}")))?;

        let mut fields = HashMap::with_capacity(9);
        fields.insert("event_id".to_string(), self.event_id.to_string());
        fields.insert("event_type".to_string(), self.event_type.as_str().to_string());
        fields.insert("resource_type".to_string(), self.resource_type.clone());
        fields.insert("resource_id".to_string(), self.resource_id.clone());
        fields.insert("severity".to_string(), self.severity.as_str().to_string());
        fields.insert(
            "correlation_id".to_string(),
            self.correlation_id.clone().unwrap_or_default(),
        );
        fields.insert("environment".to_string(), self.environment.clone());
        fields.insert("metadata".to_string(), metadata);
        fields.insert(
            "published_at".to_string(),
            self.published_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        Ok(fields)
    }

    /// Rebuild an envelope from a wire field map.
    ///
    /// Every field a stamped envelope writes is required here. Entries that
    /// fail this validation are poison and get routed to the dead-letter
    /// stream by the consumer.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let event_id = Uuid::parse_str(required(fields, "event_id")?)
            .map_err(|e| EventBusError::Validation(format!("invalid event_id: {e}")))?;
        let event_type: EventKind = required(fields, "event_type")?.parse()?;
        let resource_type = required(fields, "resource_type")?.to_string();
        let resource_id = required(fields, "resource_id")?.to_string();
        let severity: Severity = required(fields, "severity")?.parse()?;
        let correlation_id = required(fields, "correlation_id")?.to_string();
        let environment = required(fields, "environment")?.to_string();
        let metadata: HashMap<String, String> =
            serde_json::from_str(required(fields, "metadata")?)
                .map_err(|e| EventBusError::Validation(format!("invalid metadata: {e}")))?;
        let published_at = DateTime::parse_from_rfc3339(required(fields, "published_at")?)
            .map_err(|e| EventBusError::Validation(format!("invalid published_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            event_id,
            event_type,
            resource_type,
            resource_id,
            severity,
            correlation_id: Some(correlation_id),
            environment,
            metadata,
            published_at: Some(published_at),
        })
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    match fields.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(EventBusError::Validation(format!("empty field `{key}`"))),
        None => Err(EventBusError::Validation(format!("missing field `{key}`"))),
    }
}

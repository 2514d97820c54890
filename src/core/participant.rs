use serde::Serialize;
use sqlx::{prelude::FromRow, types::time};

use crate::util::serialize_datetime;

/// A struct representing a person taking part in a session's draw
#[derive(PartialEq, Eq, Debug, FromRow, Clone, Serialize)]
pub struct Participant {
    /// Unique participant ID
    pub id: i64,

    /// The session this participant belongs to
    pub session_id: i64,

    /// The name of this participant
    pub name: String,

    /// This participant's email, unique within the session
    pub email: String,

    /// Whether this participant has drawn a recipient
    pub has_picked: bool,

    /// The participant this one gives a gift to.
    /// Never serialized: nobody but the giver may learn it.
    #[serde(skip)]
    pub assigned_to: Option<i64>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: time::OffsetDateTime,
}

impl Participant {
    pub fn public_identity(&self) -> Recipient {
        Recipient {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// The public identity of a gift recipient
#[derive(PartialEq, Eq, Debug, FromRow, Clone, Serialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

/// Identity of someone asking to pick.
///
/// When `id` is absent the picker is resolved by email, and registered
/// in the session if nobody uses that email yet.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Picker {
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
}

/// How a participant is looked up
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ParticipantRef {
    Id(i64),
    Email(String),
}

impl std::fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantRef::Id(id) => write!(f, "#{}", id),
            ParticipantRef::Email(email) => write!(f, "{}", email),
        }
    }
}

impl From<&str> for ParticipantRef {
    /// Numeric input is an ID, anything else an email.
    fn from(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(id) => ParticipantRef::Id(id),
            Err(_) => ParticipantRef::Email(s.to_owned()),
        }
    }
}

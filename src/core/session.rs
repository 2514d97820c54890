use serde::Serialize;
use sqlx::{prelude::FromRow, types::time};

use crate::util::serialize_datetime;

/// A gift exchange. Participants join it and draw their recipients inside it.
#[derive(PartialEq, Eq, Debug, FromRow, Clone, Serialize)]
pub struct Session {
    pub id: i64,

    pub name: String,

    /// Code shared with people invited to this session
    pub invite_code: String,

    /// Picks are only accepted while the session is active
    pub is_active: bool,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: time::OffsetDateTime,
}

use serde::Serializer;
use sqlx::types::time;

/// Serializes a timestamp as unix milliseconds.
pub fn serialize_datetime<S>(x: &time::OffsetDateTime, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    // Millisecond timestamps of every representable date fit in an i64.
    s.serialize_i64((x.unix_timestamp_nanos() / 1_000_000) as i64)
}

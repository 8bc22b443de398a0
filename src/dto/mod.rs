use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::state::room::UnixMillis;

pub mod health;
pub mod room;
pub mod validation;
pub mod ws;

fn format_unix_millis(millis: UnixMillis) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .ok()
        .and_then(|moment| moment.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}

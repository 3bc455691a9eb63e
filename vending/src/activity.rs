//! Recent activity feed for the status page.

use crate::config::ActivityWindow;
use crate::types::LogEntry;
use vending_core::event_log::{EventLog, EventLogError};

/// Newest audit entries first.
///
/// Reads `window.fetch` entries from the end of the log, orders them by
/// timestamp (later appends win ties) and keeps `window.display`.
///
/// # Errors
///
/// Returns [`EventLogError`] if the log cannot be read.
pub async fn recent_activity(
    log: &dyn EventLog<LogEntry>,
    window: ActivityWindow,
) -> Result<Vec<LogEntry>, EventLogError> {
    let mut entries = log.tail(window.fetch).await?;
    entries.reverse();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries.truncate(window.display);
    Ok(entries)
}

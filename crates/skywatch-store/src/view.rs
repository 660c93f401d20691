use chrono::NaiveDate;
use rusqlite::Connection;

use crate::{StoreError, StoreReader};

/// A read transaction pinned at open time. Runs that commit while the view
/// is alive stay invisible to it, so every query answers from the same
/// committed state.
pub struct ReadView {
    conn: Connection,
    anchor: Option<NaiveDate>,
}

impl ReadView {
    pub(crate) fn open(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN DEFERRED")?;
        // The first read fixes the snapshot.
        let anchor = StoreReader::new(&conn).latest_committed_date()?;
        Ok(Self { conn, anchor })
    }

    /// Latest committed collection date as of when the view was opened.
    pub fn anchor(&self) -> Option<NaiveDate> {
        self.anchor
    }

    pub fn reader(&self) -> StoreReader<'_> {
        StoreReader::new(&self.conn)
    }
}

impl Drop for ReadView {
    fn drop(&mut self) {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            tracing::debug!(error = %err, "closing read view failed");
        }
    }
}

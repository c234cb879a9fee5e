//! Natural-key deduplication
//!
//! Decides, against what is already stored, whether a record is new, a repeat
//! of the latest revision, or a change that needs a revision of its own.

use crate::storage::sqlite::latest_revision;
use crate::storage::{StorageResult, TradeRecord};
use rusqlite::Connection;

/// Outcome of resolving a record against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No revision exists for the natural key
    New,

    /// The latest revision has identical content
    Unchanged,

    /// Content differs; insert as `revision`
    Changed { revision: u32 },
}

/// Resolves a record on the given connection
///
/// Runs inside the caller's transaction when there is one, so records earlier
/// in the same batch are visible.
pub fn resolve(conn: &Connection, record: &TradeRecord) -> StorageResult<Resolution> {
    let Some(stored) = latest_revision(conn, &record.hash_id)? else {
        return Ok(Resolution::New);
    };

    if stored.record.same_content(record) {
        Ok(Resolution::Unchanged)
    } else {
        Ok(Resolution::Changed {
            revision: stored.revision + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::create_test_record;
    use crate::storage::{SqliteStorage, Storage};

    #[test]
    fn test_resolve_lifecycle() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let record = create_test_record("Jane Doe", "ACME", 100);

        assert_eq!(resolve(storage.connection(), &record).unwrap(), Resolution::New);

        storage.upsert_batch(&[record.clone()], 100).unwrap();
        assert_eq!(
            resolve(storage.connection(), &record).unwrap(),
            Resolution::Unchanged
        );

        let mut corrected = record.clone();
        corrected.price = Some(12.5);
        assert_eq!(
            resolve(storage.connection(), &corrected).unwrap(),
            Resolution::Changed { revision: 2 }
        );
    }

    #[test]
    fn test_other_source_is_not_a_change() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let record = create_test_record("Jane Doe", "ACME", 100);
        storage.upsert_batch(&[record.clone()], 100).unwrap();

        let mut elsewhere = record;
        elsewhere.source = "latest_purchases".to_string();
        assert_eq!(
            resolve(storage.connection(), &elsewhere).unwrap(),
            Resolution::Unchanged
        );
    }
}

//! Row ID generation.

use uuid::Uuid;

/// Generate a new database row ID.
///
/// Uses UUIDv7 so ids sort by creation time, which keeps hot btree pages
/// together and makes `ORDER BY id` a usable tiebreak.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}

//! Row types returned by the checkpoint repository.

use chrono::NaiveDateTime;

/// One stored checkpoint value.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StateRow {
    pub stream: String,
    pub partition: String,
    pub key: String,
    pub value: String,
    pub updated_at: NaiveDateTime,
}

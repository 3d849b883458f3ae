//! Daily document counters: `OT-YYYYMMDD-NNNN` for work orders and
//! `OC-YYYYMMDD-NNNN` for purchase orders.
//!
//! Each day prefix owns one `document_counters` row. The row is seeded with
//! `ON CONFLICT DO NOTHING` and then read under an exclusive lock, so the
//! first allocations of a day queue on the same row instead of colliding.
//! The counter moves inside the caller's transaction; a rolled-back command
//! gives its number back.

use crate::{
    entities::document_counter::{self, Entity as DocumentCounter},
    errors::ServiceError,
};
use chrono::{NaiveDate, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ConnectionTrait, DbErr, EntityTrait, QuerySelect,
    Set, SqlErr,
};

pub const WORK_ORDER_PREFIX: &str = "OT";
pub const PURCHASE_ORDER_PREFIX: &str = "OC";

const MAX_DAILY_SEQUENCE: u32 = 9999;

/// `OT-20240131-`
pub fn daily_prefix(prefix: &str, day: NaiveDate) -> String {
    format!("{}-{}-", prefix, day.format("%Y%m%d"))
}

pub fn format_number(day_prefix: &str, sequence: u32) -> String {
    format!("{}{:04}", day_prefix, sequence)
}

/// Sequence that follows `current`, the last value issued under `day_prefix`.
pub fn next_sequence(current: u32, day_prefix: &str) -> Result<u32, ServiceError> {
    if current >= MAX_DAILY_SEQUENCE {
        return Err(ServiceError::Conflict(format!(
            "Daily counter exhausted for {}",
            day_prefix
        )));
    }
    Ok(current + 1)
}

async fn allocate<C: ConnectionTrait>(conn: &C, day_prefix: &str) -> Result<String, ServiceError> {
    let now = Utc::now();
    DocumentCounter::insert(document_counter::ActiveModel {
        prefix: Set(day_prefix.to_string()),
        last_value: Set(0),
        updated_at: Set(now),
    })
    .on_conflict(
        OnConflict::column(document_counter::Column::Prefix)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await
    .map_err(ServiceError::db_error)?;

    let counter = DocumentCounter::find_by_id(day_prefix.to_string())
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::InternalError(format!("Counter {} vanished", day_prefix)))?;
    let current = u32::try_from(counter.last_value).map_err(|_| {
        ServiceError::InternalError(format!(
            "Counter {} holds {}",
            day_prefix, counter.last_value
        ))
    })?;
    let sequence = next_sequence(current, day_prefix)?;

    let mut active: document_counter::ActiveModel = counter.into();
    active.last_value = Set(sequence as i32);
    active.updated_at = Set(now);
    active.update(conn).await.map_err(ServiceError::db_error)?;
    Ok(format_number(day_prefix, sequence))
}

pub async fn next_work_order_number<C: ConnectionTrait>(
    conn: &C,
    day: NaiveDate,
) -> Result<String, ServiceError> {
    allocate(conn, &daily_prefix(WORK_ORDER_PREFIX, day)).await
}

pub async fn next_purchase_order_number<C: ConnectionTrait>(
    conn: &C,
    day: NaiveDate,
) -> Result<String, ServiceError> {
    allocate(conn, &daily_prefix(PURCHASE_ORDER_PREFIX, day)).await
}

/// Maps a unique-index violation on insert to `Conflict`.
pub fn conflict_on_duplicate(err: DbErr, what: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict(format!("Duplicate {}", what))
        }
        _ => ServiceError::db_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn jan_31() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
    }

    #[test]
    fn prefix_and_format() {
        let prefix = daily_prefix(WORK_ORDER_PREFIX, jan_31());
        assert_eq!(prefix, "OT-20240131-");
        assert_eq!(format_number(&prefix, 7), "OT-20240131-0007");
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(99, 100)]
    fn sequence_follows_last_value(#[case] current: u32, #[case] expected: u32) {
        assert_eq!(next_sequence(current, "OT-20240131-").unwrap(), expected);
    }

    #[test]
    fn exhausted_counter_is_a_conflict() {
        assert_matches!(
            next_sequence(9999, "OC-20240131-"),
            Err(ServiceError::Conflict(_))
        );
    }
}

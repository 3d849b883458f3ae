use crate::errors::ServiceError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// Core engines
pub mod cash_shifts;
pub mod commissions;
pub mod inventory;
pub mod sales;
pub mod work_orders;

// Accounts payable
pub mod payables;

// Reference data and documents
pub mod catalog;
pub mod documents;
pub mod numbering;

// Service factory for dependency injection
pub mod factory;

/// The authenticated employee issuing a command.
///
/// Authentication and role checks happen upstream; the core only needs the
/// identity for audit stamps and the technician capability for auto-assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: i32,
    pub is_technician: bool,
}

impl Actor {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            is_technician: false,
        }
    }

    pub fn technician(id: i32) -> Self {
        Self {
            id,
            is_technician: true,
        }
    }
}

pub(crate) fn ensure_positive(value: Decimal, field: &str) -> Result<(), ServiceError> {
    if value <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

pub(crate) fn ensure_non_negative(value: Decimal, field: &str) -> Result<(), ServiceError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ServiceError::ValidationError(format!(
            "{} cannot be negative",
            field
        )));
    }
    Ok(())
}

/// Trims `value` and rejects it when empty.
pub(crate) fn require_text(value: &str, field: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "{} is required",
            field
        )));
    }
    Ok(trimmed.to_string())
}

/// Like [`require_text`] for optional inputs; blank strings become `None`.
pub(crate) fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn positive_and_non_negative_checks() {
        assert!(ensure_positive(dec!(0.001), "quantity").is_ok());
        assert!(ensure_positive(Decimal::ZERO, "quantity").is_err());
        assert!(ensure_non_negative(Decimal::ZERO, "price").is_ok());
        assert!(ensure_non_negative(dec!(-0.01), "price").is_err());
    }

    #[test]
    fn text_helpers_trim() {
        assert_eq!(require_text("  brakes ", "reason").unwrap(), "brakes");
        assert!(require_text("   ", "reason").is_err());
        assert_eq!(optional_text(Some("  ")), None);
        assert_eq!(optional_text(Some(" x ")), Some("x".to_string()));
    }
}

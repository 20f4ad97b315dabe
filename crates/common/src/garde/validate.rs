//! Garde validation utilities.

use crate::domain::DomainError;
use garde::{Report, Validate};

/// Validate a struct, mapping the garde report to `DomainError::ValidationError`
pub fn validate_struct<T>(value: &T) -> Result<(), DomainError>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::ValidationError(format_validation_errors(&report)))
}

/// Render a garde report as `path: message` pairs joined by commas
fn format_validation_errors(report: &Report) -> String {
    report
        .iter()
        .map(|(path, error)| {
            let path = path.to_string();
            if path.is_empty() {
                error.message().to_string()
            } else {
                format!("{}: {}", path, error.message())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

//! Write-once field guards
//!
//! Records keep write-once attributes as `Option<T>`: `None` means the field
//! has not been initialized yet.

use crate::error::{RelationError, RelationResult};

/// Initialize a write-once field
///
/// Fails with `AlreadyInitialized` if the field already holds a value,
/// even an equal one.
pub fn init_value<T>(slot: &mut Option<T>, value: T, field: &str) -> RelationResult<()> {
    if slot.is_some() {
        return Err(RelationError::already_initialized(field));
    }
    *slot = Some(value);
    Ok(())
}

/// Initialize a write-once field, tolerating re-initialization with an equal value
pub fn init_value_or_same<T>(slot: &mut Option<T>, value: T, field: &str) -> RelationResult<()>
where
    T: PartialEq,
{
    if let Some(current) = slot.as_ref() {
        if *current != value {
            return Err(RelationError::already_initialized(field));
        }
    }
    *slot = Some(value);
    Ok(())
}

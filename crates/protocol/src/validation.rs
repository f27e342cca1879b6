//! User id validation for the connection path segment

use thiserror::Error;

/// Validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserIdError {
    #[error("User id is empty")]
    Empty,

    #[error("User id too long: {len} bytes (max: {max})")]
    TooLong { len: usize, max: usize },

    #[error("User id contains control characters")]
    ControlCharacter,
}

/// Default upper bound on user id length
pub const MAX_USER_ID_LEN: usize = 256;

/// Validate a decoded user id taken from `/imserver/{userId}`
///
/// Ids are free-form and used verbatim, whitespace included. This only
/// rejects values that cannot sensibly act as a registry key.
pub fn validate_user_id(user_id: &str, max_len: usize) -> Result<(), UserIdError> {
    if user_id.is_empty() {
        return Err(UserIdError::Empty);
    }

    if user_id.len() > max_len {
        return Err(UserIdError::TooLong {
            len: user_id.len(),
            max: max_len,
        });
    }

    if user_id.chars().any(char::is_control) {
        return Err(UserIdError::ControlCharacter);
    }

    Ok(())
}

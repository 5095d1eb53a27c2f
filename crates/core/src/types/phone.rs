//! Contact phone number type.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing a [`Phone`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PhoneError {
    /// The input string is empty.
    #[error("phone cannot be empty")]
    Empty,
    /// The input contains something other than ASCII digits.
    #[error("phone must contain digits only")]
    NonDigit,
    /// The input has the wrong number of digits.
    #[error("phone must be exactly {expected} digits, got {actual}")]
    WrongLength {
        /// Required digit count.
        expected: usize,
        /// Digits supplied.
        actual: usize,
    },
}

/// A ten-digit contact phone number.
///
/// ```
/// use ticket_desk_core::Phone;
///
/// assert!(Phone::parse("5551234567").is_ok());
/// assert!(Phone::parse("555123456").is_err());
/// assert!(Phone::parse("555-123-4567").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Phone(String);

impl Phone {
    /// Number of digits a phone must have.
    pub const DIGITS: usize = 10;

    /// Parse a `Phone` from a string. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the trimmed input is empty, contains a non-digit,
    /// or does not have exactly ten digits.
    pub fn parse(s: &str) -> Result<Self, PhoneError> {
        let s = s.trim();

        if s.is_empty() {
            return Err(PhoneError::Empty);
        }

        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PhoneError::NonDigit);
        }

        if s.len() != Self::DIGITS {
            return Err(PhoneError::WrongLength {
                expected: Self::DIGITS,
                actual: s.len(),
            });
        }

        Ok(Self(s.to_owned()))
    }

    /// Returns the phone number as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Phone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Phone {
    type Error = PhoneError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Phone> for String {
    fn from(phone: Phone) -> Self {
        phone.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        assert!(Phone::parse("5551234567").is_ok());
        assert!(Phone::parse(" 5551234567 ").is_ok());
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(Phone::parse(""), Err(PhoneError::Empty));
    }

    #[test]
    fn test_parse_non_digit() {
        assert_eq!(Phone::parse("555-1234567"), Err(PhoneError::NonDigit));
        assert_eq!(Phone::parse("55512345a7"), Err(PhoneError::NonDigit));
    }

    #[test]
    fn test_parse_wrong_length() {
        assert_eq!(
            Phone::parse("555123456"),
            Err(PhoneError::WrongLength {
                expected: 10,
                actual: 9
            })
        );
        assert!(matches!(
            Phone::parse("55512345678"),
            Err(PhoneError::WrongLength { actual: 11, .. })
        ));
    }
}

//! Property-equality filter expressions for filtered receives.

use crate::error::ClientError;
use crate::message::{Message, USER_ID_PROPERTY};

/// A consumer filter selecting messages whose property equals a value.
///
/// The textual form is `<key> = '<value>'`. Filtering on
/// [`USER_ID_PROPERTY`] selects on the message user id rather than a regular
/// property, which is how a requestor picks out only the reply correlated
/// with its own request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    key: String,
    value: String,
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Filter selecting only the reply correlated with `user_id`.
    pub fn user_id(user_id: impl Into<String>) -> Self {
        Filter::eq(USER_ID_PROPERTY, user_id)
    }

    /// Parse a `<key> = '<value>'` expression.
    pub fn parse(expression: &str) -> Result<Self, ClientError> {
        let malformed = || ClientError::InvalidFilter(expression.to_string());
        let (key, value) = expression.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.len() < 2 {
            return Err(malformed());
        }
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .ok_or_else(malformed)?;
        Ok(Filter::eq(key, value))
    }

    pub fn expression(&self) -> String {
        format!("{} = '{}'", self.key, self.value)
    }

    pub(crate) fn matches(&self, message: &Message) -> bool {
        if self.key == USER_ID_PROPERTY {
            message.user_id() == Some(self.value.as_str())
        } else {
            message.property(&self.key) == Some(self.value.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() -> Result<(), ClientError> {
        let filter = Filter::parse("kind = 'audit'")?;
        assert_eq!(filter, Filter::eq("kind", "audit"));
        assert_eq!(Filter::parse(&filter.expression())?, filter);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for expression in ["", "kind", "kind = audit", "= 'audit'", "kind = '"] {
            assert!(Filter::parse(expression).is_err(), "{:?}", expression);
        }
    }

    #[test]
    fn test_matches_user_id_and_properties() {
        let mut message = Message::text("x");
        message.set_user_id("abc");
        message.set_property("kind", "audit");

        assert!(Filter::user_id("abc").matches(&message));
        assert!(!Filter::user_id("other").matches(&message));
        assert!(Filter::eq("kind", "audit").matches(&message));
        assert!(!Filter::eq("kind", "metric").matches(&message));
        assert!(!Filter::eq("missing", "x").matches(&message));
    }
}

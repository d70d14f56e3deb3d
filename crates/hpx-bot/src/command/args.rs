//! Typed argument values and token coercion.

use std::collections::HashMap;

use serde_json::Value;

use super::schema::ArgType;
use crate::{
    collaborators::UserFetch,
    envelope::{ChatMessage, User},
    error::CommandError,
};

/// A parsed argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    User(User),
    Repost(Value),
}

impl ArgValue {
    /// Convert a JSON schema default. `null` means no default.
    pub(crate) fn from_default(
        name: &str,
        kind: ArgType,
        value: Value,
    ) -> Result<Option<Self>, CommandError> {
        let converted = match (kind, value) {
            (_, Value::Null) => return Ok(None),
            (ArgType::String | ArgType::User, Value::String(s)) => Self::String(s),
            (ArgType::Int, Value::Number(n)) => match n.as_i64() {
                Some(n) => Self::Int(n),
                None => {
                    return Err(CommandError::schema(format!(
                        "{name}: default {n} is not an integer"
                    )));
                }
            },
            (ArgType::Float, Value::Number(n)) => match n.as_f64() {
                Some(n) => Self::Float(n),
                None => {
                    return Err(CommandError::schema(format!(
                        "{name}: default {n} is not a number"
                    )));
                }
            },
            (ArgType::Boolean, Value::Bool(b)) => Self::Bool(b),
            (ArgType::Repost, value) => Self::Repost(value),
            (kind, value) => {
                return Err(CommandError::schema(format!(
                    "{name}: default {value} does not match type {kind}"
                )));
            }
        };
        Ok(Some(converted))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn as_repost(&self) -> Option<&Value> {
        match self {
            Self::Repost(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<User> for ArgValue {
    fn from(value: User) -> Self {
        Self::User(value)
    }
}

/// Parsed arguments of one invocation, keyed by schema name.
///
/// Optional arguments without a token or default are absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    values: HashMap<String, ArgValue>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ArgValue::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ArgValue::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ArgValue::as_bool)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.get(name).and_then(ArgValue::as_user)
    }

    pub fn repost(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(ArgValue::as_repost)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn parse_int(name: &str, token: &str) -> Result<ArgValue, CommandError> {
    token
        .parse::<i64>()
        .map(ArgValue::Int)
        .map_err(|_| CommandError::InvalidInteger {
            name: name.to_string(),
            value: token.to_string(),
        })
}

pub(crate) fn parse_float(name: &str, token: &str) -> Result<ArgValue, CommandError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(ArgValue::Float)
        .ok_or_else(|| CommandError::InvalidFloat {
            name: name.to_string(),
            value: token.to_string(),
        })
}

pub(crate) fn parse_bool(name: &str, token: &str) -> Result<ArgValue, CommandError> {
    match token.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "y" => Ok(ArgValue::Bool(true)),
        "false" | "no" | "0" | "n" => Ok(ArgValue::Bool(false)),
        _ => Err(CommandError::InvalidBoolean {
            name: name.to_string(),
            value: token.to_string(),
        }),
    }
}

pub(crate) async fn lookup_user(
    name: &str,
    token: &str,
    users: Option<&dyn UserFetch>,
) -> Result<ArgValue, CommandError> {
    let tag = token.strip_prefix('@').unwrap_or(token);
    let Some(users) = users else {
        return Err(CommandError::UserLookup {
            name: name.to_string(),
            source: crate::error::ApiRequestError::request("No user lookup configured"),
        });
    };
    match users.lookup(tag).await {
        Ok(user) => Ok(ArgValue::User(user)),
        Err(err) if err.is_not_found() => Err(CommandError::UserNotFound {
            name: name.to_string(),
            tag: tag.to_string(),
        }),
        Err(source) => Err(CommandError::UserLookup {
            name: name.to_string(),
            source,
        }),
    }
}

pub(crate) fn repost_of(name: &str, message: &ChatMessage) -> Result<ArgValue, CommandError> {
    message
        .repost
        .clone()
        .map(ArgValue::Repost)
        .ok_or_else(|| CommandError::MissingRepost {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strict_integer_parsing() {
        assert_eq!(parse_int("n", "30").expect("int"), ArgValue::Int(30));
        assert_eq!(parse_int("n", "-4").expect("int"), ArgValue::Int(-4));
        for bad in ["30abc", "3.5", "", "notanumber"] {
            assert!(matches!(
                parse_int("n", bad),
                Err(CommandError::InvalidInteger { .. })
            ));
        }
    }

    #[test]
    fn test_float_rejects_nan() {
        assert_eq!(parse_float("x", "2.5").expect("float"), ArgValue::Float(2.5));
        assert!(matches!(
            parse_float("x", "NaN"),
            Err(CommandError::InvalidFloat { .. })
        ));
        assert!(parse_float("x", "abc").is_err());
    }

    #[test]
    fn test_boolean_spellings() {
        for truthy in ["true", "YES", "1", "y"] {
            assert_eq!(parse_bool("b", truthy).expect("bool"), ArgValue::Bool(true));
        }
        for falsy in ["False", "no", "0", "N"] {
            assert_eq!(parse_bool("b", falsy).expect("bool"), ArgValue::Bool(false));
        }
        assert!(matches!(
            parse_bool("b", "maybe"),
            Err(CommandError::InvalidBoolean { .. })
        ));
    }

    #[test]
    fn test_default_conversion() {
        assert_eq!(
            ArgValue::from_default("n", ArgType::Int, json!(5)).expect("int"),
            Some(ArgValue::Int(5))
        );
        assert_eq!(
            ArgValue::from_default("n", ArgType::Int, Value::Null).expect("null"),
            None
        );
        assert!(ArgValue::from_default("n", ArgType::Int, json!(1.5)).is_err());
        assert!(ArgValue::from_default("b", ArgType::Boolean, json!("yes")).is_err());
    }

    #[test]
    fn test_repost_requires_payload() {
        let mut message = ChatMessage::default();
        assert!(matches!(
            repost_of("r", &message),
            Err(CommandError::MissingRepost { .. })
        ));
        message.repost = Some(json!({ "Id": 1 }));
        assert_eq!(
            repost_of("r", &message).expect("repost"),
            ArgValue::Repost(json!({ "Id": 1 }))
        );
    }

    #[test]
    fn test_typed_getters() {
        let mut args = Args::new();
        args.insert("name", ArgValue::from("Alice"));
        args.insert("age", ArgValue::from(30_i64));
        assert_eq!(args.str("name"), Some("Alice"));
        assert_eq!(args.int("age"), Some(30));
        assert_eq!(args.str("age"), None);
        assert!(!args.contains("missing"));
        assert_eq!(args.len(), 2);
    }
}

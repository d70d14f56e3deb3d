//! Argument schema, normalized once at registration.
//!
//! Three JSON shapes are accepted for each entry and all become the same
//! [`ArgSpec`]:
//!
//! ```json
//! {
//!   "target": "user",
//!   "count":  ["int", 1],
//!   "text":   ["string", null, "rest"],
//!   "loud":   { "type": "boolean", "required": false, "default": false }
//! }
//! ```
//!
//! Entry order is the declaration order of the JSON object.

use std::{fmt, str::FromStr};

use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use serde_json::Value;

use super::args::ArgValue;
use crate::error::CommandError;

/// Argument types understood by the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgType {
    String,
    Int,
    Float,
    Boolean,
    /// A user tag, resolved through [`crate::UserFetch`].
    User,
    /// The repost attached to the invoking message.
    Repost,
}

impl ArgType {
    /// Name used in schemas.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::User => "user",
            Self::Repost => "repost",
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArgType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "user" => Ok(Self::User),
            "repost" => Ok(Self::Repost),
            other => Err(CommandError::UnknownArgumentType {
                kind: other.to_string(),
            }),
        }
    }
}

/// Canonical description of one argument.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgSpec {
    pub kind: ArgType,
    pub required: bool,
    /// Value used when an optional argument has no token. For `user`
    /// arguments this is a tag that is looked up like a typed one.
    pub default: Option<ArgValue>,
    /// Consume every remaining token, joined by single spaces.
    pub rest: bool,
}

impl ArgSpec {
    /// A required single-token argument.
    pub fn new(kind: ArgType) -> Self {
        Self {
            kind,
            required: true,
            default: None,
            rest: false,
        }
    }

    /// Make the argument optional without a default.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Make the argument optional with a default.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<ArgValue>) -> Self {
        self.required = false;
        self.default = Some(default.into());
        self
    }

    /// Consume all remaining tokens.
    #[must_use]
    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }

    fn from_raw(name: &str, raw: RawArgSpec) -> Result<Self, CommandError> {
        match raw {
            RawArgSpec::Bare(kind) => Ok(Self::new(kind.parse()?)),
            RawArgSpec::Tuple(items) => {
                let mut items = items.into_iter();
                let kind = match items.next() {
                    Some(Value::String(kind)) => kind.parse::<ArgType>()?,
                    _ => {
                        return Err(CommandError::schema(format!(
                            "{name}: tuple must start with a type name"
                        )));
                    }
                };
                let default = items.next().unwrap_or(Value::Null);
                let rest = match items.next() {
                    None | Some(Value::Null) => false,
                    Some(Value::String(flag)) if flag == "rest" => true,
                    Some(other) => {
                        return Err(CommandError::schema(format!(
                            "{name}: unexpected tuple flag {other}"
                        )));
                    }
                };
                if items.next().is_some() {
                    return Err(CommandError::schema(format!(
                        "{name}: tuple has more than three items"
                    )));
                }
                let default = ArgValue::from_default(name, kind, default)?;
                Ok(Self {
                    kind,
                    required: default.is_none(),
                    default,
                    rest,
                })
            }
            RawArgSpec::Object {
                kind,
                required,
                default,
                rest,
            } => {
                let kind = kind.parse::<ArgType>()?;
                let default = ArgValue::from_default(name, kind, default.unwrap_or(Value::Null))?;
                Ok(Self {
                    kind,
                    required: required.unwrap_or(default.is_none()),
                    default,
                    rest,
                })
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArgSpec {
    Bare(String),
    Tuple(Vec<Value>),
    Object {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        required: Option<bool>,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        rest: bool,
    },
}

/// Ordered argument schema of a command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgSchema {
    entries: Vec<(String, ArgSpec)>,
}

impl ArgSchema {
    /// A schema without arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument. A later entry with the same name replaces the
    /// earlier one in place.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, spec: ArgSpec) -> Self {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = spec,
            None => self.entries.push((name, spec)),
        }
        self
    }

    /// Parse and normalize a JSON schema object, keeping declaration order.
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        let raw: RawSchema =
            serde_json::from_str(json).map_err(|e| CommandError::schema(e.to_string()))?;
        let mut schema = Self::new();
        for (name, spec) in raw.0 {
            let spec = ArgSpec::from_raw(&name, spec)?;
            schema = schema.arg(name, spec);
        }
        Ok(schema)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgSpec)> {
        self.entries.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Look an entry up by name.
    pub fn get(&self, name: &str) -> Option<&ArgSpec> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RawSchema(Vec<(String, RawArgSpec)>);

impl<'de> Deserialize<'de> for RawSchema {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = RawSchema;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of argument names to argument specs")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, spec)) = map.next_entry::<String, RawArgSpec>()? {
                    entries.push((name, spec));
                }
                Ok(RawSchema(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_shapes_normalize_identically() {
        let bare = ArgSchema::from_json(r#"{"n": "int"}"#).expect("bare");
        let tuple = ArgSchema::from_json(r#"{"n": ["int"]}"#).expect("tuple");
        let object = ArgSchema::from_json(r#"{"n": {"type": "int"}}"#).expect("object");
        let typed = ArgSchema::new().arg("n", ArgSpec::new(ArgType::Int));

        assert_eq!(bare, typed);
        assert_eq!(tuple, typed);
        assert_eq!(object, typed);
    }

    #[test]
    fn test_optional_and_rest_shapes() {
        let schema = ArgSchema::from_json(
            r#"{
                "count": ["int", 3],
                "text": ["string", null, "rest"],
                "loud": {"type": "boolean", "required": false}
            }"#,
        )
        .expect("schema");

        assert_eq!(
            schema.get("count"),
            Some(&ArgSpec::new(ArgType::Int).with_default(3_i64))
        );
        assert_eq!(
            schema.get("text"),
            Some(&ArgSpec::new(ArgType::String).rest())
        );
        assert_eq!(
            schema.get("loud"),
            Some(&ArgSpec::new(ArgType::Boolean).optional())
        );
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let schema = ArgSchema::from_json(r#"{"zeta": "string", "alpha": "int", "mid": "float"}"#)
            .expect("schema");
        let names: Vec<&str> = schema.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ArgSchema::from_json(r#"{"x": "date"}"#).expect_err("unknown type");
        assert!(matches!(err, CommandError::UnknownArgumentType { ref kind } if kind == "date"));
    }

    #[test]
    fn test_default_must_match_type() {
        let err = ArgSchema::from_json(r#"{"n": ["int", "five"]}"#).expect_err("bad default");
        assert!(matches!(err, CommandError::InvalidSchema { .. }));
    }

    #[test]
    fn test_bad_tuple_flag_rejected() {
        let err = ArgSchema::from_json(r#"{"t": ["string", null, "all"]}"#).expect_err("flag");
        assert!(matches!(err, CommandError::InvalidSchema { .. }));
    }
}

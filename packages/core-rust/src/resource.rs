//! Resource identifiers: string addresses of host-resident objects.
//!
//! Two forms exist:
//!
//! - `Name` names a singleton service (created once, lives for the host
//!   process lifetime).
//! - `Name(args)` names a per-instance helper wrapping one underlying entity.
//!   `args` is the body of a JSON array, e.g. `AudioSource("mic-1")` or
//!   `SourceProperties("scene", 3)`.
//!
//! Identifiers are canonicalized on parse (arguments re-serialized in compact
//! JSON), so two identifiers compare equal iff they name the same object.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("valid regex"));

/// Errors produced while parsing a resource identifier string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceIdError {
    #[error("resource identifier is empty")]
    Empty,
    #[error("invalid service name: {0:?}")]
    InvalidName(String),
    #[error("unbalanced parentheses in resource identifier: {0:?}")]
    Unbalanced(String),
    #[error("constructor arguments are not valid JSON: {0}")]
    InvalidArgs(String),
}

/// A string uniquely naming a remote-addressable object.
///
/// Equality and hashing use only the canonical string form.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    canonical: String,
    name: String,
    args: Option<Vec<Value>>,
}

impl ResourceId {
    /// Identifier of a singleton service.
    ///
    /// # Errors
    ///
    /// Returns `ResourceIdError::InvalidName` if `name` does not match the
    /// identifier grammar.
    pub fn singleton(name: &str) -> Result<Self, ResourceIdError> {
        validate_name(name)?;
        Ok(Self {
            canonical: name.to_string(),
            name: name.to_string(),
            args: None,
        })
    }

    /// Identifier of a per-instance helper constructed from `args`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceIdError::InvalidName` if `name` does not match the
    /// identifier grammar.
    pub fn instance(name: &str, args: Vec<Value>) -> Result<Self, ResourceIdError> {
        validate_name(name)?;
        Ok(Self::instance_unchecked(name, args))
    }

    /// Instance identifier for a name already known to match the grammar.
    pub(crate) fn instance_unchecked(name: &str, args: Vec<Value>) -> Self {
        let canonical = format!("{name}({})", join_args(&args));
        Self {
            canonical,
            name: name.to_string(),
            args: Some(args),
        }
    }

    /// Parses and canonicalizes an identifier string.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceIdError` describing the first structural problem.
    pub fn parse(raw: &str) -> Result<Self, ResourceIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ResourceIdError::Empty);
        }

        let Some(open) = raw.find('(') else {
            if raw.contains(')') {
                return Err(ResourceIdError::Unbalanced(raw.to_string()));
            }
            return Self::singleton(raw);
        };

        if !raw.ends_with(')') {
            return Err(ResourceIdError::Unbalanced(raw.to_string()));
        }

        let name = &raw[..open];
        let body = &raw[open + 1..raw.len() - 1];
        validate_name(name)?;

        let args: Vec<Value> = serde_json::from_str(&format!("[{body}]"))
            .map_err(|e| ResourceIdError::InvalidArgs(e.to_string()))?;
        Self::instance(name, args)
    }

    /// Service name (the part before any constructor arguments).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Constructor arguments for per-instance identifiers, `None` for singletons.
    #[must_use]
    pub fn args(&self) -> Option<&[Value]> {
        self.args.as_deref()
    }

    /// Whether this identifier names a singleton.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.args.is_none()
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

fn validate_name(name: &str) -> Result<(), ResourceIdError> {
    if name.is_empty() {
        return Err(ResourceIdError::Empty);
    }
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ResourceIdError::InvalidName(name.to_string()))
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceId").field(&self.canonical).finish()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for ResourceId {
    type Err = ResourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ResourceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.canonical
    }
}

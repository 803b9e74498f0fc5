//! Typed variables exchanged between the host and the sandbox.
//!
//! A [`VariableStore`] is the only state a script can observe from the
//! host and the only state it can hand back. Steps declare up front which
//! names they touch; the engine marshals exactly those names across the
//! boundary before and after each script run.

use serde::{Deserialize, Serialize};
use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;

/// A value that can cross the host/sandbox boundary.
///
/// The exchange layer is deliberately narrow: 64-bit signed integers,
/// IEEE-754 doubles, and UTF-8 text. Every stored value carries exactly
/// one tag; integer-ness is preserved through the sandbox because the
/// interpreter distinguishes integers from floats natively.
///
/// # Example
///
/// ```
/// use opseq_types::VariableValue;
///
/// let v = VariableValue::Integer(42);
/// assert_eq!(v.as_integer(), Some(42));
/// assert_eq!(v.as_double(), None); // no silent coercion
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    /// 64-bit signed integer.
    Integer(i64),
    /// IEEE-754 double-precision float.
    Double(f64),
    /// UTF-8 string.
    Text(String),
}

impl VariableValue {
    /// Returns the integer payload, or `None` for other tags.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the double payload, or `None` for other tags.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the text payload, or `None` for other tags.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Error returned when a string is not a valid variable name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid variable name '{0}': names must match [A-Za-z_][A-Za-z0-9_]*")]
pub struct InvalidVariableName(pub String);

/// A validated variable identifier.
///
/// Names follow the identifier grammar `[A-Za-z_][A-Za-z0-9_]*` and are
/// case-sensitive. The grammar is a strict subset of what the sandbox
/// accepts as a global name, so every `VariableName` can be assigned to
/// directly without escaping.
///
/// # Example
///
/// ```
/// use opseq_types::VariableName;
///
/// assert!(VariableName::new("snake_case_2").is_ok());
/// assert!(VariableName::new("2leading").is_err());
/// assert!(VariableName::new("").is_err());
/// assert!(VariableName::new("with space").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableName(String);

impl VariableName {
    /// Creates a variable name, validating the identifier grammar.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidVariableName`] if the string is empty, starts
    /// with a digit, or contains characters outside `[A-Za-z0-9_]`.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidVariableName> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(InvalidVariableName(name))
        }
    }

    /// Checks a candidate string against the identifier grammar.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for VariableName {
    type Error = InvalidVariableName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for VariableName {
    type Error = InvalidVariableName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VariableName> for String {
    fn from(name: VariableName) -> Self {
        name.0
    }
}

impl AsRef<str> for VariableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A mapping from [`VariableName`] to [`VariableValue`].
///
/// Keys are unique and iteration order is unspecified. The store is owned
/// by the engine's `Context`; during execution it is mutated only between
/// steps, when declared variables are marshalled back out of the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableStore {
    variables: HashMap<VariableName, VariableValue>,
}

impl VariableStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a variable, returning the previous value.
    pub fn set(
        &mut self,
        name: VariableName,
        value: impl Into<VariableValue>,
    ) -> Option<VariableValue> {
        self.variables.insert(name, value.into())
    }

    /// Looks up a variable by name.
    #[must_use]
    pub fn get(&self, name: &VariableName) -> Option<&VariableValue> {
        self.variables.get(name)
    }

    /// Looks up a variable by raw string, without allocating a name.
    ///
    /// Convenient in tests and observers; invalid identifiers simply
    /// return `None`.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&VariableValue> {
        VariableName::new(name)
            .ok()
            .and_then(|n| self.variables.get(&n))
    }

    /// Removes a variable, returning its value if it was present.
    pub fn remove(&mut self, name: &VariableName) -> Option<VariableValue> {
        self.variables.remove(name)
    }

    /// Returns the number of stored variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Returns `true` if the store holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Iterates over `(name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&VariableName, &VariableValue)> {
        self.variables.iter()
    }
}

impl<'a> IntoIterator for &'a VariableStore {
    type Item = (&'a VariableName, &'a VariableValue);
    type IntoIter = hash_map::Iter<'a, VariableName, VariableValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.variables.iter()
    }
}

impl FromIterator<(VariableName, VariableValue)> for VariableStore {
    fn from_iter<T: IntoIterator<Item = (VariableName, VariableValue)>>(iter: T) -> Self {
        Self {
            variables: iter.into_iter().collect(),
        }
    }
}

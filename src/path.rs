//! Structured state paths.
//!
//! A state path is the key the server uses for every value in its tree, e.g.
//! `ScoreBoard.Game(0d1f...).Team(1).Skater(3c2a...).Name`. Each component is
//! a name with an optional parameter in parentheses:
//!
//! - `*` is a wildcard
//! - an integer is an index
//! - a UUID is an identifier
//! - anything containing a `.` is a compound parameter
//! - any other string is a plain name
//!
//! There is no escaping. Names and simple parameters never contain `.`, `(`
//! or `)`.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathComponent {
    Plain(String),
    Wildcard(String),
    Indexed(String, i64),
    Identified(String, Uuid),
    Named(String, String),
    /// A dotted parameter, kept as its separate parts so command names can be
    /// appended to it (see [`StatePath::child`]).
    Compound(String, Vec<String>),
}

impl PathComponent {
    /// Classify `name(param)`. An empty parameter yields a plain component.
    pub fn parse(name: &str, param: &str) -> Self {
        let name = name.to_owned();
        if param.is_empty() {
            Self::Plain(name)
        } else if param == "*" {
            Self::Wildcard(name)
        } else if let Ok(index) = param.parse::<i64>() {
            Self::Indexed(name, index)
        } else if let Ok(id) = Uuid::parse_str(param) {
            Self::Identified(name, id)
        } else if param.contains('.') {
            Self::Compound(name, param.split('.').map(str::to_owned).collect())
        } else {
            Self::Named(name, param.to_owned())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Plain(name)
            | Self::Wildcard(name)
            | Self::Indexed(name, _)
            | Self::Identified(name, _)
            | Self::Named(name, _)
            | Self::Compound(name, _) => name,
        }
    }

    /// The parameter as it appears between the parentheses.
    pub fn param(&self) -> Option<String> {
        match self {
            Self::Plain(_) => None,
            Self::Wildcard(_) => Some("*".to_owned()),
            Self::Indexed(_, index) => Some(index.to_string()),
            Self::Identified(_, id) => Some(id.to_string()),
            Self::Named(_, param) => Some(param.clone()),
            Self::Compound(_, parts) => Some(parts.join(".")),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard(_))
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.param() {
            Some(param) => write!(f, "{}({})", self.name(), param),
            None => f.write_str(self.name()),
        }
    }
}

/// An immutable, ordered sequence of [`PathComponent`]s.
///
/// Paths compare equal iff their components do, so `Game(ABC...)` and
/// `Game(abc...)` are the same key once parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatePath {
    components: Vec<PathComponent>,
}

impl StatePath {
    pub fn new(components: Vec<PathComponent>) -> Self {
        Self { components }
    }

    /// Parse a dotted path string. Parsing never fails; stray characters end
    /// up in names or parameters, and empty names are skipped.
    pub fn parse(s: &str) -> Self {
        let mut components = Vec::new();
        let mut name = String::new();
        let mut param = String::new();
        let mut in_param = false;

        fn flush(components: &mut Vec<PathComponent>, name: &mut String, param: &mut String) {
            if !name.is_empty() {
                components.push(PathComponent::parse(name, param));
            }
            name.clear();
            param.clear();
        }

        for c in s.chars() {
            if in_param {
                match c {
                    ')' => {
                        flush(&mut components, &mut name, &mut param);
                        in_param = false;
                    }
                    _ => param.push(c),
                }
            } else {
                match c {
                    '.' => flush(&mut components, &mut name, &mut param),
                    '(' => in_param = true,
                    _ => name.push(c),
                }
            }
        }
        flush(&mut components, &mut name, &mut param);

        Self { components }
    }

    pub fn components(&self) -> &[PathComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn last(&self) -> Option<&PathComponent> {
        self.components.last()
    }

    /// The path minus its last component (empty for an empty path).
    pub fn parent(&self) -> StatePath {
        let end = self.components.len().saturating_sub(1);
        Self::new(self.components[..end].to_vec())
    }

    pub fn adding(&self, component: PathComponent) -> StatePath {
        let mut components = self.components.clone();
        components.push(component);
        Self::new(components)
    }

    /// Append a plain name, or extend the parts of a trailing compound
    /// component. `Penalty(1.Code)` + `Delete` is `Penalty(1.Code.Delete)`.
    pub fn child(&self, name: &str) -> StatePath {
        let mut components = self.components.clone();
        match components.last_mut() {
            Some(PathComponent::Compound(_, parts)) => parts.push(name.to_owned()),
            _ => components.push(PathComponent::Plain(name.to_owned())),
        }
        Self::new(components)
    }

    pub fn has_prefix(&self, prefix: &StatePath) -> bool {
        self.components.starts_with(&prefix.components)
    }

    /// The components left after removing `parent` from the front, or `None`
    /// when `parent` is not a prefix.
    pub fn dropping(&self, parent: &StatePath) -> Option<&[PathComponent]> {
        self.components.strip_prefix(parent.components.as_slice())
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl FromStr for StatePath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for StatePath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Vec<PathComponent>> for StatePath {
    fn from(components: Vec<PathComponent>) -> Self {
        Self::new(components)
    }
}

impl Serialize for StatePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StatePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

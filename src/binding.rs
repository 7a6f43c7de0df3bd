//! Named references captured while matching and applying, and the `${...}`
//! substitution that reads them.
//!
//! A token is `${name}` or `${name.some.path}`. For a record binding the bare
//! form yields the record id and the path form reads one of its fields; for a
//! value binding the path walks into the value. A string consisting of exactly
//! one token is replaced by the bound value itself, keeping its JSON type; any
//! other string gets the textual form spliced in.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::path::{self, Path};
use crate::record::Record;

pub const RELATED: &str = "related";
pub const PARENT: &str = "parent";
pub const OLD: &str = "old";
pub const NEW: &str = "new";
pub const ENTRY: &str = "entry";

/// Every name a template may refer to.
pub const KNOWN_BINDINGS: [&str; 5] = [RELATED, PARENT, OLD, NEW, ENTRY];

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:\.([^}]+))?\}").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown binding '{0}'")]
    UnknownName(String),
    #[error("no '{0}' binding for this entry")]
    Unbound(String),
    #[error("'{path}' is absent in binding '{name}'")]
    MissingField { name: String, path: String },
    #[error("bad path in token '{0}'")]
    BadPath(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Record(Record),
    Value(Value),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    bound: BTreeMap<String, Bound>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn bind(&mut self, name: &str, bound: Bound) {
        self.bound.insert(name.to_string(), bound);
    }
    /// Keeps an existing binding, so the first match in evaluation order wins.
    pub fn bind_if_absent(&mut self, name: &str, bound: Bound) {
        self.bound.entry(name.to_string()).or_insert(bound);
    }
    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.bound.get(name)
    }
    pub fn related_id(&self) -> Option<&str> {
        match self.bound.get(RELATED) {
            Some(Bound::Record(record)) => Some(&record.id),
            _ => None,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
    /// Ids for record bindings, raw values otherwise.
    pub fn summary(&self) -> BTreeMap<String, Value> {
        self.bound
            .iter()
            .map(|(name, bound)| {
                let shown = match bound {
                    Bound::Record(record) => Value::String(record.id.clone()),
                    Bound::Value(value) => value.clone(),
                };
                (name.clone(), shown)
            })
            .collect()
    }

    pub fn resolve(&self, name: &str, path: Option<&Path>) -> Result<Value, TemplateError> {
        let missing = |path: &Path| TemplateError::MissingField {
            name: name.to_string(),
            path: path.to_string(),
        };
        match (self.bound.get(name), path) {
            (None, _) => Err(TemplateError::Unbound(name.to_string())),
            (Some(Bound::Record(record)), None) => Ok(Value::String(record.id.clone())),
            (Some(Bound::Record(record)), Some(path)) => record.get(path).ok_or_else(|| missing(path)),
            (Some(Bound::Value(value)), None) => Ok(value.clone()),
            (Some(Bound::Value(value)), Some(path)) => {
                path::get(value, path).cloned().ok_or_else(|| missing(path))
            }
        }
    }

    pub fn render_str(&self, text: &str) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(text.len());
        let mut last = 0;
        for captures in TOKEN.captures_iter(text) {
            let (whole, name, path) = token_parts(&captures)?;
            rendered.push_str(&text[last..whole.start()]);
            rendered.push_str(&path::stringify(&self.resolve(name, path.as_ref())?));
            last = whole.end();
        }
        rendered.push_str(&text[last..]);
        Ok(rendered)
    }

    pub fn render_value(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(text) => {
                if let Some(captures) = TOKEN.captures(text) {
                    let (whole, name, path) = token_parts(&captures)?;
                    if whole.start() == 0 && whole.end() == text.len() {
                        return self.resolve(name, path.as_ref());
                    }
                    return self.render_str(text).map(Value::String);
                }
                Ok(value.clone())
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::new();
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Serialize for Bindings {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.summary().serialize(serializer)
    }
}

fn token_parts<'t>(
    captures: &regex::Captures<'t>,
) -> Result<(regex::Match<'t>, &'t str, Option<Path>), TemplateError> {
    // group 0 and 1 always participate in a match
    let whole = captures.get(0).ok_or_else(|| TemplateError::BadPath(String::new()))?;
    let name = captures
        .get(1)
        .ok_or_else(|| TemplateError::BadPath(whole.as_str().to_string()))?
        .as_str();
    let path = match captures.get(2) {
        Some(path) => Some(
            path.as_str()
                .parse::<Path>()
                .map_err(|_| TemplateError::BadPath(whole.as_str().to_string()))?,
        ),
        None => None,
    };
    Ok((whole, name, path))
}

/// Rejects tokens naming an unknown binding or carrying a malformed path.
pub fn check_str(text: &str) -> Result<(), TemplateError> {
    for captures in TOKEN.captures_iter(text) {
        let (_, name, _) = token_parts(&captures)?;
        if !KNOWN_BINDINGS.contains(&name) {
            return Err(TemplateError::UnknownName(name.to_string()));
        }
    }
    Ok(())
}

pub fn check_value(value: &Value) -> Result<(), TemplateError> {
    match value {
        Value::String(text) => check_str(text),
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Object(map) => map.values().try_for_each(check_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.bind(
            RELATED,
            Bound::Record(Record::new("e2").with_fields(json!({"lexical_unit": {"en": "run"}, "rank": 3}))),
        );
        b.bind(OLD, Bound::Value(json!("verb")));
        b
    }

    #[test]
    fn whole_token_keeps_type() {
        let b = bindings();
        assert_eq!(b.render_value(&json!("${related.rank}")).unwrap(), json!(3));
        assert_eq!(b.render_value(&json!("${related}")).unwrap(), json!("e2"));
        assert_eq!(b.render_value(&json!("${related.id}")).unwrap(), json!("e2"));
    }

    #[test]
    fn embedded_tokens_are_spliced() {
        let b = bindings();
        assert_eq!(
            b.render_str("was ${old}, see ${related.lexical_unit.en}").unwrap(),
            "was verb, see run"
        );
        assert_eq!(
            b.render_value(&json!({"note": ["rank ${related.rank}"]})).unwrap(),
            json!({"note": ["rank 3"]})
        );
    }

    #[test]
    fn unbound_and_missing_fail() {
        let b = bindings();
        assert_eq!(
            b.render_str("${parent.id}"),
            Err(TemplateError::Unbound("parent".into()))
        );
        assert!(matches!(
            b.render_value(&json!("${related.nope}")),
            Err(TemplateError::MissingField { .. })
        ));
    }

    #[test]
    fn check_rejects_unknown_names() {
        assert!(check_str("${related.id} and ${entry}").is_ok());
        assert_eq!(
            check_str("${cousin.id}"),
            Err(TemplateError::UnknownName("cousin".into()))
        );
        assert!(check_value(&json!({"a": ["${bad..path}"]})).is_err());
        assert!(check_str("no tokens at all").is_ok());
    }

    #[test]
    fn first_binding_wins() {
        let mut b = Bindings::new();
        b.bind_if_absent(RELATED, Bound::Record(Record::new("a")));
        b.bind_if_absent(RELATED, Bound::Record(Record::new("b")));
        assert_eq!(b.related_id(), Some("a"));
    }
}

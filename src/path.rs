//! Addressing into the nested value tree of a record.
//!
//! A [`Path`] is a sequence of [`Segment`]s parsed once from strings such as
//! `senses.0.examples.1.text` or `senses[0].gloss`. Pure-digit segments index
//! lists, every other segment indexes a map.
//!
//! Reads are forgiving: anything missing along the way yields `None`. Writes
//! create intermediate containers on demand and extend short lists with empty
//! map placeholders, so a bulk edit can reach `examples.3` on an entry that
//! only has one example. Only walking *through* a scalar, or addressing a map
//! with an index (and vice versa), is an error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed path '{0}'")]
    Malformed(String),
    #[error("cannot step into '{at}' of path '{path}': expected a {expected}")]
    TypeMismatch {
        path: String,
        at: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn parse(text: &str, whole: &str) -> Result<Self, PathError> {
        if text.bytes().all(|b| b.is_ascii_digit()) {
            text.parse::<usize>()
                .map(Segment::Index)
                .map_err(|_| PathError::Malformed(whole.to_string()))
        } else {
            Ok(Segment::Key(text.to_string()))
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{}", key),
            Segment::Index(index) => write!(f, "{}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    pub fn new(segments: Vec<Segment>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::Malformed(String::new()));
        }
        Ok(Self { segments })
    }
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    /// The largest list index the path addresses, if any.
    pub fn max_index(&self) -> Option<usize> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Index(index) => Some(*index),
                Segment::Key(_) => None,
            })
            .max()
    }
    /// The first segment when it is a key, used to special-case `id`.
    pub fn head_key(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Key(key)) => Some(key),
            _ => None,
        }
    }
    fn prefix(&self, len: usize) -> String {
        Path {
            segments: self.segments[..len].to_vec(),
        }
        .to_string()
    }
    fn mismatch(&self, len: usize, expected: &'static str) -> PathError {
        PathError::TypeMismatch {
            path: self.to_string(),
            at: self.prefix(len),
            expected,
        }
    }
}

impl FromStr for Path {
    type Err = PathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PathError::Malformed(s.to_string());
        let mut segments = Vec::new();
        for part in s.split('.') {
            let (head, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if head.is_empty() && rest.is_empty() {
                return Err(malformed());
            }
            if !head.is_empty() {
                if head.contains(']') {
                    return Err(malformed());
                }
                segments.push(Segment::parse(head, s)?);
            }
            // bracketed indices: senses[0][1]
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(malformed)?;
                if !rest.starts_with('[') || close < 2 {
                    return Err(malformed());
                }
                let index = rest[1..close].parse::<usize>().map_err(|_| malformed())?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
            }
        }
        Path::new(segments).map_err(|_| malformed())
    }
}

impl TryFrom<String> for Path {
    type Error = PathError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

/// Reads the value at `path`, or `None` when any step is missing.
pub fn get<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = match (segment, node) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(index), Value::Array(list)) => list.get(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Writes `value` at `path` and returns whatever was there before.
pub fn set(root: &mut Value, path: &Path, value: Value) -> Result<Option<Value>, PathError> {
    let last = path.segments().len() - 1;
    let mut node = root;
    for (i, segment) in path.segments().iter().enumerate() {
        match segment {
            Segment::Key(key) => {
                if node.is_null() {
                    *node = Value::Object(Map::new());
                }
                let map = match node.as_object_mut() {
                    Some(map) => map,
                    None => return Err(path.mismatch(i, "map")),
                };
                if i == last {
                    return Ok(map.insert(key.clone(), value));
                }
                node = map.entry(key.clone()).or_insert(Value::Null);
            }
            Segment::Index(index) => {
                if node.is_null() {
                    *node = Value::Array(Vec::new());
                }
                let list = match node.as_array_mut() {
                    Some(list) => list,
                    None => return Err(path.mismatch(i, "list")),
                };
                while list.len() < *index {
                    list.push(Value::Object(Map::new()));
                }
                if i == last {
                    if list.len() == *index {
                        list.push(value);
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::replace(&mut list[*index], value)));
                }
                if list.len() == *index {
                    list.push(Value::Null);
                }
                node = &mut list[*index];
            }
        }
    }
    unreachable!("paths always hold at least one segment")
}

/// Removes the leaf at `path`, returning it. Parents are left in place even
/// when they become empty. A missing leaf is not an error.
pub fn clear(root: &mut Value, path: &Path) -> Result<Option<Value>, PathError> {
    let (leaf, parents) = match path.segments().split_last() {
        Some(split) => split,
        None => return Ok(None),
    };
    let mut node = root;
    for (i, segment) in parents.iter().enumerate() {
        node = match (segment, node) {
            (Segment::Key(key), Value::Object(map)) => match map.get_mut(key) {
                Some(child) => child,
                None => return Ok(None),
            },
            (Segment::Index(index), Value::Array(list)) => match list.get_mut(*index) {
                Some(child) => child,
                None => return Ok(None),
            },
            (_, Value::Null) => return Ok(None),
            (Segment::Key(_), _) => return Err(path.mismatch(i, "map")),
            (Segment::Index(_), _) => return Err(path.mismatch(i, "list")),
        };
    }
    let depth = parents.len();
    match (leaf, node) {
        (Segment::Key(key), Value::Object(map)) => Ok(map.remove(key)),
        (Segment::Index(index), Value::Array(list)) => {
            if *index < list.len() {
                Ok(Some(list.remove(*index)))
            } else {
                Ok(None)
            }
        }
        (_, Value::Null) => Ok(None),
        (Segment::Key(_), _) => Err(path.mismatch(depth, "map")),
        (Segment::Index(_), _) => Err(path.mismatch(depth, "list")),
    }
}

/// Absent, null, empty strings and empty containers all count as empty.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(list)) => list.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// The textual form used by substring, regex and template operations.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numbers, and strings that parse as numbers.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Path {
        s.parse().expect("valid path")
    }

    #[test]
    fn parses_dotted_and_bracketed_forms() {
        assert_eq!(p("senses.0.gloss"), p("senses[0].gloss"));
        assert_eq!(
            p("a[1][2]").segments(),
            &[Segment::Key("a".into()), Segment::Index(1), Segment::Index(2)]
        );
        assert_eq!(p("senses[0].gloss").to_string(), "senses.0.gloss");
        assert_eq!(p("senses.3.examples.12.text").max_index(), Some(12));
        assert_eq!(p("lexical_unit.en").max_index(), None);
        for bad in ["", "a..b", "a.", "a[x]", "a[]", "a[1", "a]b"] {
            assert!(bad.parse::<Path>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn get_missing_is_absent() {
        let v = json!({"senses": [{"gloss": "x"}]});
        assert_eq!(get(&v, &p("senses.0.gloss")), Some(&json!("x")));
        assert_eq!(get(&v, &p("senses.3.gloss")), None);
        assert_eq!(get(&v, &p("lexical_unit.en")), None);
        assert_eq!(get(&v, &p("senses.gloss")), None);
    }

    #[test]
    fn set_extends_lists_with_placeholders() {
        let mut v = json!({});
        assert_eq!(set(&mut v, &p("examples.2.text"), json!("hi")), Ok(None));
        assert_eq!(v, json!({"examples": [{}, {}, {"text": "hi"}]}));
        let old = set(&mut v, &p("examples.2.text"), json!("bye")).unwrap();
        assert_eq!(old, Some(json!("hi")));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut v = json!({"a": "text"});
        assert!(matches!(
            set(&mut v, &p("a.b"), json!(1)),
            Err(PathError::TypeMismatch { .. })
        ));
        assert!(set(&mut v, &p("a.0"), json!(1)).is_err());
    }

    #[test]
    fn clear_keeps_empty_parents() {
        let mut v = json!({"grammatical_info": {"trait": "verb"}});
        let old = clear(&mut v, &p("grammatical_info.trait")).unwrap();
        assert_eq!(old, Some(json!("verb")));
        assert_eq!(v, json!({"grammatical_info": {}}));
        assert_eq!(clear(&mut v, &p("grammatical_info.trait")), Ok(None));
        assert_eq!(clear(&mut v, &p("nothing.here")), Ok(None));
    }

    #[test]
    fn emptiness_rule() {
        assert!(is_empty(None));
        assert!(is_empty(Some(&json!(""))));
        assert!(is_empty(Some(&json!([]))));
        assert!(is_empty(Some(&json!({}))));
        assert!(!is_empty(Some(&json!(0))));
        assert!(!is_empty(Some(&json!("run"))));
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::path::{self, Path, PathError};

// ------------- Relation -------------
/// A typed, directed edge from a record (or one of its senses) to another
/// record. The target is not required to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub traits: BTreeMap<String, String>,
}

impl Relation {
    pub fn new(kind: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target_id: target_id.into(),
            traits: BTreeMap::new(),
        }
    }
    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.insert(name.into(), value.into());
        self
    }
    pub fn matches(&self, kind: &str, target_id: &str) -> bool {
        self.kind == kind && self.target_id == target_id
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.kind, self.target_id)
    }
}

// ------------- Record -------------
/// One lexical entry: a tree of fields plus its relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default = "empty_fields")]
    pub fields: Value,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

fn empty_fields() -> Value {
    Value::Object(Map::new())
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: empty_fields(),
            relations: Vec::new(),
        }
    }
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }
    /// Reads a field. A bare `id` that is not a stored field resolves to the
    /// record identity so conditions and templates can address it.
    pub fn get(&self, path: &Path) -> Option<Value> {
        match path::get(&self.fields, path) {
            Some(value) => Some(value.clone()),
            None if path.segments().len() == 1 && path.head_key() == Some("id") => {
                Some(Value::String(self.id.clone()))
            }
            None => None,
        }
    }
    pub fn set(&mut self, path: &Path, value: Value) -> Result<Option<Value>, PathError> {
        path::set(&mut self.fields, path, value)
    }
    pub fn clear(&mut self, path: &Path) -> Result<Option<Value>, PathError> {
        path::clear(&mut self.fields, path)
    }
    /// Record-level relations first, then those held by each sense under
    /// `senses.N.relations`, in sense order.
    pub fn relations_of(&self) -> Vec<Relation> {
        let mut all = self.relations.clone();
        if let Some(Value::Array(senses)) = self.fields.get("senses") {
            for sense in senses {
                if let Some(Value::Array(relations)) = sense.get("relations") {
                    all.extend(
                        relations
                            .iter()
                            .filter_map(|r| serde_json::from_value::<Relation>(r.clone()).ok()),
                    );
                }
            }
        }
        all
    }
    /// Position of a record-level relation identical to `relation`.
    pub fn position_of(&self, relation: &Relation) -> Option<usize> {
        self.relations.iter().position(|r| r == relation)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.id, self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_is_addressable() {
        let record = Record::new("e1").with_fields(json!({"lexical_unit": {"en": "run"}}));
        assert_eq!(record.get(&"id".parse().unwrap()), Some(json!("e1")));
        assert_eq!(
            record.get(&"lexical_unit.en".parse().unwrap()),
            Some(json!("run"))
        );
    }

    #[test]
    fn sense_relations_follow_entry_relations() {
        let record = Record::new("e1")
            .with_relation(Relation::new("synonym", "e2"))
            .with_fields(json!({
                "senses": [
                    {"relations": [{"type": "antonym", "target_id": "e3"}]},
                    {"gloss": "no relations here"},
                    {"relations": [{"type": "synonym", "target_id": "e4", "traits": {"weight": "1"}}]}
                ]
            }));
        let targets: Vec<String> = record
            .relations_of()
            .into_iter()
            .map(|r| r.target_id)
            .collect();
        assert_eq!(targets, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn relation_json_shape() {
        let relation: Relation =
            serde_json::from_value(json!({"type": "see_also", "target_id": "x"})).unwrap();
        assert_eq!(relation, Relation::new("see_also", "x"));
        assert_eq!(
            serde_json::to_value(&relation).unwrap(),
            json!({"type": "see_also", "target_id": "x"})
        );
    }
}

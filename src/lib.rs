//! Lexbulk – a bulk curation engine for dictionary records.
//!
//! A bulk request pairs a *condition* with a list of *actions*. The engine
//! finds every record the condition selects and applies the actions to each
//! of them, one record at a time:
//! * A [`record::Record`] is a JSON document (`fields`) with an id and a list of
//!   typed [`record::Relation`]s to other records.
//! * A [`path::Path`] addresses a value inside the fields (`senses[0].gloss`).
//! * A [`condition::Condition`] is a tree of field tests, relational tests that
//!   follow relations to other records, and `and`/`or`/`not` combinators.
//! * An [`action::Action`] changes one record: set, clear, append or prepend a
//!   field, add, remove or replace a relation, copy a field from a related
//!   record, or run a pipeline of further actions.
//! * Actions may refer to what the condition matched through `${name.path}`
//!   templates, resolved against the [`binding::Bindings`] of the match.
//!
//! ## Execution
//! The [`executor::Executor`] runs in two passes. Pass 1 scans the store in
//! ascending id order and keeps the matches. Pass 2 reloads each match, applies
//! the actions to a working copy and writes the copy back only when every
//! action succeeded. Failures stay per record; the run always completes and
//! reports a [`request::BulkResult`]. Dry runs compute the same diffs without
//! writing anything.
//!
//! ## Storage
//! Anything implementing [`store::RecordStore`] can be curated. The crate ships
//! an in-memory [`store::MemoryStore`] and the SQLite backed
//! [`persist::SqliteStore`].
//!
//! ## Quick Start
//! ```
//! use lexbulk::{action::Action, condition::{Condition, Op}, executor::Executor};
//! use lexbulk::{record::Record, request::BulkRequest, store::MemoryStore};
//! use serde_json::json;
//! let store = MemoryStore::with_records(vec![
//!     Record::new("e1").with_fields(json!({"grammatical_info": {"trait": "verb"}})),
//! ]);
//! let request = BulkRequest::new(
//!     Condition::field("grammatical_info.trait", Op::Equals, Some(json!("verb"))).unwrap(),
//!     vec![Action::Set { path: "grammatical_info.trait".parse().unwrap(), value: json!("noun") }],
//! );
//! let result = Executor::new(&store).execute(&request).unwrap();
//! assert_eq!(result.succeeded, 1);
//! ```
//!
//! The binary wraps an [`interface::BulkInterface`] in the HTTP routes of the
//! [`server`] module.

pub mod action;
pub mod binding;
pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod interface;
pub mod path;
pub mod persist;
pub mod record;
pub mod request;
pub mod server;
pub mod store;

pub use error::{BulkError, Result};

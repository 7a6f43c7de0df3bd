// used for persistence
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::record::{Record, Relation};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

/// Records kept as JSON documents in SQLite, one row per record. Every write
/// bumps the row revision so external tools can spot concurrent edits.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(mode: PersistenceMode) -> Result<Self, StoreError> {
        let connection = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists Record (
                Record_Identity text not null,
                Fields text not null,
                Relations text not null,
                Revision integer not null default 1,
                constraint referenceable_Record_Identity primary key (
                    Record_Identity
                )
            );-- STRICT;
            ",
        )?;
        info!(?mode, "record store opened");
        Ok(Self {
            db: Mutex::new(connection),
        })
    }
    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }
    /// Number of writes a record has seen, `None` when it is not stored.
    pub fn revision(&self, id: &str) -> Result<Option<i64>, StoreError> {
        let db = self.connection()?;
        let mut statement = db.prepare_cached(
            "
            select Revision from Record where Record_Identity = ?
            ",
        )?;
        Ok(statement.query_row(params![id], |row| row.get(0)).optional()?)
    }
    pub fn len(&self) -> Result<usize, StoreError> {
        let db = self.connection()?;
        let count: i64 = db.query_row("select count(*) from Record", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let db = self.connection()?;
        let mut statement = db.prepare_cached(
            "
            select Fields, Relations from Record where Record_Identity = ?
            ",
        )?;
        let row: Option<(String, String)> = statement
            .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((fields, relations)) = row else {
            return Ok(None);
        };
        let corrupt = |e: serde_json::Error| StoreError::Corrupt {
            id: id.to_string(),
            message: e.to_string(),
        };
        Ok(Some(Record {
            id: id.to_string(),
            fields: serde_json::from_str(&fields).map_err(corrupt)?,
            relations: serde_json::from_str::<Vec<Relation>>(&relations).map_err(corrupt)?,
        }))
    }
    fn put(&self, record: &Record) -> Result<(), StoreError> {
        let encode = |e: serde_json::Error| StoreError::Backend(e.to_string());
        let fields = serde_json::to_string(&record.fields).map_err(encode)?;
        let relations = serde_json::to_string(&record.relations).map_err(encode)?;
        let db = self.connection()?;
        let mut statement = db.prepare_cached(
            "
            insert into Record (
                Record_Identity,
                Fields,
                Relations
            ) values (?, ?, ?)
            on conflict (Record_Identity) do update set
                Fields = excluded.Fields,
                Relations = excluded.Relations,
                Revision = Revision + 1
            ",
        )?;
        statement.execute(params![&record.id, &fields, &relations])?;
        Ok(())
    }
    fn scan(&self) -> Result<Vec<String>, StoreError> {
        let db = self.connection()?;
        let mut statement = db.prepare_cached(
            "
            select Record_Identity from Record order by Record_Identity
            ",
        )?;
        let ids = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn documents_round_trip_and_count_revisions() {
        let store = SqliteStore::open(PersistenceMode::InMemory).unwrap();
        let record = Record::new("e1")
            .with_fields(json!({"lexical_unit": {"en": "run"}, "senses": [{"gloss": "move fast"}]}))
            .with_relation(Relation::new("synonym", "e2").with_trait("weight", "1"));
        store.put(&record).unwrap();
        assert_eq!(store.get("e1").unwrap(), Some(record.clone()));
        assert_eq!(store.revision("e1").unwrap(), Some(1));
        store.put(&record).unwrap();
        assert_eq!(store.revision("e1").unwrap(), Some(2));
        assert_eq!(store.get("nope").unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn scan_orders_by_id() {
        let store = SqliteStore::open(PersistenceMode::InMemory).unwrap();
        for id in ["m", "a", "z"] {
            store.put(&Record::new(id)).unwrap();
        }
        assert_eq!(store.scan().unwrap(), vec!["a", "m", "z"]);
    }
}

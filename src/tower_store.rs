//! `tower-sessions` integration.
//!
//! Records are stored as `{"cookie": {"expires": <RFC 3339>}, "data": {...}}`,
//! the same shape other session middleware writes, so the expiry column and
//! the sweep work the same way for every host.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_sessions::{session::Id, session::Record, session_store, ExpiredDeletion, SessionStore};

use crate::error::Error;
use crate::store::SqlSessionStore;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    cookie: StoredCookie,
    data: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct StoredCookie {
    expires: String,
}

impl StoredRecord {
    fn from_record(record: &Record) -> session_store::Result<Self> {
        let expires = record
            .expiry_date
            .format(&Rfc3339)
            .map_err(|e| session_store::Error::Encode(e.to_string()))?;
        Ok(Self {
            cookie: StoredCookie { expires },
            data: record.data.clone(),
        })
    }

    fn into_record(self, id: Id) -> session_store::Result<Record> {
        let expiry_date = OffsetDateTime::parse(&self.cookie.expires, &Rfc3339)
            .map_err(|e| session_store::Error::Decode(e.to_string()))?;
        Ok(Record {
            id,
            data: self.data,
            expiry_date,
        })
    }
}

fn encode_error(err: Error) -> session_store::Error {
    match err {
        Error::Serialization(msg) => session_store::Error::Encode(msg),
        other => session_store::Error::Backend(other.to_string()),
    }
}

fn decode_error(err: Error) -> session_store::Error {
    match err {
        Error::Serialization(_) | Error::Integrity(_) => session_store::Error::Decode(err.to_string()),
        other => session_store::Error::Backend(other.to_string()),
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    /// Creates a new session record in the database.
    ///
    /// If a live row already uses the record's ID, a new ID is generated until
    /// an unused one is found.
    ///
    /// # Error Mapping
    ///
    /// * Serialization errors → `session_store::Error::Encode`
    /// * Everything else → `session_store::Error::Backend`
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        // Session ID collision mitigation
        while self
            .exists(&record.id.to_string())
            .await
            .map_err(encode_error)?
        {
            record.id = Id::default();
        }

        self.save(record).await
    }

    /// Saves a session record, inserting or replacing its row.
    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let stored = StoredRecord::from_record(record)?;
        self.set(&record.id.to_string(), &stored)
            .await
            .map_err(encode_error)
    }

    /// Loads a session record by ID.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Record))` - The session was found and successfully loaded.
    /// * `Ok(None)` - No session was found with the given ID or the session has expired.
    /// * `Err(session_store::Error::Decode)` - The stored payload is malformed or failed its integrity check.
    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        let stored: Option<StoredRecord> =
            self.get_live(&session_id.to_string()).await.map_err(decode_error)?;

        match stored {
            Some(stored) => Ok(Some(stored.into_record(*session_id)?)),
            None => Ok(None),
        }
    }

    /// Deletes a session record by ID. Deleting an unknown ID succeeds.
    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.destroy(&session_id.to_string())
            .await
            .map_err(|e| session_store::Error::Backend(e.to_string()))
    }
}

#[async_trait]
impl ExpiredDeletion for SqlSessionStore {
    /// Deletes all expired session records from the database.
    ///
    /// The session layer can run this periodically:
    ///
    /// ```no_run
    /// use seaorm_session_store::{ExpiredDeletion, SqlSessionStore};
    ///
    /// # async fn example(store: SqlSessionStore) {
    /// tokio::spawn(store.clone().continuously_delete_expired(tokio::time::Duration::from_secs(3600)));
    /// # }
    /// ```
    async fn delete_expired(&self) -> session_store::Result<()> {
        self.sweep()
            .await
            .map(|_| ())
            .map_err(|e| session_store::Error::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_stored_record_round_trip() {
        let record = Record {
            id: Id::default(),
            data: HashMap::from([("user".to_string(), serde_json::json!("alice"))]),
            expiry_date: OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap(),
        };

        let stored = StoredRecord::from_record(&record).unwrap();
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["cookie"]["expires"], "2030-03-17T17:46:40Z");
        assert_eq!(crate::store::cookie_expires(&json).unwrap(), 1_900_000_000);

        let back = stored.into_record(record.id).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.data, record.data);
        assert_eq!(back.expiry_date, record.expiry_date);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            encode_error(Error::serialization("bad")),
            session_store::Error::Encode(_)
        ));
        assert!(matches!(
            decode_error(Error::integrity("bad tag")),
            session_store::Error::Decode(_)
        ));
        assert!(matches!(
            decode_error(Error::configuration("x")),
            session_store::Error::Backend(_)
        ));
    }

    #[test]
    fn test_fractional_expiry_survives() {
        let expiry = OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap() + Duration::milliseconds(250);
        let record = Record {
            id: Id::default(),
            data: HashMap::new(),
            expiry_date: expiry,
        };
        let back = StoredRecord::from_record(&record)
            .unwrap()
            .into_record(record.id)
            .unwrap();
        assert_eq!(back.expiry_date, expiry);
    }
}

//! Local store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::error::StoreError;
use crate::directory::CustomerRecord;

/// Fixed key of the sync marker row.
const LAST_SYNC_KEY: &str = "lastSync";

/// Separator between fields in the search column; never typed by users.
const SEARCH_FIELD_SEPARATOR: &str = "\u{1f}";

/// Durable storage for cached customers and the sync marker.
///
/// All calls are synchronous; the connection sits behind a mutex.
pub trait LocalStore: Send + Sync {
  /// Capability probe. Safe to call before `init`.
  fn is_available(&self) -> bool;

  /// Open or create the schema. Idempotent.
  fn init(&self) -> Result<(), StoreError>;

  /// Replace every stored customer with `records` and advance the sync
  /// marker. Records are stored as given, so `get_all` returns them
  /// unchanged. Returns the new marker.
  fn store_all(&self, records: &[CustomerRecord]) -> Result<DateTime<Utc>, StoreError>;

  /// Insert or replace one customer by id. Leaves the sync marker alone.
  fn upsert(&self, record: &CustomerRecord) -> Result<(), StoreError>;

  fn get_all(&self) -> Result<Vec<CustomerRecord>, StoreError>;

  fn get_by_id(&self, id: &str) -> Result<Option<CustomerRecord>, StoreError>;

  /// Case-insensitive substring match over name, phone, whatsapp, house
  /// number and address. A blank query returns everything.
  fn search_local(&self, query: &str) -> Result<Vec<CustomerRecord>, StoreError>;

  /// Patch the balance of an existing customer and stamp it with the current
  /// time. Returns the stamp, or `None` when no such customer is stored.
  fn update_balance(&self, id: &str, balance: f64) -> Result<Option<DateTime<Utc>>, StoreError>;

  fn get_last_sync(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

  fn count(&self) -> Result<usize, StoreError>;
}

/// Store used when no persistent storage exists.
/// `init` reports the store as unavailable; everything else is empty.
pub struct NoopStore;

impl LocalStore for NoopStore {
  fn is_available(&self) -> bool {
    false
  }

  fn init(&self) -> Result<(), StoreError> {
    Err(StoreError::Unavailable("caching is disabled".to_string()))
  }

  fn store_all(&self, _records: &[CustomerRecord]) -> Result<DateTime<Utc>, StoreError> {
    Ok(Utc::now()) // Discard
  }

  fn upsert(&self, _record: &CustomerRecord) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn get_all(&self) -> Result<Vec<CustomerRecord>, StoreError> {
    Ok(Vec::new())
  }

  fn get_by_id(&self, _id: &str) -> Result<Option<CustomerRecord>, StoreError> {
    Ok(None) // Always miss
  }

  fn search_local(&self, _query: &str) -> Result<Vec<CustomerRecord>, StoreError> {
    Ok(Vec::new())
  }

  fn update_balance(&self, _id: &str, _balance: f64) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(None)
  }

  fn get_last_sync(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(None)
  }

  fn count(&self) -> Result<usize, StoreError> {
    Ok(0)
  }
}

/// Where a SQLite store keeps its database.
#[derive(Debug, Clone)]
enum Location {
  File(PathBuf),
  #[cfg(test)]
  Memory,
  /// No data directory could be determined.
  Unresolved,
}

/// SQLite-based customer store. The connection is opened by `init`.
pub struct SqliteStore {
  location: Location,
  conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
  /// Store at the default per-user location.
  pub fn open_default() -> Self {
    match Self::default_path() {
      Some(path) => Self::at(path),
      None => Self::with_location(Location::Unresolved),
    }
  }

  /// Store backed by the database file at `path`.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self::with_location(Location::File(path.into()))
  }

  /// Store that lives only as long as the process.
  #[cfg(test)]
  pub fn in_memory() -> Self {
    Self::with_location(Location::Memory)
  }

  fn with_location(location: Location) -> Self {
    Self {
      location,
      conn: Mutex::new(None),
    }
  }

  /// Get the default database path.
  fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("crmcache").join("cache.db"))
  }

  /// The database file, if this store is file-backed.
  pub fn path(&self) -> Option<&Path> {
    match &self.location {
      Location::File(path) => Some(path.as_path()),
      _ => None,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }

  /// Run `f` against the open connection.
  fn with_conn<T>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
  ) -> Result<T, StoreError> {
    let mut guard = self.lock()?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| StoreError::Unavailable("store has not been initialised".to_string()))?;
    f(conn)
  }

  fn connect(&self) -> Result<Connection, StoreError> {
    match &self.location {
      #[cfg(test)]
      Location::Memory => Ok(Connection::open_in_memory()?),
      Location::Unresolved => Err(StoreError::Unavailable(
        "could not determine data directory".to_string(),
      )),
      Location::File(path) => {
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Unavailable(format!("failed to create cache directory: {}", e))
          })?;
        }
        Connection::open(path).map_err(|e| {
          StoreError::Unavailable(format!("failed to open cache database at {}: {}", path.display(), e))
        })
      }
    }
  }
}

/// Schema for the customer cache.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    phone TEXT NOT NULL,
    whatsapp TEXT,
    house_no TEXT,
    -- lowercased searchable fields joined by U+001F
    search_text TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_customers_name ON customers(name);
CREATE INDEX IF NOT EXISTS idx_customers_phone ON customers(phone);
CREATE INDEX IF NOT EXISTS idx_customers_whatsapp ON customers(whatsapp);
CREATE INDEX IF NOT EXISTS idx_customers_house_no ON customers(house_no);

CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

const UPSERT_CUSTOMER: &str = "INSERT INTO customers (id, name, phone, whatsapp, house_no, search_text, data)
   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
   ON CONFLICT(id) DO UPDATE SET
     name = excluded.name,
     phone = excluded.phone,
     whatsapp = excluded.whatsapp,
     house_no = excluded.house_no,
     search_text = excluded.search_text,
     data = excluded.data";

fn search_text(record: &CustomerRecord) -> String {
  record
    .search_fields()
    .iter()
    .flatten()
    .map(|field| field.to_lowercase())
    .collect::<Vec<_>>()
    .join(SEARCH_FIELD_SEPARATOR)
}

fn write_customer(conn: &Connection, record: &CustomerRecord) -> Result<(), StoreError> {
  let data = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
    id: record.id.clone(),
    source,
  })?;
  conn.execute(
    UPSERT_CUSTOMER,
    params![
      record.id,
      record.name,
      record.phone,
      record.whatsapp,
      record.house_no,
      search_text(record),
      data
    ],
  )?;
  Ok(())
}

fn decode(id: &str, data: &[u8]) -> Result<CustomerRecord, StoreError> {
  serde_json::from_slice(data).map_err(|source| StoreError::Corrupt {
    id: id.to_string(),
    source,
  })
}

/// Run a row query returning `(id, data)` pairs and decode them.
/// Unreadable rows are skipped so one bad row cannot hide the rest.
fn query_customers(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<CustomerRecord>, StoreError> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;

  let mut customers = Vec::new();
  for row in rows {
    let (id, data) = row?;
    match decode(&id, &data) {
      Ok(record) => customers.push(record),
      Err(e) => warn!(error = %e, "Skipping unreadable cached customer"),
    }
  }
  Ok(customers)
}

impl LocalStore for SqliteStore {
  fn is_available(&self) -> bool {
    match &self.location {
      #[cfg(test)]
      Location::Memory => true,
      Location::Unresolved => false,
      Location::File(path) => match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
          parent.is_dir() || std::fs::create_dir_all(parent).is_ok()
        }
        _ => true,
      },
    }
  }

  fn init(&self) -> Result<(), StoreError> {
    let mut guard = self.lock()?;
    if guard.is_some() {
      return Ok(());
    }

    let conn = self.connect()?;
    conn.execute_batch(CACHE_SCHEMA)?;
    debug!(location = ?self.location, "Customer store ready");
    *guard = Some(conn);
    Ok(())
  }

  fn store_all(&self, records: &[CustomerRecord]) -> Result<DateTime<Utc>, StoreError> {
    self.with_conn(|conn| {
      let now = Utc::now();
      let tx = conn.transaction()?;
      tx.execute("DELETE FROM customers", [])?;
      for record in records {
        write_customer(&tx, record)?;
      }
      // The marker never moves backwards, even if the clock does.
      tx.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = max(value, excluded.value)",
        params![LAST_SYNC_KEY, now.timestamp_millis()],
      )?;
      let marker: i64 = tx.query_row(
        "SELECT value FROM sync_meta WHERE key = ?1",
        params![LAST_SYNC_KEY],
        |row| row.get(0),
      )?;
      tx.commit()?;
      Ok(DateTime::from_timestamp_millis(marker).unwrap_or(now))
    })
  }

  fn upsert(&self, record: &CustomerRecord) -> Result<(), StoreError> {
    self.with_conn(|conn| write_customer(conn, record))
  }

  fn get_all(&self) -> Result<Vec<CustomerRecord>, StoreError> {
    self.with_conn(|conn| query_customers(conn, "SELECT id, data FROM customers ORDER BY rowid", []))
  }

  fn get_by_id(&self, id: &str) -> Result<Option<CustomerRecord>, StoreError> {
    self.with_conn(|conn| {
      let data: Option<Vec<u8>> = conn
        .query_row(
          "SELECT data FROM customers WHERE id = ?1",
          params![id],
          |row| row.get(0),
        )
        .optional()?;
      data.map(|data| decode(id, &data)).transpose()
    })
  }

  fn search_local(&self, query: &str) -> Result<Vec<CustomerRecord>, StoreError> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
      return self.get_all();
    }
    self.with_conn(|conn| {
      query_customers(
        conn,
        "SELECT id, data FROM customers WHERE instr(search_text, ?1) > 0 ORDER BY rowid",
        params![needle],
      )
    })
  }

  fn update_balance(&self, id: &str, balance: f64) -> Result<Option<DateTime<Utc>>, StoreError> {
    self.with_conn(|conn| {
      let data: Option<Vec<u8>> = conn
        .query_row(
          "SELECT data FROM customers WHERE id = ?1",
          params![id],
          |row| row.get(0),
        )
        .optional()?;
      let Some(data) = data else {
        return Ok(None);
      };

      let now = Utc::now();
      let mut record = decode(id, &data)?;
      record.current_balance = Some(balance);
      record.balance_last_updated = Some(now);
      let data = serde_json::to_vec(&record).map_err(|source| StoreError::Corrupt {
        id: id.to_string(),
        source,
      })?;
      conn.execute(
        "UPDATE customers SET data = ?1 WHERE id = ?2",
        params![data, id],
      )?;
      Ok(Some(now))
    })
  }

  fn get_last_sync(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
    self.with_conn(|conn| {
      let millis: Option<i64> = conn
        .query_row(
          "SELECT value FROM sync_meta WHERE key = ?1",
          params![LAST_SYNC_KEY],
          |row| row.get(0),
        )
        .optional()?;
      Ok(millis.and_then(DateTime::from_timestamp_millis))
    })
  }

  fn count(&self) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))?;
      Ok(usize::try_from(count).unwrap_or(0))
    })
  }
}

#[cfg(test)]
impl SqliteStore {
  /// Move the sync marker, ignoring monotonicity.
  pub(crate) fn backdate_last_sync(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![LAST_SYNC_KEY, at.timestamp_millis()],
      )?;
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> SqliteStore {
    let store = SqliteStore::in_memory();
    store.init().unwrap();
    store
  }

  fn customer(id: &str, name: &str, phone: &str) -> CustomerRecord {
    CustomerRecord::new(id, name, phone)
  }

  #[test]
  fn test_store_all_round_trip() {
    let store = store();
    let records = vec![
      customer("c1", "John Carter", "0300-111"),
      customer("c2", "Amina Khan", "0300-222"),
      customer("c3", "Bilal Ahmed", "0300-333"),
    ];

    store.store_all(&records).unwrap();

    assert_eq!(store.get_all().unwrap(), records);
    assert_eq!(store.count().unwrap(), 3);
    assert!(store.get_last_sync().unwrap().is_some());
  }

  #[test]
  fn test_store_all_replaces_previous_snapshot() {
    let store = store();
    store
      .store_all(&[customer("old", "Old One", "1"), customer("keep", "Keep", "2")])
      .unwrap();

    let mut fresh = customer("keep", "Keep Renamed", "2");
    fresh.current_balance = Some(500.0);
    fresh.balance_last_updated = Some(Utc::now());
    store.store_all(&[fresh.clone()]).unwrap();

    assert_eq!(store.get_all().unwrap(), vec![fresh]);
    assert!(store.get_by_id("old").unwrap().is_none());
  }

  #[test]
  fn test_upsert_overwrites_instead_of_duplicating() {
    let store = store();
    let mut record = customer("c1", "Ann", "111");
    store.upsert(&record).unwrap();
    assert_eq!(store.get_by_id("c1").unwrap(), Some(record.clone()));

    record.phone = "999".to_string();
    store.upsert(&record).unwrap();

    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.get_by_id("c1").unwrap().unwrap().phone, "999");
    assert!(store.get_last_sync().unwrap().is_none());
  }

  #[test]
  fn test_search_local_matches_fields_case_insensitively() {
    let store = store();
    let mut a = customer("a", "John Carter", "0300-111");
    a.address = Some("Model Town".to_string());
    let mut b = customer("b", "Amina", "0321-222");
    b.whatsapp = Some("0345-777".to_string());
    b.house_no = Some("H-42".to_string());
    store.store_all(&[a, b]).unwrap();

    assert_eq!(store.search_local("JOHN").unwrap()[0].id, "a");
    assert_eq!(store.search_local("model town").unwrap()[0].id, "a");
    assert_eq!(store.search_local("777").unwrap()[0].id, "b");
    assert_eq!(store.search_local("h-42").unwrap()[0].id, "b");
    assert_eq!(store.search_local("0300").unwrap().len(), 1);
    assert_eq!(store.search_local("   ").unwrap().len(), 2);
    assert!(store.search_local("nobody").unwrap().is_empty());
  }

  #[test]
  fn test_search_local_does_not_match_across_fields() {
    let store = store();
    store.upsert(&customer("a", "ali", "123")).unwrap();
    assert!(store.search_local("ali123").unwrap().is_empty());
  }

  #[test]
  fn test_update_balance_patches_existing_only() {
    let store = store();
    store.upsert(&customer("c1", "Ann", "111")).unwrap();

    let stamp = store.update_balance("c1", 75.5).unwrap();
    assert!(stamp.is_some());
    let record = store.get_by_id("c1").unwrap().unwrap();
    assert_eq!(record.current_balance, Some(75.5));
    assert_eq!(record.balance_last_updated, stamp);

    assert_eq!(store.update_balance("missing", 10.0).unwrap(), None);
    assert!(store.get_by_id("missing").unwrap().is_none());
  }

  #[test]
  fn test_last_sync_never_moves_backwards() {
    let store = store();
    let first = store.store_all(&[]).unwrap();
    let future = first + chrono::Duration::hours(1);
    store.backdate_last_sync(future).unwrap();

    let second = store.store_all(&[]).unwrap();
    assert_eq!(second.timestamp_millis(), future.timestamp_millis());
  }

  #[test]
  fn test_init_is_idempotent() {
    let store = store();
    store.upsert(&customer("c1", "Ann", "111")).unwrap();
    store.init().unwrap();
    assert_eq!(store.count().unwrap(), 1);
  }

  #[test]
  fn test_operations_before_init_are_unavailable() {
    let store = SqliteStore::in_memory();
    assert!(store.is_available());
    assert!(matches!(store.get_all(), Err(StoreError::Unavailable(_))));
  }

  #[test]
  fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqliteStore::at(&path);
      assert!(store.is_available());
      store.init().unwrap();
      store.store_all(&[customer("c1", "Ann", "111")]).unwrap();
    }

    let reopened = SqliteStore::at(&path);
    reopened.init().unwrap();
    assert_eq!(reopened.get_all().unwrap().len(), 1);
    assert!(reopened.get_last_sync().unwrap().is_some());
    assert_eq!(reopened.path(), Some(path.as_path()));
  }

  #[test]
  fn test_noop_store_is_unavailable() {
    let store = NoopStore;
    assert!(!store.is_available());
    assert!(matches!(store.init(), Err(StoreError::Unavailable(_))));
    assert!(store.get_all().unwrap().is_empty());
    assert!(store.get_last_sync().unwrap().is_none());
  }
}

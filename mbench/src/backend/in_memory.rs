use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    backend::{BackendError, Connection, ConnectionFactory, Transaction},
    record::Record,
};

#[derive(Debug, Default)]
struct Store {
    num_columns: RwLock<Option<usize>>,
    rows: RwLock<HashMap<i64, Record>>,
}

fn poisoned<T>(_: T) -> BackendError {
    BackendError::Unavailable("in-memory store lock poisoned".to_owned())
}

impl Store {
    fn rows(&self) -> Result<RwLockReadGuard<'_, HashMap<i64, Record>>, BackendError> {
        self.rows.read().map_err(poisoned)
    }

    fn rows_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<i64, Record>>, BackendError> {
        self.rows.write().map_err(poisoned)
    }

    fn num_columns(&self) -> Result<usize, BackendError> {
        self.num_columns
            .read()
            .map_err(poisoned)?
            .ok_or(BackendError::NoSchema)
    }
}

/// Process-local backend. Every connection opened from one factory sees the same rows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Store>,
    connections: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many connections have been opened so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn row_count(&self) -> Result<usize, BackendError> {
        Ok(self.store.rows()?.len())
    }

    pub fn row(&self, key: i64) -> Result<Option<Record>, BackendError> {
        Ok(self.store.rows()?.get(&key).cloned())
    }
}

impl ConnectionFactory for InMemoryBackend {
    type Connection = InMemoryConnection;

    fn connect(&self) -> Result<Self::Connection, BackendError> {
        let id = self.connections.fetch_add(1, Ordering::AcqRel);

        Ok(InMemoryConnection {
            id,
            store: self.store.clone(),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryConnection {
    id: usize,
    store: Arc<Store>,
}

impl InMemoryConnection {
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }
}

impl Connection for InMemoryConnection {
    type Transaction<'connection> = InMemoryTransaction<'connection>;

    fn start_transaction(&mut self) -> Result<Self::Transaction<'_>, BackendError> {
        Ok(InMemoryTransaction {
            store: &self.store,
            num_columns: self.store.num_columns()?,
            staged: BTreeMap::new(),
        })
    }

    /// Replaces the schema and drops every existing row.
    fn create_schema(&mut self, num_columns: i32) -> Result<(), BackendError> {
        let columns = usize::try_from(num_columns)
            .ok()
            .filter(|columns| *columns > 0)
            .ok_or(BackendError::InvalidColumnCount(num_columns))?;

        let mut schema = self.store.num_columns.write().map_err(poisoned)?;
        self.store.rows_mut()?.clear();
        *schema = Some(columns);

        Ok(())
    }
}

/// Writes are staged in the transaction and published together on commit.
/// Conflicting writes of concurrent transactions are not detected, the last
/// commit wins.
#[derive(Debug)]
pub struct InMemoryTransaction<'connection> {
    store: &'connection Store,
    num_columns: usize,
    // None marks a staged removal
    staged: BTreeMap<i64, Option<Record>>,
}

impl InMemoryTransaction<'_> {
    fn visible(&self, key: i64) -> Result<Option<Record>, BackendError> {
        match self.staged.get(&key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.store.rows()?.get(&key).cloned()),
        }
    }

    fn exists(&self, key: i64) -> Result<bool, BackendError> {
        match self.staged.get(&key) {
            Some(staged) => Ok(staged.is_some()),
            None => Ok(self.store.rows()?.contains_key(&key)),
        }
    }

    fn check_arity(&self, record: &Record) -> Result<(), BackendError> {
        if record.arity() == self.num_columns {
            Ok(())
        } else {
            Err(BackendError::SchemaMismatch {
                expected: self.num_columns,
                actual: record.arity(),
            })
        }
    }
}

impl Transaction for InMemoryTransaction<'_> {
    fn insert(&mut self, key: i64, record: &Record) -> Result<(), BackendError> {
        self.check_arity(record)?;
        if self.exists(key)? {
            return Err(BackendError::DuplicateKey(key));
        }

        self.staged.insert(key, Some(record.clone()));

        Ok(())
    }

    fn update(&mut self, key: i64, record: &Record) -> Result<(), BackendError> {
        self.check_arity(record)?;
        let mut row = self.visible(key)?.ok_or(BackendError::KeyNotFound(key))?;

        row.apply_update(record)
            .map_err(|_| BackendError::SchemaMismatch {
                expected: self.num_columns,
                actual: record.arity(),
            })?;
        self.staged.insert(key, Some(row));

        Ok(())
    }

    fn remove(&mut self, key: i64) -> Result<(), BackendError> {
        if !self.exists(key)? {
            return Err(BackendError::KeyNotFound(key));
        }

        self.staged.insert(key, None);

        Ok(())
    }

    fn get(&mut self, key: i64) -> Result<(), BackendError> {
        if self.exists(key)? {
            Ok(())
        } else {
            Err(BackendError::KeyNotFound(key))
        }
    }

    fn query1(&mut self) -> Result<i64, BackendError> {
        let rows = self.store.rows()?;
        let committed = i64::try_from(rows.len()).unwrap_or(i64::MAX);

        let delta: i64 = self
            .staged
            .iter()
            .map(|(key, staged)| match (rows.contains_key(key), staged.is_some()) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            })
            .sum();

        Ok(committed + delta)
    }

    fn commit(self) -> Result<(), BackendError> {
        let mut rows = self.store.rows_mut()?;

        for (key, staged) in self.staged {
            match staged {
                Some(record) => {
                    rows.insert(key, record);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::value::TypedValue;

    fn connection(num_columns: i32) -> (InMemoryBackend, InMemoryConnection) {
        let backend = InMemoryBackend::new();
        let mut connection = backend.connect().unwrap();
        connection.create_schema(num_columns).unwrap();

        (backend, connection)
    }

    fn row(seed: u64) -> Record {
        Record::random_insert(&mut StdRng::seed_from_u64(seed), 10)
    }

    #[test]
    fn transactions_need_a_schema() {
        let backend = InMemoryBackend::new();
        let mut connection = backend.connect().unwrap();

        assert_eq!(
            connection.start_transaction().err(),
            Some(BackendError::NoSchema)
        );
    }

    #[test]
    fn non_positive_column_count_is_rejected() {
        let backend = InMemoryBackend::new();
        let mut connection = backend.connect().unwrap();

        assert_eq!(
            connection.create_schema(0),
            Err(BackendError::InvalidColumnCount(0))
        );
        assert_eq!(
            connection.create_schema(-3),
            Err(BackendError::InvalidColumnCount(-3))
        );
    }

    #[test]
    fn committed_rows_are_visible_to_other_connections() {
        let (backend, mut connection) = connection(10);

        let mut transaction = connection.start_transaction().unwrap();
        transaction.insert(1, &row(1)).unwrap();
        transaction.insert(2, &row(2)).unwrap();
        transaction.commit().unwrap();

        let mut other = backend.connect().unwrap();
        let mut transaction = other.start_transaction().unwrap();
        assert_eq!(transaction.get(1), Ok(()));
        assert_eq!(transaction.query1(), Ok(2));
        assert_eq!(backend.row(2).unwrap(), Some(row(2)));
    }

    #[test]
    fn uncommitted_writes_are_discarded() {
        let (backend, mut connection) = connection(10);

        {
            let mut transaction = connection.start_transaction().unwrap();
            transaction.insert(1, &row(1)).unwrap();
            assert_eq!(transaction.query1(), Ok(1));
        }

        assert_eq!(backend.row_count().unwrap(), 0);
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let (backend, mut connection) = connection(10);

        let mut transaction = connection.start_transaction().unwrap();
        transaction.insert(7, &row(7)).unwrap();
        assert_eq!(transaction.insert(7, &row(8)), Err(BackendError::DuplicateKey(7)));
        transaction.remove(7).unwrap();
        assert_eq!(transaction.get(7), Err(BackendError::KeyNotFound(7)));
        transaction.insert(7, &row(9)).unwrap();
        transaction.commit().unwrap();

        assert_eq!(backend.row(7).unwrap(), Some(row(9)));
    }

    #[test]
    fn missing_keys_fail() {
        let (_, mut connection) = connection(10);
        let mut transaction = connection.start_transaction().unwrap();

        assert_eq!(transaction.get(3), Err(BackendError::KeyNotFound(3)));
        assert_eq!(transaction.remove(3), Err(BackendError::KeyNotFound(3)));
        assert_eq!(
            transaction.update(3, &Record::new(10)),
            Err(BackendError::KeyNotFound(3))
        );
    }

    #[test]
    fn update_merges_set_fields() {
        let (backend, mut connection) = connection(10);
        let mut transaction = connection.start_transaction().unwrap();
        transaction.insert(1, &row(1)).unwrap();

        let mut update = Record::new(10);
        update.set_field(4, TypedValue::Short(200)).unwrap();
        transaction.update(1, &update).unwrap();
        transaction.commit().unwrap();

        let stored = backend.row(1).unwrap().unwrap();
        assert_eq!(stored.get(4), Some(&TypedValue::Short(200)));
        assert_eq!(stored.get(0), row(1).get(0));
    }

    #[test]
    fn records_must_match_the_schema() {
        let (_, mut connection) = connection(20);
        let mut transaction = connection.start_transaction().unwrap();

        assert_eq!(
            transaction.insert(1, &row(1)),
            Err(BackendError::SchemaMismatch {
                expected: 20,
                actual: 10
            })
        );
    }

    #[test]
    fn recreating_the_schema_drops_rows() {
        let (backend, mut connection) = connection(10);
        let mut transaction = connection.start_transaction().unwrap();
        transaction.insert(1, &row(1)).unwrap();
        transaction.commit().unwrap();

        connection.create_schema(10).unwrap();

        assert_eq!(backend.row_count().unwrap(), 0);
    }

    #[test]
    fn connections_are_counted() {
        let backend = InMemoryBackend::new();
        let first = backend.connect().unwrap();
        let second = backend.connect().unwrap();

        assert_eq!(backend.connection_count(), 2);
        assert_ne!(first.id(), second.id());
    }
}

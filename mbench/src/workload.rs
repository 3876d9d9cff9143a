//! Batch planning.
//!
//! Each client owns the residue class `clientId mod numClients` of the key
//! space. Inserts, deletes, updates and gets planned for one client only ever
//! target keys of that class, so concurrently benchmarking clients never
//! collide without any locking on the server. The watermarks
//! (`base_insert_key`, `base_delete_key`) belong to the client: the server
//! hands back the advanced pair and the client sends it with its next batch.

use rand::Rng;
use thiserror::Error;

use crate::{backend::Transaction, record::Record};

#[derive(Debug, Error, PartialEq)]
pub enum WorkloadError {
    #[error(
        "invalid operation mix: insert={insert:e} delete={delete:e} update={update:e} leaves no room for gets"
    )]
    InvalidProbabilities { insert: f64, delete: f64, update: f64 },
    #[error("client id {client_id} is outside of [0, {num_clients})")]
    InvalidClient { client_id: i32, num_clients: i64 },
    #[error("operation count {0} is negative")]
    NegativeOperationCount(i32),
    #[error("key range [{start}, {end}) is inverted")]
    InvalidKeyRange { start: i64, end: i64 },
    #[error("key space exhausted")]
    KeySpaceExhausted,
    #[error("{what} {requested} is over the limit of {limit}")]
    OverLimit {
        what: &'static str,
        requested: u64,
        limit: u64,
    },
}

/// Upper bounds on what a single command may ask the server to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_ops: usize,
    pub max_populate_rows: usize,
    pub max_columns: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_ops: 100_000,
            max_populate_rows: 1_000_000,
            max_columns: 256,
        }
    }
}

fn within(what: &'static str, requested: u64, limit: usize) -> Result<(), WorkloadError> {
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);

    if requested > limit {
        return Err(WorkloadError::OverLimit {
            what,
            requested,
            limit,
        });
    }

    Ok(())
}

impl Limits {
    pub fn check_batch(&self, params: &BatchParams) -> Result<(), WorkloadError> {
        // negative counts are reported by `BatchParams::validate`
        let Ok(num_ops) = u64::try_from(params.num_ops) else {
            return Ok(());
        };

        within("operation count", num_ops, self.max_ops)
    }

    pub fn check_populate(&self, start: i64, end: i64) -> Result<(), WorkloadError> {
        if end < start {
            return Err(WorkloadError::InvalidKeyRange { start, end });
        }

        // the span of [i64::MIN, i64::MAX) does not fit into an i64
        let rows = end.abs_diff(start);
        within("populate row count", rows, self.max_populate_rows)
    }

    pub fn check_columns(&self, num_columns: usize) -> Result<(), WorkloadError> {
        within(
            "column count",
            u64::try_from(num_columns).unwrap_or(u64::MAX),
            self.max_columns,
        )
    }
}

/// Arguments of one `BatchOp` command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchParams {
    pub num_ops: i32,
    pub insert_prob: f64,
    pub delete_prob: f64,
    pub update_prob: f64,
    pub client_id: i32,
    pub num_clients: i64,
    pub base_insert_key: i64,
    pub base_delete_key: i64,
}

impl BatchParams {
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.num_ops < 0 {
            return Err(WorkloadError::NegativeOperationCount(self.num_ops));
        }

        let probabilities = [self.insert_prob, self.delete_prob, self.update_prob];
        // the order of the subtractions matters for inputs such as 0.4/0.3/0.3
        let get_prob = 1.0 - self.insert_prob - self.delete_prob - self.update_prob;
        if probabilities.iter().any(|p| p.is_nan() || *p < 0.0) || get_prob.is_nan() || get_prob < 0.0
        {
            return Err(WorkloadError::InvalidProbabilities {
                insert: self.insert_prob,
                delete: self.delete_prob,
                update: self.update_prob,
            });
        }

        if self.num_clients < 1 || self.client_id < 0 || i64::from(self.client_id) >= self.num_clients
        {
            return Err(WorkloadError::InvalidClient {
                client_id: self.client_id,
                num_clients: self.num_clients,
            });
        }

        if self.base_insert_key.checked_add(self.num_clients).is_none() {
            return Err(WorkloadError::KeySpaceExhausted);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert { key: i64, record: Record },
    Update { key: i64, record: Record },
    Delete { key: i64 },
    Get { key: i64 },
}

impl Operation {
    #[must_use]
    pub const fn key(&self) -> i64 {
        match self {
            Self::Insert { key, .. }
            | Self::Update { key, .. }
            | Self::Delete { key }
            | Self::Get { key } => *key,
        }
    }

    fn apply<T: Transaction>(&self, transaction: &mut T) -> bool {
        let result = match self {
            Self::Insert { key, record } => transaction.insert(*key, record),
            Self::Update { key, record } => transaction.update(*key, record),
            Self::Delete { key } => transaction.remove(*key),
            Self::Get { key } => transaction.get(*key),
        };

        if let Err(error) = &result {
            log::debug!("operation on key {} failed: {error}", self.key());
        }

        result.is_ok()
    }
}

/// Planned operations in the order they were drawn, plus the watermarks the
/// client has to send with its next batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub operations: Vec<Operation>,
    pub base_insert_key: i64,
    pub base_delete_key: i64,
}

impl BatchPlan {
    pub fn inserts(&self) -> impl Iterator<Item = (i64, &Record)> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Insert { key, record } => Some((*key, record)),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = (i64, &Record)> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Update { key, record } => Some((*key, record)),
            _ => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = i64> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Delete { key } => Some(*key),
            _ => None,
        })
    }

    pub fn gets(&self) -> impl Iterator<Item = i64> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Get { key } => Some(*key),
            _ => None,
        })
    }

    /// Runs every operation through `transaction` and returns how many succeeded.
    pub fn apply<T: Transaction>(&self, transaction: &mut T) -> usize {
        self.operations
            .iter()
            .filter(|op| op.apply(transaction))
            .count()
    }
}

/// Rounds `key` down to a multiple of `num_clients` and moves it into the client's class.
const fn residue_key(key: i64, num_clients: i64, client_id: i64) -> i64 {
    key - key.rem_euclid(num_clients) + client_id
}

/// Picks a random live key of the client's residue class out of
/// `[base_delete_key, base_insert_key)`. The range must not be empty.
pub fn rnd_key<R: Rng + ?Sized>(
    rng: &mut R,
    base_insert_key: i64,
    base_delete_key: i64,
    num_clients: i64,
    client_id: i64,
) -> i64 {
    debug_assert!(base_delete_key < base_insert_key);

    let key = residue_key(
        rng.random_range(base_delete_key..base_insert_key),
        num_clients,
        client_id,
    );

    if key >= base_insert_key {
        key.saturating_sub(num_clients)
    } else if key < base_delete_key {
        key.saturating_add(num_clients)
    } else {
        key
    }
}

pub fn plan_batch<R: Rng + ?Sized>(
    rng: &mut R,
    params: &BatchParams,
    num_columns: usize,
) -> Result<BatchPlan, WorkloadError> {
    params.validate()?;

    let BatchParams {
        num_ops,
        insert_prob,
        delete_prob,
        update_prob,
        client_id,
        num_clients,
        mut base_insert_key,
        mut base_delete_key,
    } = *params;
    let client_id = i64::from(client_id);

    // keeps one client stride of headroom so aligning the new key cannot overflow
    let advance = |key: i64| {
        key.checked_add(num_clients)
            .filter(|next| next.checked_add(num_clients).is_some())
            .ok_or(WorkloadError::KeySpaceExhausted)
    };

    let mut operations = Vec::with_capacity(usize::try_from(num_ops).unwrap_or_default());
    for _ in 0..num_ops {
        let draw: f64 = rng.random();
        let has_live_keys = base_delete_key < base_insert_key;

        let operation = if draw < insert_prob {
            None
        } else if draw < insert_prob + update_prob {
            has_live_keys.then(|| Operation::Update {
                key: rnd_key(rng, base_insert_key, base_delete_key, num_clients, client_id),
                record: Record::random_update(rng, num_columns),
            })
        } else if draw < insert_prob + update_prob + delete_prob {
            // nothing left to delete once the delete watermark would reach the insert one
            (base_delete_key.saturating_add(num_clients) < base_insert_key).then(|| {
                let key = residue_key(base_delete_key, num_clients, client_id);
                base_delete_key += num_clients;
                Operation::Delete { key }
            })
        } else {
            has_live_keys.then(|| Operation::Get {
                key: rnd_key(rng, base_insert_key, base_delete_key, num_clients, client_id),
            })
        };

        let operation = match operation {
            Some(operation) => operation,
            None => {
                base_insert_key = advance(base_insert_key)?;
                Operation::Insert {
                    key: residue_key(base_insert_key, num_clients, client_id),
                    record: Record::random_insert(rng, num_columns),
                }
            }
        };

        operations.push(operation);
    }

    Ok(BatchPlan {
        operations,
        base_insert_key,
        base_delete_key,
    })
}

/// Fresh rows for every key of `[start, end)`.
pub fn plan_populate<R: Rng + ?Sized>(
    rng: &mut R,
    start: i64,
    end: i64,
    num_columns: usize,
) -> Result<Vec<(i64, Record)>, WorkloadError> {
    if end < start {
        return Err(WorkloadError::InvalidKeyRange { start, end });
    }

    Ok((start..end)
        .map(|key| (key, Record::random_insert(rng, num_columns)))
        .collect())
}

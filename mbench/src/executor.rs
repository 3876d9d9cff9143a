use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use log::{debug, warn};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    backend::{Connection, Transaction},
    protocol::{Command, Response},
    value::TypedValue,
    workload::{BatchParams, Limits, plan_batch, plan_populate},
};

fn elapsed_nanos(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// A failed response shaped for `command`, used when no result could be computed.
#[must_use]
pub fn failed(command: &Command, message: impl Into<String>) -> Response {
    let response = Response::failure(message, 0);

    match command {
        Command::BatchOp(params) => response.with_extra(watermarks(
            params.base_insert_key,
            params.base_delete_key,
        )),
        _ => response,
    }
}

fn watermarks(base_insert_key: i64, base_delete_key: i64) -> Vec<TypedValue> {
    vec![
        TypedValue::Long(base_insert_key),
        TypedValue::Long(base_delete_key),
    ]
}

/// Runs commands against one backend connection.
pub struct Executor<C: Connection> {
    connection: C,
    num_columns: Arc<AtomicUsize>,
    limits: Limits,
    rng: StdRng,
}

impl<C: Connection> Executor<C> {
    pub fn new(connection: C, num_columns: Arc<AtomicUsize>, limits: Limits) -> Self {
        Self::with_rng(
            connection,
            num_columns,
            limits,
            StdRng::from_rng(&mut rand::rng()),
        )
    }

    pub const fn with_rng(
        connection: C,
        num_columns: Arc<AtomicUsize>,
        limits: Limits,
        rng: StdRng,
    ) -> Self {
        Self {
            connection,
            num_columns,
            limits,
            rng,
        }
    }

    pub fn execute(&mut self, command: &Command) -> Response {
        debug!("executing {}", command.kind());

        match command {
            Command::CreateSchema { num_columns } => self.create_schema(*num_columns),
            Command::Populate { start, end } => self.populate(*start, *end),
            Command::BatchOp(params) => self.batch_op(params),
            Command::Query1 => self.query1(),
            Command::Query2 | Command::Query3 => Response::not_implemented(command.kind()),
            Command::Disconnect => failed(command, "Disconnect is not executed"),
        }
    }

    fn create_schema(&mut self, num_columns: i32) -> Response {
        let start = Instant::now();

        let Some(columns) = usize::try_from(num_columns).ok().filter(|c| *c > 0) else {
            return Response::failure(format!("invalid column count {num_columns}"), 0);
        };
        if let Err(error) = self.limits.check_columns(columns) {
            return Response::failure(error.to_string(), 0);
        }

        match self.connection.create_schema(num_columns) {
            Ok(()) => {
                self.num_columns.store(columns, Ordering::Release);
                Response::success(elapsed_nanos(start))
            }
            Err(error) => {
                warn!("creating a schema of {num_columns} columns failed: {error}");
                Response::failure(error.to_string(), elapsed_nanos(start))
            }
        }
    }

    fn populate(&mut self, start_key: i64, end_key: i64) -> Response {
        if let Err(error) = self.limits.check_populate(start_key, end_key) {
            return Response::failure(error.to_string(), 0);
        }

        let num_columns = self.num_columns.load(Ordering::Acquire);
        let rows = match plan_populate(&mut self.rng, start_key, end_key, num_columns) {
            Ok(rows) => rows,
            Err(error) => return Response::failure(error.to_string(), 0),
        };

        let start = Instant::now();
        let (succeeded, committed) = match self.connection.start_transaction() {
            Ok(mut transaction) => {
                let succeeded = rows
                    .iter()
                    .filter(|(key, record)| transaction.insert(*key, record).is_ok())
                    .count();

                (succeeded, commit(transaction))
            }
            Err(error) => {
                warn!("populate could not start a transaction: {error}");
                (0, false)
            }
        };
        let elapsed = elapsed_nanos(start);

        if committed && succeeded == rows.len() {
            Response::success(elapsed)
        } else {
            Response::failure(format!("ERROR:suc={succeeded}/{}", rows.len()), elapsed)
        }
    }

    fn batch_op(&mut self, params: &BatchParams) -> Response {
        if let Err(error) = self.limits.check_batch(params) {
            return failed(&Command::BatchOp(*params), error.to_string());
        }

        let num_columns = self.num_columns.load(Ordering::Acquire);
        let plan = match plan_batch(&mut self.rng, params, num_columns) {
            Ok(plan) => plan,
            Err(error) => {
                return failed(&Command::BatchOp(*params), error.to_string());
            }
        };

        let start = Instant::now();
        let (succeeded, committed) = match self.connection.start_transaction() {
            Ok(mut transaction) => {
                let succeeded = plan.apply(&mut transaction);
                (succeeded, commit(transaction))
            }
            Err(error) => {
                warn!("batch could not start a transaction: {error}");
                (0, false)
            }
        };
        let elapsed = elapsed_nanos(start);

        let response = if committed && succeeded == plan.operations.len() {
            Response::success(elapsed)
        } else {
            Response::failure(
                format!("ERROR:suc={succeeded}/{}", plan.operations.len()),
                elapsed,
            )
        };

        response.with_extra(watermarks(plan.base_insert_key, plan.base_delete_key))
    }

    fn query1(&mut self) -> Response {
        let start = Instant::now();

        let mut transaction = match self.connection.start_transaction() {
            Ok(transaction) => transaction,
            Err(error) => return Response::failure(error.to_string(), elapsed_nanos(start)),
        };
        let tuples = match transaction.query1() {
            Ok(tuples) => tuples,
            Err(error) => return Response::failure(error.to_string(), elapsed_nanos(start)),
        };
        let committed = commit(transaction);
        let elapsed = elapsed_nanos(start);

        if committed {
            Response::success(elapsed)
        } else {
            Response::failure(format!("ERROR:nTup={tuples}"), elapsed)
        }
    }
}

fn commit<T: Transaction>(transaction: T) -> bool {
    match transaction.commit() {
        Ok(()) => true,
        Err(error) => {
            warn!("commit failed: {error}");
            false
        }
    }
}

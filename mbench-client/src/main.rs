use std::{
    process::ExitCode,
    sync::Barrier,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use mbench::{
    client::{Client, ClientError},
    protocol::CommandKind,
    workload::BatchParams,
};
use rand::{Rng, rng};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(about = "Drives a benchmark server with concurrent clients")]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:8713")]
    address: String,
    /// Concurrent clients, each one works on its own residue class of keys
    #[arg(short, long, default_value_t = 4)]
    clients: i32,
    /// Keys populated before the batches start, `[0, keys)`
    #[arg(short, long, default_value_t = 10_000)]
    keys: i64,
    #[arg(short, long, default_value_t = 100)]
    batches: usize,
    #[arg(short, long, default_value_t = 100)]
    ops: i32,
    #[arg(long, default_value_t = 0.4)]
    insert_prob: f64,
    #[arg(long, default_value_t = 0.3)]
    delete_prob: f64,
    #[arg(long, default_value_t = 0.2)]
    update_prob: f64,
    #[arg(short, long, default_value_t = 10)]
    num_columns: i32,
    /// Upper bound of a random pause between two batches of one client
    #[arg(long, default_value_t = 0)]
    think_time_ms: u64,
    /// Run the three queries once the batches are done
    #[arg(long)]
    queries: bool,
}

#[derive(Debug, Default)]
struct ClientReport {
    latencies: Vec<Duration>,
    server_nanos: Vec<i64>,
    failures: usize,
}

/// Highest key below `keys` in the residue class of `client_id`.
const fn initial_insert_key(keys: i64, client_id: i64, num_clients: i64) -> i64 {
    (keys - 1) - (keys - 1 - client_id).rem_euclid(num_clients)
}

fn run_client(
    cli: &Cli,
    client_id: i32,
    barrier: &Barrier,
) -> Result<ClientReport, ClientError> {
    let mut client = Client::connect(&cli.address)?;
    let mut rng = rng();
    let num_clients = i64::from(cli.clients);

    let mut params = BatchParams {
        num_ops: cli.ops,
        insert_prob: cli.insert_prob,
        delete_prob: cli.delete_prob,
        update_prob: cli.update_prob,
        client_id,
        num_clients,
        base_insert_key: initial_insert_key(cli.keys, i64::from(client_id), num_clients),
        base_delete_key: i64::from(client_id),
    };
    let mut report = ClientReport::default();

    barrier.wait();

    for batch in 0..cli.batches {
        let start = Instant::now();
        let reply = client.batch_op(params)?;
        report.latencies.push(start.elapsed());
        report.server_nanos.push(reply.response.response_time_nanos);

        if !reply.response.success {
            warn!(client_id, batch, message = %reply.response.message, "batch failed");
            report.failures += 1;
        }

        params.base_insert_key = reply.base_insert_key;
        params.base_delete_key = reply.base_delete_key;

        if cli.think_time_ms > 0 {
            thread::sleep(Duration::from_millis(rng.random_range(0..=cli.think_time_ms)));
        }
    }

    debug!(
        client_id,
        base_insert_key = params.base_insert_key,
        base_delete_key = params.base_delete_key,
        "client done"
    );
    client.disconnect()?;

    Ok(report)
}

fn percentile(sorted: &[Duration], percent: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }

    sorted[(sorted.len() - 1) * percent / 100]
}

fn summarize(reports: &[ClientReport], wall_time: Duration) {
    let mut latencies: Vec<_> = reports.iter().flat_map(|r| r.latencies.iter().copied()).collect();
    latencies.sort_unstable();

    let server_nanos: i64 = reports.iter().flat_map(|r| r.server_nanos.iter()).sum();
    let batches = latencies.len();
    let failures: usize = reports.iter().map(|r| r.failures).sum();

    info!(
        batches,
        failures,
        wall_time = ?wall_time,
        p50 = ?percentile(&latencies, 50),
        p99 = ?percentile(&latencies, 99),
        max = ?latencies.last().copied().unwrap_or_default(),
        mean_server_time = ?Duration::from_nanos(
            u64::try_from(server_nanos / i64::try_from(batches.max(1)).unwrap_or(1)).unwrap_or(0)
        ),
        "benchmark finished"
    );
}

fn run(cli: &Cli) -> Result<(), ClientError> {
    let mut setup = Client::connect(&cli.address)?;

    let response = setup.create_schema(cli.num_columns)?;
    if !response.success {
        error!(message = %response.message, "could not create the schema");
        return Ok(());
    }

    let start = Instant::now();
    let response = setup.populate(0, cli.keys)?;
    info!(
        keys = cli.keys,
        success = response.success,
        elapsed = ?start.elapsed(),
        server_nanos = response.response_time_nanos,
        "populated"
    );

    let clients = usize::try_from(cli.clients).unwrap_or_default();
    let barrier = Barrier::new(clients);
    let start = Instant::now();

    let reports = thread::scope(|s| {
        let handles: Vec<_> = (0..cli.clients)
            .map(|client_id| {
                let barrier = &barrier;

                thread::Builder::new()
                    .name(format!("client-{client_id:02}"))
                    .spawn_scoped(s, move || run_client(cli, client_id, barrier))
            })
            .collect::<Result<_, _>>()?;

        handles
            .into_iter()
            .filter_map(|handle| match handle.join() {
                Ok(Ok(report)) => Some(Ok(report)),
                Ok(Err(error)) => Some(Err(error)),
                Err(_) => {
                    error!("client thread panicked");
                    None
                }
            })
            .collect::<Result<Vec<_>, ClientError>>()
    })?;

    summarize(&reports, start.elapsed());

    if cli.queries {
        for kind in [CommandKind::Query1, CommandKind::Query2, CommandKind::Query3] {
            let response = setup.query(kind)?;
            info!(
                query = %kind,
                success = response.success,
                message = %response.message,
                server_nanos = response.response_time_nanos,
                "query done"
            );
        }
    }

    setup.disconnect()
}

fn main() -> ExitCode {
    FmtSubscriber::builder()
        .with_thread_names(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.clients < 1 {
        error!("at least one client is needed");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_watermarks_fall_into_the_client_class() {
        assert_eq!(initial_insert_key(1000, 0, 1), 999);
        assert_eq!(initial_insert_key(1000, 3, 4), 999);
        assert_eq!(initial_insert_key(1000, 1, 4), 997);
        // nothing of this class was populated
        assert_eq!(initial_insert_key(0, 0, 4), -4);
    }

    #[test]
    fn percentiles_of_sorted_latencies() {
        let latencies: Vec<_> = (1..=100).map(Duration::from_millis).collect();

        assert_eq!(percentile(&latencies, 50), Duration::from_millis(50));
        assert_eq!(percentile(&latencies, 99), Duration::from_millis(99));
        assert_eq!(percentile(&[], 99), Duration::ZERO);
    }
}

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    process::ExitCode,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use log::{error, info};
use mbench::{
    backend::in_memory::InMemoryBackend,
    server::{DEFAULT_PORT, Server, ServerConfig, ServerError},
    workload::Limits,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
}

#[derive(Debug, Parser)]
#[command(about = "Runs the benchmark server")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Worker threads, each holds one backend connection
    #[arg(short, long, default_value_t = 2)]
    threads: usize,
    /// Columns used for records until a client creates a schema
    #[arg(short, long, default_value_t = 10)]
    num_columns: usize,
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,
    /// Largest operation count a single batch may request
    #[arg(long, default_value_t = Limits::default().max_ops)]
    max_ops: usize,
    #[arg(long, default_value_t = Limits::default().max_populate_rows)]
    max_populate_rows: usize,
    #[arg(long, default_value_t = Limits::default().max_columns)]
    max_columns: usize,
    #[arg(long, value_enum, default_value_t = Backend::Memory)]
    backend: Backend,
}

fn run(cli: &Cli) -> Result<(), ServerError> {
    let config = ServerConfig {
        bind: SocketAddr::new(cli.bind, cli.port),
        workers: cli.threads,
        num_columns: cli.num_columns,
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        limits: Limits {
            max_ops: cli.max_ops,
            max_populate_rows: cli.max_populate_rows,
            max_columns: cli.max_columns,
        },
        ..ServerConfig::default()
    };

    let server = match cli.backend {
        Backend::Memory => Server::bind(config, InMemoryBackend::new())?,
    };
    info!("using the {:?} backend", cli.backend);

    server.run()
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

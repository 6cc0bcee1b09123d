use mangler_core::checksum::crc32;
use mangler_core::config::{
    ensure_work_dir, load_config, BrokerConfig, ProducerConfig, WorkerConfig,
};
use mangler_core::generator::{Chain, Chop, Generator, RollingCorrupt};
use mangler_core::store::{run_store_worker, ResultStore};
use mangler_core::worker::DeliveryOutcome;
use mangler_core::{broker, producer, worker};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Distributed protocol fuzzing framework", long_about = None)]
struct Cli {
    /// Component configuration file (TOML); defaults apply when omitted.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    #[clap(long)]
    debug: bool,

    /// Create missing work directories without prompting.
    #[clap(short, long)]
    yes: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central broker.
    Broker {
        #[clap(long)]
        listen_port: Option<u16>,
    },
    /// Run a test-executing worker with the built-in demo delivery hook.
    Worker {
        #[clap(long)]
        queue: Option<String>,
    },
    /// Run a producer that fuzzes the bytes of a seed file.
    Producer {
        /// Seed input whose corruptions become the test stream.
        #[clap(short, long)]
        seed: PathBuf,
        #[clap(long)]
        queue: Option<String>,
        /// Random cases per corruption window.
        #[clap(long, default_value_t = 4)]
        random_cases: usize,
    },
    /// Run the result-store worker over a local archive.
    Store,
}

/// Demo delivery hook: flags payloads starting with `BAD` as crashes and
/// fabricates a minimal debugger detail for them.
fn demo_delivery(data: &[u8]) -> Result<DeliveryOutcome, anyhow::Error> {
    if data.starts_with(b"BAD") {
        let digest = md5::compute(data);
        let detail = format!(
            "EXCEPTION_TYPE:SIMULATED_FAULT\nEXCEPTION_SUBTYPE:DEMO\n\
             CLASSIFICATION:PROBABLY_NOT_EXPLOITABLE\n\
             SHORT_DESCRIPTION:Demo harness fault\n\
             MAJOR_HASH:{digest:x}\nMINOR_HASH:0\n\
             STACK_FRAME:demo!trigger+0x0\n"
        );
        return Ok(DeliveryOutcome {
            status: "crash".to_string(),
            detail,
            chain: Vec::new(),
        });
    }
    Ok(DeliveryOutcome {
        status: "success".to_string(),
        detail: String::new(),
        chain: Vec::new(),
    })
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Option<PathBuf>,
) -> Result<T, anyhow::Error> {
    match path {
        Some(path) => load_config(path),
        None => Ok(T::default()),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Every component is single-threaded and cooperatively scheduled; all
    // state mutation happens inside its one event loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Broker { listen_port } => {
            let mut config: BrokerConfig = load_or_default(&cli.config_file)?;
            if let Some(port) = listen_port {
                config.listen_port = port;
            }
            if cli.yes {
                config.assume_yes = true;
            }
            ensure_work_dir(&config.work_dir, config.assume_yes)?;
            runtime.block_on(broker::serve(config))
        }
        Command::Worker { queue } => {
            let mut config: WorkerConfig = load_or_default(&cli.config_file)?;
            if let Some(queue) = queue {
                config.queue_name = queue;
            }
            if cli.yes {
                config.assume_yes = true;
            }
            ensure_work_dir(&config.work_dir, config.assume_yes)?;
            runtime.block_on(worker::run(config, demo_delivery))
        }
        Command::Producer {
            seed,
            queue,
            random_cases,
        } => {
            let mut config: ProducerConfig = load_or_default(&cli.config_file)?;
            if let Some(queue) = queue {
                config.queue_name = queue;
            }
            if cli.yes {
                config.assume_yes = true;
            }
            ensure_work_dir(&config.work_dir, config.assume_yes)?;

            let seed_bytes = std::fs::read(&seed)
                .map_err(|e| anyhow::anyhow!("Failed to read seed file {:?}: {}", seed, e))?;
            info!(
                seed = ?seed,
                len = seed_bytes.len(),
                crc = format_args!("{:08x}", crc32(&seed_bytes)),
                "producing corruptions of seed"
            );
            let window = if seed_bytes.len() < 4 { 8 } else { 16 };
            let stream: Vec<Box<dyn Generator<Item = Vec<u8>> + Send>> = vec![
                Box::new(RollingCorrupt::new(
                    &seed_bytes,
                    window,
                    8,
                    random_cases,
                    false,
                )),
                Box::new(Chop::new(&seed_bytes)),
            ];
            let counters = runtime.block_on(producer::run(config, Chain::new(stream)))?;
            info!(?counters, "production finished");
            Ok(())
        }
        Command::Store => {
            let config: WorkerConfig = load_or_default(&cli.config_file)?;
            let assume_yes = cli.yes || config.assume_yes;
            ensure_work_dir(&config.work_dir, assume_yes)?;
            let store = ResultStore::open(&config.work_dir)?;
            runtime.block_on(run_store_worker(
                &config.server_ip,
                config.server_port,
                config.poll_interval_ms,
                store,
            ))
        }
    }
}

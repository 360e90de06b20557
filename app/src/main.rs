use clap::{Parser, Subcommand};
use common::{device::discover_devices, exec::CommandExecutor};
use eyre::Result;
use fio::{FIO_TOOL, WorkQueue};
use tracing::error;
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod bench;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark matrix
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
        /// Write the merged results as JSON instead of a stdout summary
        #[arg(short, long)]
        output_file: Option<String>,
        /// Log the generated commands without executing them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Print the generated per-target command matrix
    Print {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
    /// Discover block devices and dump the device graph as JSON
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("info".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!(
        "fio_benchmark={log_level},common={log_level},fio={log_level}"
    ));
    for log in &args.log {
        env_filter = env_filter.add_directive(log.parse()?);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    match args.command {
        Commands::Run {
            config_file,
            output_file,
            dry_run,
        } => {
            if let Err(err) = bench::run_benchmark(&config_file, output_file, dry_run).await {
                error!("{err:#?}");
                return Err(err);
            }
        }
        Commands::Print { config_file } => print_commands(&config_file).await?,
        Commands::Devices => dump_devices().await?,
    };

    Ok(())
}

async fn print_commands(config_file: &str) -> Result<()> {
    let settings = bench::parse_settings(config_file).await?;
    let queue = WorkQueue::build(&settings, &CommandExecutor).await?;
    for (target, items) in &queue.queue {
        println!("{target}:");
        for item in items {
            println!("  {FIO_TOOL} {}", item.args().join(" "));
        }
    }
    Ok(())
}

async fn dump_devices() -> Result<()> {
    let devices = discover_devices(&CommandExecutor).await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

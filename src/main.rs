use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bottling_plc::fieldbus::{DeviceIdentity, RegisterService};
use bottling_plc::registers::Consistency;
use bottling_plc::{fieldbus, ControlLoop, Plant, PlantConfig, Shutdown};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (RON); defaults to ./bottling.ron if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address of the Modbus/TCP server
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Run without the Modbus/TCP server
    #[arg(long)]
    no_server: bool,

    /// Start with RUN=1
    #[arg(long)]
    run: bool,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Tick as fast as possible instead of in real time
    #[arg(long)]
    fast: bool,

    /// Make multi-register reads see whole ticks
    #[arg(long)]
    snapshot: bool,

    /// Seed of the droplet jitter
    #[arg(long)]
    seed: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Command-line flags override every other configuration layer
    fn apply(&self, config: &mut PlantConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.no_server {
            config.server.enabled = false;
        }
        if self.run {
            config.simulation.start_running = true;
        }
        if let Some(ticks) = self.ticks {
            config.simulation.max_ticks = Some(ticks);
        }
        if self.fast {
            config.simulation.realtime = false;
        }
        if self.snapshot {
            config.registers.consistency = Consistency::TickSnapshot;
        }
        if let Some(seed) = self.seed {
            config.simulation.seed = seed;
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command-line arguments
    let args = Args::parse();

    let mut config = PlantConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    if args.print_config {
        println!("{}", config.to_ron()?);
        return Ok(());
    }

    config.validate()?;

    log::info!("Starting bottling line");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: PlantConfig) -> anyhow::Result<()> {
    let plant = Plant::from_config(&config)?;
    let registers = Arc::clone(plant.registers());
    let shutdown = Shutdown::new();

    // Bind before the first tick so a bad endpoint fails at startup
    let listener = if config.server.enabled {
        Some(fieldbus::bind(&config.server.host, config.server.port).await?)
    } else {
        log::info!("Field-bus server disabled");
        None
    };

    let control = ControlLoop::new(plant, shutdown.clone(), &config.simulation)
        .spawn()
        .context("Failed to start control loop")?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, stopping");
                shutdown.request_stop();
            }
        });
    }

    let served = match listener {
        Some(listener) => {
            let service = RegisterService::new(registers)
                .with_identity(DeviceIdentity::from_config(&config.server.identity));
            fieldbus::serve(listener, service, shutdown.clone()).await
        }
        None => {
            shutdown.fieldbus_stopped().await;
            Ok(())
        }
    };
    if served.is_err() {
        shutdown.request_stop();
    }

    let summary = tokio::task::spawn_blocking(move || control.join())
        .await
        .context("Failed to join control loop")?
        .map_err(|_| anyhow!("Control loop panicked"))??;
    served.context("Field-bus server failed")?;

    log::info!("Shut down: {}", summary);
    Ok(())
}

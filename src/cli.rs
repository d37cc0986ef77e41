use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand};
use futures::channel::oneshot;
use log::{debug, info, warn};
use tokio::time::timeout;

use crate::config::io::ConfigIO;
use crate::config::types::{pad_values, parse_value_list, validate_values, Config, ConfigValue};
use crate::device::agent::ConfigAgent;
use crate::device::btle::BtleTransport;
use crate::device::transport::Transport;
use crate::device::types::{PeripheralAddress, ScanTarget};
use crate::error::AppRunError;
use crate::sim::peripheral_sim::SimulatedPeripheral;

#[derive(Parser, Debug)]
#[command(name = "embre-agent", version, about = "Writes configuration values to an Embre peripheral over bluetooth LE")]
pub struct Cli {
    /// Talk to a simulated peripheral instead of the bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List nearby peripherals
    Scan {
        /// Stop as soon as "<name> <address>" (or just the address) shows up
        #[arg(long)]
        target: Option<String>,

        /// Seconds to scan for
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Write configuration values to a peripheral
    Write {
        /// Address of the peripheral; skips scanning
        #[arg(long, conflicts_with = "target")]
        address: Option<String>,

        /// Scan for this "<name> <address>" first
        #[arg(long)]
        target: Option<String>,

        /// Comma separated label=percentage pairs, e.g. A=20,B=30,C=50
        #[arg(long)]
        values: Option<String>,

        /// Remember the address and values in the config file
        #[arg(long)]
        save: bool,

        /// Seconds to scan for the target
        #[arg(long, default_value_t = 30)]
        scan_duration: u64,
    },
}

async fn make_transport(simulate: bool) -> Result<Arc<dyn Transport>, AppRunError> {
    if simulate {
        info!("Using simulated peripheral");
        let sim = SimulatedPeripheral::builder()
            .decoy(Some("Keyboard"), "AA:BB:CC:DD:EE:FF")
            .build();
        let transport: Arc<dyn Transport> = Arc::new(sim);
        return Ok(transport);
    }

    let transport: Arc<dyn Transport> = Arc::new(BtleTransport::new().await?);
    Ok(transport)
}

fn print_found(name: Option<&str>, address: &PeripheralAddress) {
    println!("{}  {}", address, name.unwrap_or("(unnamed)"));
}

async fn scan_for(agent: &ConfigAgent<dyn Transport>, target: Option<ScanTarget>, duration: Duration) -> Result<Option<PeripheralAddress>, AppRunError> {
    if !agent.scanner().start_scan(target, print_found)? {
        return Err(AppRunError::ScanRefused);
    }

    match timeout(duration, agent.scanner().wait_for_match()).await {
        Ok(matched) => Ok(matched),
        Err(_) => {
            // the target may have shown up just as the time ran out
            if let Err(err) = agent.scanner().stop_scan() {
                debug!("{}", err);
            }
            Ok(agent.scanner().state().matched_address)
        },
    }
}

async fn resolve_address(agent: &ConfigAgent<dyn Transport>, config: &Config, address: Option<String>, target: Option<String>, scan_duration: Duration) -> Result<PeripheralAddress, AppRunError> {
    if let Some(address) = address {
        return Ok(PeripheralAddress::new(&address));
    }

    let target = match (target, &config.address) {
        (Some(target), _) => target,
        (None, Some(address)) => return Ok(PeripheralAddress::new(address)),
        (None, None) => config.target.clone(),
    };

    scan_for(agent, Some(ScanTarget::new(&target)), scan_duration).await?
        .ok_or(AppRunError::PeripheralNotFound { target })
}

async fn write(agent: &ConfigAgent<dyn Transport>, values: &[ConfigValue], address: PeripheralAddress) -> Result<bool, AppRunError> {
    let (tx, mut rx) = oneshot::channel::<bool>();
    agent.submit(values, address, move |success| {
        let _ = tx.send(success);
    })?;

    let success = tokio::select! {
        result = &mut rx => result.unwrap_or(false),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling");
            agent.cancel_active_operation();
            rx.await.unwrap_or(false)
        },
    };

    Ok(success)
}

pub async fn execute(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new()?;
    let mut config = config_io.read_or_default().await?;
    let transport = make_transport(cli.simulate).await?;
    let agent: ConfigAgent<dyn Transport> = ConfigAgent::with_config(transport, config.protocol.clone());

    match cli.command {
        Command::Scan { target, duration } => {
            let matched = scan_for(&agent, target.as_deref().map(ScanTarget::new), Duration::from_secs(duration)).await?;
            if let Some(address) = matched {
                println!("Matched {}", address);
            }
            Ok(())
        },
        Command::Write { address, target, values, save, scan_duration } => {
            let values = match values {
                Some(values) => parse_value_list(&values)?,
                None => config.values.clone(),
            };

            validate_values(&values)?;

            let address = resolve_address(&agent, &config, address, target, Duration::from_secs(scan_duration)).await?;
            let padded = pad_values(values.clone(), config.slot_count);

            if !write(&agent, &padded, address.clone()).await? {
                return Err(AppRunError::WriteFailed);
            }

            println!("Configuration written to {}", address);

            if save {
                config.address = Some(address.to_string());
                config.values = values;
                config_io.save(&config).await?;
                println!("Saved to {}", config_io.path().to_string_lossy());
            }
            Ok(())
        },
    }
}

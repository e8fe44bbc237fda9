//! CLI Entry Point for rust-bbsim
//!
//! Provides command-line interface for:
//! - Running the emulated OLT with its ONUs (Openolt + admin gRPC servers)
//! - Running the bulk test runner against an emulator
//!
//! # Usage
//!
//! Emulate 2 PON ports with 16 ONUs each, starting EAPOL and DHCP:
//! ```bash
//! rust-bbsim olt --pon 2 --onu 16 --auth --dhcp
//! ```
//!
//! Drive the same topology from the bulk runner:
//! ```bash
//! rust-bbsim bbr --olt-address http://127.0.0.1:50060 --pon 2 --onu 16
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_bbsim::config::SimConfig;
use rust_bbsim::{bbr, grpc, logging};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust-bbsim")]
#[command(about = "Broadband access-network emulator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = rust_bbsim::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the emulated OLT
    Olt(OltArgs),

    /// Run the bulk test runner against an emulated OLT
    Bbr(BbrArgs),
}

#[derive(Args)]
struct OltArgs {
    /// OLT id
    #[arg(long)]
    olt_id: Option<u32>,
    /// Number of NNI ports
    #[arg(long)]
    nni: Option<u32>,
    /// Number of PON ports
    #[arg(long)]
    pon: Option<u32>,
    /// ONUs per PON port
    #[arg(long)]
    onu: Option<u32>,
    /// Service VLAN
    #[arg(long)]
    s_tag: Option<u16>,
    /// First subscriber VLAN
    #[arg(long)]
    c_tag: Option<u16>,
    /// Start EAPOL automatically
    #[arg(long)]
    auth: bool,
    /// Start DHCP automatically
    #[arg(long)]
    dhcp: bool,
    /// Openolt listen address
    #[arg(long)]
    openolt_address: Option<String>,
    /// Admin API listen address
    #[arg(long)]
    api_address: Option<String>,
}

#[derive(Args)]
struct BbrArgs {
    /// Emulator endpoint
    #[arg(long)]
    olt_address: Option<String>,
    /// Number of PON ports on the emulator
    #[arg(long)]
    pon: Option<u32>,
    /// ONUs per PON port on the emulator
    #[arg(long)]
    onu: Option<u32>,
    /// Seconds to wait for every ONU
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl OltArgs {
    fn apply(self, config: &mut SimConfig) {
        let olt = &mut config.olt;
        olt.id = self.olt_id.unwrap_or(olt.id);
        olt.nni_ports = self.nni.unwrap_or(olt.nni_ports);
        olt.pon_ports = self.pon.unwrap_or(olt.pon_ports);
        olt.onus_per_pon = self.onu.unwrap_or(olt.onus_per_pon);
        olt.s_tag = self.s_tag.unwrap_or(olt.s_tag);
        olt.c_tag_init = self.c_tag.unwrap_or(olt.c_tag_init);
        olt.auth |= self.auth;
        olt.dhcp |= self.dhcp;
        if let Some(address) = self.openolt_address {
            config.server.openolt_address = address;
        }
        if let Some(address) = self.api_address {
            config.server.api_address = address;
        }
    }
}

impl BbrArgs {
    fn apply(self, config: &mut SimConfig) {
        if let Some(address) = self.olt_address {
            config.bbr.olt_address = address;
        }
        config.olt.pon_ports = self.pon.unwrap_or(config.olt.pon_ports);
        config.olt.onus_per_pon = self.onu.unwrap_or(config.olt.onus_per_pon);
        config.bbr.timeout_secs = self.timeout_secs.unwrap_or(config.bbr.timeout_secs);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SimConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    let run_bbr = matches!(cli.command, Commands::Bbr(_));
    match cli.command {
        Commands::Olt(args) => args.apply(&mut config),
        Commands::Bbr(args) => args.apply(&mut config),
    }
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config)?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        signal.cancel();
    });

    if run_bbr {
        let report = bbr::run(&config, cancel).await?;
        if !report.is_complete() {
            bail!("{} ONUs did not complete", report.total - report.completed);
        }
    } else {
        info!(
            olt_id = config.olt.id,
            pon_ports = config.olt.pon_ports,
            onus_per_pon = config.olt.onus_per_pon,
            "Starting emulated OLT"
        );
        grpc::run_olt(&config, cancel).await?;
        warn!("Emulated OLT stopped");
    }
    Ok(())
}

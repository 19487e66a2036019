use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pop_ipam::config::Config;
use pop_ipam::models::{AddressBlock, AddressFamily, SubnetUtilization};
use pop_ipam::utils;
use pop_ipam::{AddressSpaceAllocator, AllocatorOptions, PopPlan, PopProvisioner, Store};

/// POP address provisioning
#[derive(Debug, Parser)]
#[command(name = "pop-ipam", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register the global pools and list them
    Seed,
    /// Allocate a POP container, its role networks and device loopbacks
    ProvisionSite {
        #[arg(long)]
        site: String,
        /// Device name; repeat for each device
        #[arg(long = "device")]
        devices: Vec<String>,
    },
    /// Carve the per-rack VLAN subnets and gateway addresses
    RackVlans {
        #[arg(long)]
        site: String,
        #[arg(long)]
        rack: String,
    },
    /// Show a block with its children, or the whole pool
    Show {
        #[arg(long)]
        cidr: Option<String>,
        #[arg(long, default_value_t = false)]
        ipv6: bool,
    },
}

#[derive(Serialize)]
struct BlockDetail {
    block: AddressBlock,
    utilization: SubnetUtilization,
    children: Vec<AddressBlock>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout is reserved for JSON output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pop_ipam=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Database: {}", cfg.db_path);

    // Initialize database
    let store = Store::with_pool_size(&cfg.db_path, cfg.db_max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.db_path))?;
    tracing::info!("Database initialized (pool_size={})", cfg.db_max_connections);

    let allocator = AddressSpaceAllocator::with_options(
        store,
        AllocatorOptions {
            ancestor_search_depth: cfg.ancestor_search_depth,
        },
    );

    let mut pools = Vec::with_capacity(cfg.global_pools.len());
    for cidr in &cfg.global_pools {
        let pool = allocator
            .register_container(*cidr, None, Some("POP Global Pool".to_string()))
            .await
            .with_context(|| format!("Failed to seed global pool {}", cidr))?;
        pools.push(pool);
    }

    match cli.command {
        Command::Seed => print_json(&pools),
        Command::ProvisionSite { site, devices } => {
            let provisioner = PopProvisioner::new(allocator, PopPlan::from(&cfg));
            let pop = provisioner.provision_site(&site, &devices).await?;
            print_json(&pop)
        }
        Command::RackVlans { site, rack } => {
            let provisioner = PopProvisioner::new(allocator, PopPlan::from(&cfg));
            let vlans = provisioner.allocate_rack_vlans(&site, &rack).await?;
            print_json(&vlans)
        }
        Command::Show { cidr: Some(cidr), .. } => {
            let net = utils::parse_cidr(&cidr).map_err(anyhow::Error::msg)?;
            let block = allocator
                .find_by_cidr(&net)
                .await?
                .with_context(|| format!("No block for {}", net))?;
            let detail = BlockDetail {
                utilization: allocator.utilization(block.id).await?,
                children: allocator.list_children(block.id).await?,
                block,
            };
            print_json(&detail)
        }
        Command::Show { cidr: None, ipv6 } => {
            let family = if ipv6 { AddressFamily::V6 } else { AddressFamily::V4 };
            print_json(&allocator.list_pool(family).await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

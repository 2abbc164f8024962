use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use privnet::config::{load_network_config, NodeSpec, Role};
use privnet::genesis::{GenesisBuilder, GenesisDocument};
use privnet::registry::{JsonFileStore, NetworkInfo};
use privnet::runtime::DockerCli;
use privnet::settings::load_settings;
use privnet::NetworkOrchestrator;

/// Provisioning orchestrator for private Clique-consensus networks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the orchestrator settings YAML file
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding the network registry (defaults to `<work_dir>/.registry`)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a network description and write its artifacts without provisioning
    Plan {
        #[arg(short, long)]
        config: PathBuf,
        /// Output directory for genesis, identities and container specs
        #[arg(short, long, default_value = "privnet_plan")]
        output: PathBuf,
    },
    /// Provision a network from its description
    Create {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List provisioned networks
    List,
    /// Show one network and its nodes
    Show {
        #[arg(long = "network")]
        network_id: String,
    },
    /// Add a node to a running network
    AddNode {
        #[arg(long = "network")]
        network_id: String,
        #[arg(long = "node-id")]
        id: String,
        #[arg(long)]
        role: Role,
        #[arg(long)]
        ip: Option<Ipv4Addr>,
        #[arg(long)]
        rpc_port: Option<u16>,
        #[arg(long)]
        p2p_port: Option<u16>,
    },
    /// Stop and delete one node
    RemoveNode {
        #[arg(long = "network")]
        network_id: String,
        #[arg(long)]
        node_id: String,
    },
    /// Stop every node of a network
    Stop {
        #[arg(long = "network")]
        network_id: String,
    },
    /// Restart a stopped network
    Start {
        #[arg(long = "network")]
        network_id: String,
    },
    /// Remove every resource of a network
    Destroy {
        #[arg(long = "network")]
        network_id: String,
    },
    /// Edit genesis documents offline
    Genesis {
        #[command(subcommand)]
        command: GenesisCommand,
    },
}

#[derive(Subcommand, Debug)]
enum GenesisCommand {
    /// Append a signer address to an existing genesis file
    AddValidator {
        #[arg(long)]
        genesis: PathBuf,
        /// Signer address as hex, with or without 0x
        #[arg(long)]
        address: String,
    },
}

fn print_network(network: &NetworkInfo) {
    println!(
        "{}  chain={}  subnet={}  status={}  nodes={}",
        network.network_id,
        network.config.chain_id,
        network.config.subnet,
        network.status,
        network.nodes.len()
    );
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let settings = load_settings(args.settings.as_deref())?;

    if let Command::Genesis { command: GenesisCommand::AddValidator { genesis, address } } = &args.command {
        let mut document = GenesisDocument::read_from(genesis)?;
        GenesisBuilder::new(settings.genesis.clone()).add_validator(&mut document, address)?;
        document.write_to(genesis)?;
        info!("Genesis {:?} now has signers {:?}", genesis, document.signers()?);
        return Ok(());
    }

    let state_dir = args.state_dir.clone().unwrap_or_else(|| settings.work_dir.join(".registry"));
    let store = JsonFileStore::open(&state_dir)
        .wrap_err_with(|| format!("Failed to open registry at '{}'", state_dir.display()))?;
    let orchestrator = NetworkOrchestrator::new(settings, Arc::new(DockerCli::default()), Arc::new(store));

    match args.command {
        Command::Plan { config, output } => {
            let config = load_network_config(&config)?;
            let plan = orchestrator.plan_network(&config)?;
            let layout = plan.write_to(&output, &orchestrator.settings().container_config_dir)?;
            for spec in &plan.containers {
                info!("{} -> {} on {}", spec.name, spec.ip, spec.network);
            }
            info!("Plan for '{}' written to {:?}", plan.config.network_id, layout.host_root());
        }
        Command::Create { config } => {
            let config = load_network_config(&config)?;
            let network = orchestrator.create_network(&config)?;
            print_network(&network);
            if let Some(url) = network.bootstrap_url() {
                println!("bootstrap: {}", url);
            }
        }
        Command::List => {
            for network in orchestrator.list_networks()? {
                print_network(&network);
            }
        }
        Command::Show { network_id } => {
            let network = orchestrator.get_network(&network_id)?;
            print_network(&network);
            for node in network.config.provisioning_order() {
                let status = network
                    .nodes
                    .get(&node.id)
                    .map(|n| format!("{:?}", n.status).to_lowercase())
                    .unwrap_or_else(|| "pending".to_string());
                println!(
                    "  {:<16} {:<10} {:<15} rpc={:<5} p2p={:<5} {}",
                    node.id, node.role, node.ip, node.rpc_port, node.p2p_port, status
                );
            }
        }
        Command::AddNode { network_id, id, role, ip, rpc_port, p2p_port } => {
            let spec = NodeSpec { id, role, ip, rpc_port, p2p_port };
            let node = orchestrator.add_node(&network_id, spec)?;
            println!("{} ({}) running at {}: {}", node.id, node.role, node.ip, node.credentials.discovery_url);
        }
        Command::RemoveNode { network_id, node_id } => {
            orchestrator.remove_node(&network_id, &node_id)?;
        }
        Command::Stop { network_id } => {
            print_network(&orchestrator.stop_network(&network_id)?);
        }
        Command::Start { network_id } => {
            print_network(&orchestrator.start_network(&network_id)?);
        }
        Command::Destroy { network_id } => {
            orchestrator.destroy_network(&network_id)?;
        }
        Command::Genesis { .. } => {}
    }

    Ok(())
}

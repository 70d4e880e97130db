//! Command-line senders for the GridAgent server bus.
//!
//! Each subcommand builds one bus command and publishes it under the
//! routing key the server listens on. `watch` prints everything agents
//! and servers publish.

use std::process::ExitCode;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use gridagent_protocol::{
    parse_hex_id, AgentId, BusCommand, Meter, ParseError, SoftwareVersion, AGENT_ROUTING_PATTERN,
    DEFAULT_AGENT_HW_MODEL, DEFAULT_METER_HW_MODEL, SERVER_ROUTING_KEY,
};
use gridagent_server::config::DEFAULT_BUS_URL;
use gridagent_server::BusClient;

#[derive(Parser, Debug)]
#[command(
    name = "gridagentctl",
    about = "Send commands to GridAgent servers over the bus",
    version
)]
struct Cli {
    /// Bus URL.
    #[arg(long, global = true, env = "GAS_BUS_URL", default_value = DEFAULT_BUS_URL)]
    bus_url: String,

    /// Print the message and its routing key.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Build the message but don't send it.
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Switch meter relays on or off.
    RelayState {
        /// Target agent (MAC address).
        #[arg(value_parser = parse_agent)]
        agent: AgentId,

        /// Target meters (ZigBee MAC addresses).
        #[arg(required = true, value_parser = parse_meter)]
        meters: Vec<Meter>,

        #[command(flatten)]
        state: RelaySwitch,
    },

    /// Put meter relays under automatic or manual control.
    ControlMode {
        /// Target agent (MAC address).
        #[arg(value_parser = parse_agent)]
        agent: AgentId,

        /// Target meters (ZigBee MAC addresses).
        #[arg(required = true, value_parser = parse_meter)]
        meters: Vec<Meter>,

        #[command(flatten)]
        mode: ControlSwitch,
    },

    /// Send new firmware to an agent.
    AgentSoftware {
        /// Target agent (MAC address).
        #[arg(value_parser = parse_agent)]
        agent: AgentId,

        /// Software version (n.n.n[extra]).
        sw_version: SoftwareVersion,

        /// Compatible hardware version (n.n.n[extra]).
        target_hw_version: SoftwareVersion,

        /// Hardware model.
        #[arg(short, long, default_value_t = DEFAULT_AGENT_HW_MODEL)]
        model: u8,
    },

    /// Send new firmware to meters behind an agent.
    MeterSoftware {
        /// Target agent (MAC address).
        #[arg(value_parser = parse_agent)]
        agent: AgentId,

        /// Software version (n.n.n[extra]).
        sw_version: SoftwareVersion,

        /// Compatible hardware version (n.n.n[extra]).
        target_hw_version: SoftwareVersion,

        /// Target meters (ZigBee MAC addresses).
        #[arg(required = true, value_parser = parse_meter)]
        meters: Vec<Meter>,

        /// Hardware model.
        #[arg(short, long, default_value_t = DEFAULT_METER_HW_MODEL)]
        model: u8,
    },

    /// Ask servers to publish their connected agents.
    CurrentAgents {
        /// Wait this many seconds for a reply and print it.
        #[arg(short, long, value_name = "SECS")]
        wait: Option<u64>,
    },

    /// Print every message on the server and agent subjects.
    Watch,
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct RelaySwitch {
    /// Switch relays on.
    #[arg(short, long)]
    on: bool,

    /// Switch relays off.
    #[arg(short = 'f', long)]
    off: bool,
}

#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct ControlSwitch {
    /// Automatic (rule driven) control.
    #[arg(short, long)]
    auto: bool,

    /// Manual control.
    #[arg(short, long)]
    manual: bool,
}

/// Options shared by every sender.
struct SendOptions {
    bus_url: String,
    verbose: bool,
    dry_run: bool,
}

/// Operators address agents by their six-byte MAC.
fn parse_agent(value: &str) -> Result<AgentId, ParseError> {
    parse_hex_id(value, 6).map(AgentId::new)
}

fn parse_meter(value: &str) -> Result<Meter, ParseError> {
    parse_hex_id(value, 8).map(Meter::zigbee)
}

impl Commands {
    /// The bus command to send; `None` for `watch`.
    fn bus_command(self) -> Option<BusCommand> {
        let command = match self {
            Commands::RelayState {
                agent,
                meters,
                state,
            } => BusCommand::RelayState {
                agent,
                relay_on: state.on,
                meters,
            },
            Commands::ControlMode {
                agent,
                meters,
                mode,
            } => BusCommand::ControlMode {
                agent,
                control_manual: mode.manual,
                meters,
            },
            Commands::AgentSoftware {
                agent,
                sw_version,
                target_hw_version,
                model,
            } => BusCommand::GridagentSoftware {
                agent,
                sw_version,
                hw_model: model,
                target_hw_version,
            },
            Commands::MeterSoftware {
                agent,
                sw_version,
                target_hw_version,
                meters,
                model,
            } => BusCommand::GridpointSoftware {
                agent,
                sw_version,
                hw_model: model,
                target_hw_version,
                meters,
            },
            Commands::CurrentAgents { .. } => BusCommand::CurrentAgents,
            Commands::Watch => return None,
        };
        Some(command)
    }
}

async fn connect(bus_url: &str) -> Option<BusClient> {
    match BusClient::connect(bus_url).await {
        Ok(bus) => Some(bus),
        Err(e) => {
            eprintln!("error: cannot reach bus at {}: {}", bus_url, e);
            None
        }
    }
}

/// Publish one command, optionally waiting for a reply.
async fn run_send(opts: &SendOptions, command: BusCommand, wait: Option<Duration>) -> ExitCode {
    let routing_key = command.routing_key();
    let payload = match serde_json::to_vec(&command) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            eprintln!("error: failed to encode message: {}", e);
            return ExitCode::from(1);
        }
    };

    if opts.dry_run {
        if opts.verbose {
            print_message(&command, &routing_key, false);
        }
        return ExitCode::SUCCESS;
    }

    let Some(bus) = connect(&opts.bus_url).await else {
        return ExitCode::from(1);
    };

    let reply = match wait {
        Some(wait) => {
            let inbox = bus.new_inbox();
            let subscription = match bus.subscribe(&inbox).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::from(1);
                }
            };
            if let Err(e) = bus.publish_with_reply(&routing_key, &inbox, payload).await {
                eprintln!("error: {}", e);
                return ExitCode::from(1);
            }
            Some((subscription, wait))
        }
        None => {
            if let Err(e) = bus.publish(&routing_key, payload).await {
                eprintln!("error: {}", e);
                return ExitCode::from(1);
            }
            None
        }
    };

    if let Err(e) = bus.flush().await {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }
    if opts.verbose {
        print_message(&command, &routing_key, true);
    }

    let Some((mut subscription, wait)) = reply else {
        return ExitCode::SUCCESS;
    };
    match tokio::time::timeout(wait, subscription.next()).await {
        Ok(Some(message)) => {
            match serde_json::from_slice::<serde_json::Value>(&message.payload)
                .and_then(|value| serde_json::to_string_pretty(&value))
            {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{}", String::from_utf8_lossy(&message.payload)),
            }
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("error: bus connection closed while waiting for a reply");
            ExitCode::from(1)
        }
        Err(_) => {
            eprintln!("error: no reply within {}s", wait.as_secs());
            ExitCode::from(1)
        }
    }
}

fn print_message(command: &BusCommand, routing_key: &str, sent: bool) {
    match serde_json::to_string_pretty(command) {
        Ok(text) => println!("message:\n{}", text),
        Err(e) => eprintln!("error: failed to format message: {}", e),
    }
    println!("(routing key {})", routing_key);
    println!("{}", if sent { "(sent)" } else { "(not sent)" });
}

/// Print messages on the server and agent subjects until interrupted.
async fn run_watch(opts: &SendOptions) -> ExitCode {
    let Some(bus) = connect(&opts.bus_url).await else {
        return ExitCode::from(1);
    };

    let subscribed = async {
        let server = bus.subscribe(SERVER_ROUTING_KEY).await?;
        let agents = bus.subscribe(AGENT_ROUTING_PATTERN).await?;
        Ok::<_, gridagent_server::BusError>((server, agents))
    };
    let (mut server, mut agents) = match subscribed.await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => return ExitCode::SUCCESS,
            message = server.next() => message,
            message = agents.next() => message,
        };
        let Some(message) = message else {
            eprintln!("error: bus connection closed");
            return ExitCode::from(1);
        };
        println!(
            "{}: {}",
            message.subject,
            String::from_utf8_lossy(&message.payload)
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Cli {
        bus_url,
        verbose,
        dry_run,
        command,
    } = Cli::parse();
    let opts = SendOptions {
        bus_url,
        verbose,
        dry_run,
    };

    let wait = match &command {
        Commands::CurrentAgents { wait } => wait.map(Duration::from_secs),
        _ => None,
    };
    match command.bus_command() {
        Some(message) => run_send(&opts, message, wait).await,
        None => run_watch(&opts).await,
    }
}

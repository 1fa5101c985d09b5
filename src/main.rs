//! framelink - Framed, typed messaging over TCP, UDP and multicast
//!
//! Command line front end for running listeners and sending test messages.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use framelink::config::{self, Config};
use framelink::network::{
    ConnectionError, MessageHandler, MulticastReceiver, MulticastTtl, MulticastTypedSender,
    TcpServer, TcpTypedClient, UdpOption, UdpReceiver, UdpTypedSender,
};
use framelink::protocol::{ArchiveType, Endpoint, MessageBuilder, ReceivedMessage};
use framelink::threads::IoThreadGroup;

/// framelink - Framed, typed messaging over TCP, UDP and multicast
#[derive(Parser)]
#[command(name = "framelink")]
#[command(author = "FrameLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send and receive framed messages over TCP, UDP and multicast", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TCP server that prints every message it receives
    Server {
        /// Port to listen on (defaults to tcp.listen_port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message to a TCP server
    Send {
        /// Server host (defaults to tcp.server_host)
        #[arg(long)]
        host: Option<String>,

        /// Server port (defaults to tcp.server_port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Message id
        #[arg(short, long, default_value_t = 1)]
        id: i32,

        /// Archive for the payload (defaults to protocol.default_archive)
        #[arg(short, long)]
        archive: Option<ArchiveType>,

        /// Payload text
        payload: String,
    },

    /// Print every frame arriving on a UDP port
    UdpListen {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one frame as a UDP datagram
    UdpSend {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value_t = 1)]
        id: i32,

        #[arg(short, long)]
        archive: Option<ArchiveType>,

        /// Enable broadcast on the sending socket
        #[arg(long)]
        broadcast: bool,

        payload: String,
    },

    /// Join a multicast group and print every frame
    MulticastListen {
        /// Group address (defaults to multicast.group)
        #[arg(short, long)]
        group: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one frame to a multicast group
    MulticastSend {
        #[arg(short, long)]
        group: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value_t = 1)]
        id: i32,

        #[arg(short, long)]
        archive: Option<ArchiveType>,

        /// TTL scope: same-host, same-subnet, same-site, same-region, same-continent, unrestricted
        #[arg(long)]
        ttl: Option<String>,

        payload: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Prints frames as they arrive
struct PrintHandler;

impl MessageHandler for PrintHandler {
    fn on_message(&self, message: ReceivedMessage, from: &Endpoint) {
        let body = match message.archive_type() {
            ArchiveType::Raw => String::from_utf8_lossy(&message.body).into_owned(),
            _ => message
                .decode_body::<String>()
                .unwrap_or_else(|_| format!("<{} bytes>", message.body.len())),
        };
        println!(
            "[{}] id={} archive={} reply-to={} body={}",
            from,
            message.message_id(),
            message.archive_type(),
            message.response_address(),
            body
        );
    }

    fn on_error(&self, error: &ConnectionError, from: &Endpoint) {
        tracing::warn!("Error from {}: {}", from, error);
    }

    fn on_connected(&self, peer: &Endpoint) {
        println!("+ Connected: {}", peer);
    }

    fn on_disconnected(&self, peer: &Endpoint) {
        println!("- Disconnected: {}", peer);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Server { port } => {
            run_server(&config, port.unwrap_or(config.tcp.listen_port))?;
        }
        Commands::Send {
            host,
            port,
            id,
            archive,
            payload,
        } => {
            let mut server = config.server_endpoint();
            if let Some(host) = host {
                server.host = host;
            }
            if let Some(port) = port {
                server.port = port;
            }
            let archive = archive.unwrap_or(config.protocol.default_archive);
            run_send(&config, server, id, archive, &payload)?;
        }
        Commands::UdpListen { port } => {
            let group = IoThreadGroup::with_threads(config.io.worker_threads)?;
            let _receiver = UdpReceiver::bind(
                &group.handle()?,
                port.unwrap_or(config.udp.port),
                &config.udp_options()?,
                Arc::new(PrintHandler),
            )?;
            wait_for_ctrl_c(&group)?;
        }
        Commands::UdpSend {
            host,
            port,
            id,
            archive,
            broadcast,
            payload,
        } => {
            let mut options = config.udp_options()?;
            if broadcast {
                options.udp_option = UdpOption::Broadcast;
            }
            let sender = UdpTypedSender::new(
                &Endpoint::new(host, port.unwrap_or(config.udp.port)),
                &options,
                Arc::new(config.message_builder()?),
                archive.unwrap_or(config.protocol.default_archive),
            )?;
            match sender.archive() {
                ArchiveType::Raw => sender.send_raw(id, payload.as_bytes(), &Endpoint::null())?,
                _ => sender.send(id, &payload, &Endpoint::null())?,
            }
            println!("Sent message {} to {}", id, sender.sender().target());
        }
        Commands::MulticastListen { group, port } => {
            let endpoint = multicast_endpoint(&config, group, port);
            let threads = IoThreadGroup::with_threads(config.io.worker_threads)?;
            let _receiver = MulticastReceiver::bind(
                &threads.handle()?,
                &endpoint,
                &config.multicast_options()?,
                Arc::new(PrintHandler),
            )?;
            println!("Listening on multicast group {}", endpoint);
            wait_for_ctrl_c(&threads)?;
        }
        Commands::MulticastSend {
            group,
            port,
            id,
            archive,
            ttl,
            payload,
        } => {
            let endpoint = multicast_endpoint(&config, group, port);
            let mut options = config.multicast_options()?;
            if let Some(ttl) = ttl {
                options.ttl = parse_ttl(&ttl)?;
            }
            let sender = MulticastTypedSender::new(
                &endpoint,
                &options,
                Arc::new(config.message_builder()?),
                archive.unwrap_or(config.protocol.default_archive),
            )?;
            match sender.archive() {
                ArchiveType::Raw => sender.send_raw(id, payload.as_bytes(), &Endpoint::null())?,
                _ => sender.send(id, &payload, &Endpoint::null())?,
            }
            println!("Sent message {} to {}", id, endpoint);
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run a TCP server until Ctrl+C
fn run_server(config: &Config, port: u16) -> anyhow::Result<()> {
    let group = IoThreadGroup::with_threads(config.io.worker_threads)?;
    let server = TcpServer::new(
        group.handle()?,
        port,
        config.connection_options()?,
        Arc::new(PrintHandler),
    );

    let addr = server.start()?;

    println!("\n========================================");
    println!("  framelink server running");
    println!("========================================");
    println!("  Host: {}", config.general.name);
    println!("  Listening: {}", addr);
    println!("  Magic: {}", config.protocol.magic_string);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    wait_for_ctrl_c(&group)?;

    println!("\nShutting down...");
    server.stop()?;
    group.stop()?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Connect to a server and send one message
fn run_send(
    config: &Config,
    server: Endpoint,
    id: i32,
    archive: ArchiveType,
    payload: &str,
) -> anyhow::Result<()> {
    let group = IoThreadGroup::with_threads(1)?;
    let builder: Arc<dyn MessageBuilder> = Arc::new(config.message_builder()?);
    let client = TcpTypedClient::new(
        group.handle()?,
        server.clone(),
        config.connection_options()?,
        Arc::new(PrintHandler),
        builder,
        archive,
    );

    tracing::info!("Sending message {} to {} as {}", id, server, archive);

    group.block_on(async {
        match archive {
            ArchiveType::Raw => {
                client
                    .send_raw_sync(id, payload.as_bytes(), &Endpoint::null())
                    .await
            }
            _ => client.send_sync(id, payload, &Endpoint::null()).await,
        }
    })??;

    println!("Sent message {} to {}", id, server);
    client.close();
    group.stop()?;
    Ok(())
}

fn multicast_endpoint(config: &Config, group: Option<String>, port: Option<u16>) -> Endpoint {
    let mut endpoint = config.multicast_group();
    if let Some(group) = group {
        endpoint.host = group;
    }
    if let Some(port) = port {
        endpoint.port = port;
    }
    endpoint
}

fn parse_ttl(value: &str) -> anyhow::Result<MulticastTtl> {
    let ttl = match value.to_ascii_lowercase().replace('_', "-").as_str() {
        "same-host" => MulticastTtl::SameHost,
        "same-subnet" => MulticastTtl::SameSubnet,
        "same-site" => MulticastTtl::SameSite,
        "same-region" => MulticastTtl::SameRegion,
        "same-continent" => MulticastTtl::SameContinent,
        "unrestricted" => MulticastTtl::Unrestricted,
        other => anyhow::bail!("Unknown multicast TTL scope: {}", other),
    };
    Ok(ttl)
}

fn wait_for_ctrl_c(group: &IoThreadGroup) -> anyhow::Result<()> {
    println!("Press Ctrl+C to stop.");
    group.block_on(tokio::signal::ctrl_c())??;
    Ok(())
}

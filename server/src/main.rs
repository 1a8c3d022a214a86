use clap::Parser;
use log::info;
use server::bot::Bot;
use server::config::BotConfig;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Hosts Warcraft III lobbies and games.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// IPv4 address to bind listeners to
    #[clap(short, long)]
    bind: Option<Ipv4Addr>,
    /// First host port handed to lobbies
    #[clap(long)]
    port_min: Option<u16>,
    /// Last host port handed to lobbies
    #[clap(long)]
    port_max: Option<u16>,
    /// LAN discovery port
    #[clap(short, long)]
    udp_port: Option<u16>,
    /// Milliseconds between reactor ticks
    #[clap(short, long)]
    tick_ms: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut BotConfig) {
        if let Some(bind) = self.bind {
            config.net.bind_address = bind;
        }
        if let Some(port) = self.port_min {
            config.net.min_host_port = port;
        }
        if let Some(port) = self.port_max {
            config.net.max_host_port = port;
        }
        if let Some(port) = self.udp_port {
            config.net.udp_port = port;
        }
        if let Some(tick) = self.tick_ms {
            config.net.tick_ms = tick;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = BotConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!(
        "binding {} with host ports {}..={}",
        config.net.bind_address, config.net.min_host_port, config.net.max_host_port
    );
    let mut bot = Bot::new(config)?;
    bot.run().await?;
    Ok(())
}

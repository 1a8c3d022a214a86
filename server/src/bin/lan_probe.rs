//! Sends one LAN `SEARCHGAME` and prints every `GAMEINFO` that comes back.
//!
//! Handy for checking that a bot is visible from another machine.

use clap::Parser;
use log::{debug, info};
use server::socket::UdpSocket;
use shared::w3gs;
use shared::{Product, LAN_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Where to send the search. Defaults to the LAN broadcast address.
    #[clap(short = 'H', long, default_value = "255.255.255.255")]
    host: Ipv4Addr,
    #[clap(short, long, default_value_t = LAN_PORT)]
    port: u16,
    /// Client version to search for
    #[clap(short, long, default_value_t = 26)]
    version: u32,
    /// Search for Reign of Chaos games instead of The Frozen Throne
    #[clap(long)]
    roc: bool,
    /// Seconds to wait for replies
    #[clap(short, long, default_value_t = 3)]
    wait: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), true)?;
    let product = Product::from_tft(!args.roc);
    let search = w3gs::send_searchgame(product, args.version);
    let target = SocketAddr::new(IpAddr::V4(args.host), args.port);
    if !socket.send_to(target, &search) {
        return Err(format!("could not send to {}", target).into());
    }
    info!("searching {} for {:?} 1.{} games", target, product, args.version);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait);
    let mut found = 0;
    while tokio::time::Instant::now() < deadline {
        let Some(pkt) = socket.recv() else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };
        match w3gs::receive_gameinfo(&pkt.data) {
            Some(info) => {
                found += 1;
                println!(
                    "{} \"{}\" on {} host counter {} port {} ({}/{} slots open)",
                    pkt.sender,
                    info.game_name,
                    info.stats.map_path,
                    info.host_counter,
                    info.port,
                    info.slots_open,
                    info.slots_total
                );
            }
            None => debug!("ignoring {} bytes from {}", pkt.data.len(), pkt.sender),
        }
    }
    info!("{} games found", found);
    Ok(())
}

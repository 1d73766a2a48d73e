//! vswitch command line interface
//!
//! Validates switch configurations, prints the tables they provision and
//! replays a handshake against a listener to smoke test a configuration
//! without any real network attached.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use log::LevelFilter;
use smoltcp::wire::EthernetAddress;
use vsw_core::config::SwitchConfig;
use vsw_core::fd::{Read, VSwitchServerSocketFd, VirtualFd};
use vsw_core::network::VirtualNetwork;
use vsw_core::packet::{Frame, FramePayload, IpPacket, TcpFlags, TcpSegment, build_frame};
use vsw_core::reactor::VirtualReactor;
use vsw_core::stack::{InboundFrame, OutboundFrame};
use vsw_core::switch::Switch;

#[derive(Parser)]
#[command(name = "vswitch")]
#[command(about = "User-space virtual switch tooling", long_about = None)]
#[command(after_help = r#"EXAMPLES:
    vswitch validate switch.json             Check a configuration
    vswitch tables switch.json               Print provisioned tables
    vswitch tables switch.json --json        Print the normalized configuration
    vswitch smoke switch.json 1314           Handshake with 10.0.0.1:80 in vni 1314
    vswitch smoke switch.json 1314 --listen 10.0.0.1:8080 --client 10.0.0.9:40000
"#)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a configuration and apply it to a switch
    Validate { config: PathBuf },

    /// Print networks, synthetic IPs, routes and NAT rules
    Tables {
        config: PathBuf,

        /// Print the configuration as the switch reports it back
        #[arg(short, long)]
        json: bool,
    },

    /// Replay a TCP handshake and echo exchange against a listener
    Smoke {
        config: PathBuf,

        vni: u32,

        /// Listening address, defaults to the first synthetic IPv4 on port 80
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Simulated client address
        #[arg(short, long, default_value = "10.0.0.5:4000")]
        client: SocketAddr,
    },
}

const CLIENT_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x05]);
const CLIENT_PORT: u32 = 1;

fn open(path: &Path) -> Result<(Switch<VirtualReactor>, Receiver<OutboundFrame>)> {
    let config = SwitchConfig::load(path)?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let sw = Switch::from_config(&config, VirtualReactor::new(), tx)
        .with_context(|| format!("applying {}", path.display()))?;
    Ok((sw, rx))
}

fn print_network(net: &VirtualNetwork) {
    match net.v6_network {
        Some(v6) => println!("vni {}: {} {}", net.vni, net.v4_network, v6),
        None => println!("vni {}: {}", net.vni, net.v4_network),
    }
    for (ip, mac) in net.ips.all_ips() {
        println!("  ip    {:<24} {}", ip, mac);
    }
    for rule in net.routes.rules() {
        println!("  route {}", rule);
    }
    for rule in net.nat_rules.rules() {
        println!("  nat   {}", rule);
    }
}

fn segments(rx: &Receiver<OutboundFrame>) -> Result<Vec<TcpSegment>> {
    let mut segs = vec![];
    for out in rx.try_iter() {
        let frame = Frame::parse(&out.frame)?;
        if let FramePayload::Ip(ip) = frame.payload {
            if let Some(seg) = ip.tcp_segment() {
                segs.push(seg.clone());
            }
        }
    }
    Ok(segs)
}

fn smoke(path: &Path, vni: u32, listen: Option<SocketAddr>, client: SocketAddr) -> Result<()> {
    let (mut sw, rx) = open(path)?;
    let Some(net) = sw.network(vni) else {
        bail!("vni {} is not configured", vni);
    };
    let Some((synthetic_ip, synthetic_mac)) = net.ips.find_any_v4_for_routing() else {
        bail!("vni {} has no synthetic ipv4 address", vni);
    };
    let listen = listen.unwrap_or(SocketAddr::new(synthetic_ip, 80));
    let Some(dst_mac) = net.ips.lookup(listen.ip()) else {
        bail!("{} is not a synthetic ip of vni {}", listen.ip(), vni);
    };
    if !net.contains_ip(client.ip()) || client.ip() == listen.ip() {
        bail!("client {} must be another host of vni {}", client, vni);
    }
    log::debug!("smoke test {} -> {} ({})", client, listen, synthetic_mac);

    let mut server = VSwitchServerSocketFd::new(vni);
    sw.with_network(vni, |ctx| server.bind(ctx, listen))??;

    let send = |sw: &mut Switch<VirtualReactor>, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]| -> Result<()> {
        let mut seg = TcpSegment::new(client.port(), listen.port(), seq, ack, flags);
        seg.window = 65535;
        seg.payload = payload.to_vec();
        let ip = IpPacket::tcp(client, listen, seg);
        let frame = build_frame(CLIENT_MAC, dst_mac, ip.ethertype(), &ip.emit()?);
        sw.input(InboundFrame {
            vni,
            port: CLIENT_PORT,
            frame,
        });
        Ok(())
    };

    send(&mut sw, 1000, 0, TcpFlags::SYN, &[])?;
    let Some(syn_ack) = segments(&rx)?.into_iter().find(|s| s.flags.syn()) else {
        bail!("no SYN-ACK from {}", listen);
    };
    println!("< {}", syn_ack);
    let snd = syn_ack.seq.wrapping_add(1);
    send(&mut sw, 1001, snd, TcpFlags::ACK, &[])?;

    let Some(mut sock) = sw.with_network(vni, |ctx| server.accept(ctx))?? else {
        bail!("handshake completed but nothing to accept");
    };
    println!("accepted {}", sock);

    send(&mut sw, 1001, snd, TcpFlags::ACK | TcpFlags::PSH, b"ping")?;
    let mut buf = [0u8; 64];
    let n = match sw.with_network(vni, |ctx| sock.read(ctx, &mut buf))?? {
        Read::Bytes(n) => n,
        Read::Eof => bail!("unexpected end of stream"),
    };
    sw.with_network(vni, |ctx| sock.write(ctx, &buf[..n]))??;
    for seg in segments(&rx)? {
        println!("< {}", seg);
    }

    sw.with_network(vni, |ctx| sock.close(ctx))?;
    sw.with_network(vni, |ctx| server.close(ctx))?;
    for seg in segments(&rx)? {
        println!("< {}", seg);
    }
    println!("ok");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::builder()
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Validate { config } => {
            let (sw, _rx) = open(&config)?;
            let networks = sw.networks().count();
            let ips: usize = sw.networks().map(|n| n.ips.len()).sum();
            println!(
                "{}: {} networks, {} synthetic ips",
                config.display(),
                networks,
                ips
            );
        }
        Commands::Tables { config, json } => {
            let (sw, _rx) = open(&config)?;
            if json {
                println!("{}", sw.config().to_json()?);
            } else {
                for net in sw.networks() {
                    print_network(net);
                }
            }
        }
        Commands::Smoke {
            config,
            vni,
            listen,
            client,
        } => smoke(&config, vni, listen, client)?,
    }
    Ok(())
}

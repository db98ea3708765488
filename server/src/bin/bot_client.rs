//! Scripted UDP client that sends bursty, jittered command streams.
//!
//! Commands are generated at a steady client frame rate but held back and
//! flushed in random bursts, which is exactly the traffic antiwarp exists to
//! smooth. Run the server with `--antiwarp-debug` to see the per-client
//! delay reported back in snapshots.

use bincode::{deserialize, serialize};
use clap::Parser;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::network::PROTOCOL_VERSION;
use shared::{Buttons, Packet, Team, UserCmd, Vec3, Weapon};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Play for the allies instead of the axis
    #[arg(long)]
    allies: bool,

    /// How long to play, in seconds
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Client frame interval in ms
    #[arg(long, default_value = "16")]
    frame_msec: u64,

    /// Most commands held back before a forced flush
    #[arg(short, long, default_value = "6")]
    burst: usize,

    /// Extra random delay per flush in ms
    #[arg(short, long, default_value = "40")]
    jitter: u64,

    /// Weapon to fire
    #[arg(short, long, value_enum, default_value = "smg")]
    weapon: WeaponArg,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum WeaponArg {
    Knife,
    Pistol,
    Smg,
    Rifle,
    Shotgun,
}

impl From<WeaponArg> for Weapon {
    fn from(arg: WeaponArg) -> Self {
        match arg {
            WeaponArg::Knife => Weapon::Knife,
            WeaponArg::Pistol => Weapon::Pistol,
            WeaponArg::Smg => Weapon::Smg,
            WeaponArg::Rifle => Weapon::Rifle,
            WeaponArg::Shotgun => Weapon::Shotgun,
        }
    }
}

async fn send(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Sends Connect until the server answers or gives up.
async fn connect(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    team: Team,
) -> Result<(u32, i32), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 4096];
    let packet = Packet::Connect {
        client_version: PROTOCOL_VERSION,
        team,
    };

    for attempt in 1..=5 {
        info!("Sending connection request to {} (attempt {})", server_addr, attempt);
        send(socket, &packet, server_addr).await?;

        let Ok(received) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await else {
            continue;
        };
        let (len, _) = received?;
        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::Connected {
                client_id,
                server_time,
            }) => return Ok((client_id, server_time)),
            Ok(Packet::Disconnected { reason }) => return Err(reason.into()),
            Ok(other) => debug!("Ignoring {:?} while connecting", other),
            Err(e) => warn!("Failed to deserialize response: {}", e),
        }
    }

    Err("server did not answer".into())
}

/// Prints what comes back while the bot plays.
fn spawn_listener(socket: Arc<UdpSocket>, client_id: u32) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut snapshots = 0u32;

        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else {
                break;
            };
            match deserialize::<Packet>(&buf[..len]) {
                Ok(Packet::Snapshot { tick, players, .. }) => {
                    snapshots += 1;
                    if snapshots % 20 == 0 {
                        if let Some(me) = players.iter().find(|p| p.id == client_id) {
                            info!(
                                "tick {}: at ({:.0}, {:.0}) health {} antiwarp delay {}ms",
                                tick, me.origin.x, me.origin.y, me.health, me.antiwarp_delay
                            );
                        }
                    }
                }
                Ok(Packet::HitConfirm {
                    shooter,
                    target,
                    region,
                    distance,
                    ..
                }) if shooter == client_id || target == client_id => {
                    info!(
                        "hit: {} -> {} ({:?}, {:.0} units)",
                        shooter, target, region, distance
                    );
                }
                Ok(Packet::Disconnected { reason }) => {
                    warn!("Disconnected by server: {}", reason);
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to deserialize packet: {}", e),
            }
        }
    });
}

fn next_command(rng: &mut StdRng, server_time: i32, yaw: &mut f32, weapon: Weapon) -> UserCmd {
    *yaw = (*yaw + rng.gen_range(-15.0f32..=15.0)).rem_euclid(360.0);

    let mut cmd = UserCmd::new(server_time);
    cmd.angles = Vec3::new(rng.gen_range(-5.0f32..=5.0), *yaw, 0.0);
    cmd.forward_move = 127;
    cmd.right_move = rng.gen_range(-1i8..=1) * 64;
    cmd.weapon = weapon;
    if rng.gen_bool(0.2) {
        cmd.buttons |= Buttons::ATTACK;
    }
    if rng.gen_bool(0.05) {
        cmd.up_move = -127;
    }
    cmd
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let server_addr = args.server.parse::<SocketAddr>()?;
    let team = if args.allies { Team::Allies } else { Team::Axis };

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    info!("Client socket bound to {}", socket.local_addr()?);

    let (client_id, server_time) = connect(&socket, server_addr, team).await?;
    info!("Connected as client {} at server time {}", client_id, server_time);
    spawn_listener(Arc::clone(&socket), client_id);

    let mut rng = StdRng::from_entropy();
    let started = Instant::now();
    let play_for = Duration::from_secs(args.duration);
    let frame = Duration::from_millis(args.frame_msec.max(1));
    let weapon = Weapon::from(args.weapon);

    let mut sequence = 0u32;
    let mut yaw = 0.0f32;
    let mut held: Vec<UserCmd> = Vec::with_capacity(args.burst.max(1));
    let mut bursts = 0u32;

    while started.elapsed() < play_for {
        sleep(frame).await;

        let now = server_time + started.elapsed().as_millis() as i32;
        held.push(next_command(&mut rng, now, &mut yaw, weapon));

        // Flush at random so the server sees uneven bursts
        if held.len() >= args.burst.max(1) || rng.gen_bool(0.3) {
            if args.jitter > 0 {
                sleep(Duration::from_millis(rng.gen_range(0..=args.jitter))).await;
            }
            for cmd in held.drain(..) {
                sequence += 1;
                send(&socket, &Packet::Command { sequence, cmd }, server_addr).await?;
            }
            bursts += 1;
        }
    }

    send(&socket, &Packet::Disconnect, server_addr).await?;
    info!(
        "Bot finished: {} commands in {} bursts over {:.1}s",
        sequence,
        bursts,
        started.elapsed().as_secs_f32()
    );

    Ok(())
}

use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use server::world::BoxWorld;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Simulation ticks per second
    #[arg(long, default_value_t = shared::DEFAULT_SV_FPS)]
    sv_fps: u32,

    /// Maximum concurrent clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Rewind other players when resolving shots
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    antilag: bool,

    /// Pace bursty command streams over real time
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    antiwarp: bool,

    /// Report each client's antiwarp delay in snapshots
    #[arg(long)]
    antiwarp_debug: bool,

    /// Place head and legs volumes from the skeleton instead of the heuristic
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    real_head: bool,

    /// Snap command times to a fixed movement step
    #[arg(long)]
    pmove_fixed: bool,

    /// Fixed movement step in ms
    #[arg(long, default_value = "8")]
    pmove_msec: i32,

    /// Load the game settings from a saved config file instead of the flags above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective config to this file before starting
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            info!("Loading config from {}", path.display());
            return ServerConfig::load(path);
        }
        Ok(ServerConfig {
            sv_fps: self.sv_fps,
            max_clients: self.max_clients.min(shared::MAX_CLIENTS),
            antilag: self.antilag,
            antiwarp: self.antiwarp,
            antiwarp_debug: self.antiwarp_debug,
            real_head: self.real_head,
            pmove_fixed: self.pmove_fixed,
            pmove_msec: self.pmove_msec,
            ..ServerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.server_config()?;
    if let Some(path) = &args.dump_config {
        config.save(path)?;
        info!("Wrote config to {}", path.display());
    }
    info!("Starting server with {:?}", config);

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config, Box::new(BoxWorld::arena())).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

//! # Lag-Compensated Game Server Library
//!
//! Authoritative server for a small team shooter. The interesting part is
//! not the game, it is how the server keeps hit detection fair for players
//! on slow links and keeps bursty clients from teleporting.
//!
//! ## Lag compensation
//!
//! Every player keeps a short ring of recent poses (`history`). When a shot
//! is fired, the server rewinds every other player to where the shooter saw
//! them at the command's time (`antilag`), traces the shot against those
//! rewound bodies plus head and legs volumes (`hitvolume`), then puts every
//! player back exactly as they were (`backup`). The rewind is scoped by a
//! guard value so the restore cannot be skipped.
//!
//! ## Command smoothing
//!
//! Commands from eligible clients are queued and replayed against a budget
//! of real elapsed time (`antiwarp`). A client whose packets arrive in
//! bursts is paced out over several frames instead of jumping, and a client
//! that falls too far behind has its oldest commands dropped.
//!
//! ## Module Organization
//!
//! - `history`: position history store and time-rewind resolver
//! - `backup`: one-tick backup slot for rewound players
//! - `hitvolume`: head and legs volumes, with a tag evaluator seam
//! - `world`: player directory and the collision trace
//! - `antilag`: historical traces and the rewind window guard
//! - `antiwarp`: command queue, credit and drain
//! - `movement`: minimal movement processor
//! - `entity`: per-client player record
//! - `game`: per-tick simulation driver
//! - `client_manager` / `network`: UDP connections and the tokio server loop
//! - `config`: `ServerConfig` and antiwarp tuning
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::world::BoxWorld;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let mut server = Server::new("127.0.0.1:8080", config, Box::new(BoxWorld::arena())).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod antilag;
pub mod antiwarp;
pub mod backup;
pub mod client_manager;
pub mod config;
pub mod entity;
pub mod game;
pub mod history;
pub mod hitvolume;
pub mod movement;
pub mod network;
pub mod world;

//! Per-tick simulation driver
//!
//! Owns the world and wires player commands through antiwarp, movement and
//! weapon fire. Weapon fire is where lag compensation happens: every shot is
//! traced inside a `HistoricalWindow` opened at the shooter's command time.

use crate::antiwarp::{CommandSink, DrainReport};
use crate::antilag::{HistoricalWindow, TraceRequest};
use crate::config::ServerConfig;
use crate::entity::Player;
use crate::hitvolume::RigidSkeleton;
use crate::movement::pmove;
use crate::world::{World, WorldGeometry};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    angle_vectors, HitRegion, Packet, PlayerSnapshot, Team, UserCmd, Vec3, MAX_TRACE,
};

const SPAWN_DISTANCE: f32 = 256.0;
const SPAWN_SPACING: f32 = 64.0;
/// How far ahead of level time an unsmoothed command may claim to be
pub const CMD_TIME_AHEAD_MSEC: i32 = 200;
/// How far behind level time an unsmoothed command may claim to be
pub const CMD_TIME_BEHIND_MSEC: i32 = 1000;

/// A confirmed hit, reported back to clients
#[derive(Debug, Clone, PartialEq)]
pub struct HitEvent {
    pub shooter: usize,
    pub target: usize,
    pub region: HitRegion,
    pub impact: Vec3,
    pub distance: f32,
    pub killed: bool,
}

impl HitEvent {
    pub fn to_packet(&self) -> Packet {
        Packet::HitConfirm {
            shooter: self.shooter as u32,
            target: self.target as u32,
            region: self.region,
            impact: self.impact,
            distance: self.distance,
        }
    }
}

pub struct GameState {
    pub tick: u32,
    pub config: ServerConfig,
    pub world: World,
    pub intermission: bool,
    events: Vec<HitEvent>,
}

impl GameState {
    pub fn new(config: ServerConfig, geometry: Box<dyn WorldGeometry>) -> Self {
        let mut world = World::new(config.max_clients, geometry);
        if config.real_head {
            world.set_skeleton(Box::new(RigidSkeleton));
        }
        Self {
            tick: 0,
            config,
            world,
            intermission: false,
            events: Vec::new(),
        }
    }

    pub fn level_time(&self) -> i32 {
        self.world.level_time
    }

    /// Connects a new player in the lowest free slot.
    pub fn add_player(&mut self, team: Team, is_bot: bool) -> Option<usize> {
        let client_num = self.world.free_slot()?;
        let now = self.level_time();

        let mut player = Player::new(client_num, team, now);
        player.is_bot = is_bot;
        let (origin, yaw) = spawn_point(client_num, team);
        player.spawn(origin, yaw, now, self.config.frame_msec());

        info!(
            "Added player {} ({:?}) at ({:.0}, {:.0})",
            client_num, team, origin.x, origin.y
        );
        self.world.insert_player(player);
        Some(client_num)
    }

    pub fn remove_player(&mut self, client_num: usize) {
        self.world.remove_player(client_num);
    }

    /// Handles one command from a client as it arrives.
    ///
    /// Smoothed clients get it queued and drained; everyone else runs it
    /// straight away, with its time pulled into a window around level time.
    /// `real_time` is the server's wall clock in ms.
    pub fn client_command(
        &mut self,
        client_num: usize,
        mut cmd: UserCmd,
        real_time: i32,
    ) -> Option<DrainReport> {
        let now = self.level_time();
        let player = self.world.player_mut(client_num)?;

        if player.wants_antiwarp(&self.config, self.intermission, now) {
            player.commands.enqueue(cmd);
            Some(self.drain_commands(client_num, real_time))
        } else {
            let clamped = cmd.server_time.clamp(
                now.saturating_sub(CMD_TIME_BEHIND_MSEC),
                now.saturating_add(CMD_TIME_AHEAD_MSEC),
            );
            if clamped != cmd.server_time {
                debug!(
                    "client {}: command time {} clamped to {}",
                    client_num, cmd.server_time, clamped
                );
                cmd.server_time = clamped;
            }
            self.think(client_num, &cmd);
            None
        }
    }

    /// Drains as much of a client's backlog as its credit allows.
    pub fn drain_commands(&mut self, client_num: usize, real_time: i32) -> DrainReport {
        let Some(player) = self.world.player_mut(client_num) else {
            return DrainReport::default();
        };
        let mut queue = std::mem::take(&mut player.commands);

        let tuning = self.config.antiwarp_tuning;
        let fixed_step = self.config.fixed_step();
        let report = queue.drain(
            real_time,
            &tuning,
            fixed_step,
            &mut ClientThinker {
                game: self,
                client_num,
            },
        );

        if let Some(player) = self.world.player_mut(client_num) {
            player.commands = queue;
            player.antiwarp_delay = report.delay;
        }
        if report.dropped > 0 || report.split > 0 {
            debug!(
                "client {}: ran {} split {} dropped {} delay {}ms",
                client_num, report.processed, report.split, report.dropped, report.delay
            );
        }
        report
    }

    /// Runs one command for one client: movement, then weapon fire.
    fn think(&mut self, client_num: usize, cmd: &UserCmd) {
        let Some((player, geometry)) = self.world.player_with_geometry(client_num) else {
            return;
        };
        player.last_cmd = *cmd;
        pmove(player, cmd, geometry);

        if cmd.is_attacking() {
            self.fire_weapon(client_num);
        }
    }

    /// Fires the shooter's current weapon, compensated for its latency.
    pub fn fire_weapon(&mut self, shooter: usize) {
        let Some(player) = self.world.player(shooter) else {
            return;
        };
        let cmd = player.last_cmd;
        if !player.is_alive() || cmd.server_time < player.next_fire_time {
            return;
        }

        let weapon = cmd.weapon;
        let muzzle = player.pose.origin + Vec3::new(0.0, 0.0, player.pose.view_height as f32);
        let (forward, right, up) = angle_vectors(&player.pose.view_angles);
        let range = weapon.range();
        let spread = weapon.spread() * range / MAX_TRACE;

        // seeded by command time so a replayed command sprays the same way
        let mut rng = StdRng::seed_from_u64(cmd.server_time as u64 ^ ((shooter as u64) << 32));
        let ends: Vec<Vec3> = (0..weapon.pellet_count())
            .map(|_| {
                let r = rng.gen_range(-1.0f32..=1.0) * spread;
                let u = rng.gen_range(-1.0f32..=1.0) * spread;
                muzzle + forward * range + right * r + up * u
            })
            .collect();

        if let Some(player) = self.world.player_mut(shooter) {
            player.next_fire_time = cmd
                .server_time
                .saturating_add(weapon.fire_interval_msec());
        }

        let mut hits = Vec::new();
        {
            let mut window = HistoricalWindow::begin(&mut self.world, &self.config, shooter);
            for end in ends {
                let tr = window.trace(&TraceRequest::ray(muzzle, end, Some(shooter), weapon));
                if let Some(contact) = tr.contact {
                    hits.push((contact.entity, contact.volume.region(), tr.endpos));
                }
            }
        }

        let now = self.level_time();
        for (target, region, impact) in hits {
            let Some(victim) = self.world.player_mut(target) else {
                continue;
            };
            if !victim.is_alive() {
                continue;
            }
            let killed = victim.take_damage(weapon.damage(), now);
            if killed {
                info!("Player {} killed player {} ({:?})", shooter, target, region);
            }
            self.events.push(HitEvent {
                shooter,
                target,
                region,
                impact,
                distance: impact.distance(&muzzle),
                killed,
            });
        }
    }

    /// Advances the level by one tick and returns the hits it produced.
    pub fn run_frame(&mut self, real_time: i32) -> Vec<HitEvent> {
        self.tick += 1;
        self.world.level_time += self.config.frame_msec();
        let now = self.level_time();

        for client_num in self.world.client_nums() {
            let smoothed = self
                .world
                .player(client_num)
                .map(|p| p.wants_antiwarp(&self.config, self.intermission, now))
                .unwrap_or(false);
            if smoothed {
                self.drain_commands(client_num, real_time);
            }
        }

        let frame_msec = self.config.frame_msec();
        for player in self.world.players_mut() {
            if player.should_respawn(now) {
                let (origin, yaw) = spawn_point(player.client_num, player.team);
                player.spawn(origin, yaw, now, frame_msec);
                info!("Player {} respawned", player.client_num);
            }
        }

        for player in self.world.players_mut() {
            player.record_pose(now);
        }

        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> Vec<PlayerSnapshot> {
        self.world
            .players()
            .map(|p| {
                let mut snap = p.snapshot();
                if !self.config.antiwarp_debug {
                    snap.antiwarp_delay = 0;
                }
                snap
            })
            .collect()
    }
}

/// Drain-side view of one client inside the game
struct ClientThinker<'g> {
    game: &'g mut GameState,
    client_num: usize,
}

impl CommandSink for ClientThinker<'_> {
    fn command_time(&self) -> i32 {
        self.game
            .world
            .player(self.client_num)
            .map(|p| p.command_time)
            .unwrap_or(0)
    }

    fn set_command_time(&mut self, time: i32) {
        if let Some(player) = self.game.world.player_mut(self.client_num) {
            player.command_time = time;
        }
    }

    fn speed(&self) -> f32 {
        self.game
            .world
            .player(self.client_num)
            .map(|p| p.velocity.length())
            .unwrap_or(0.0)
    }

    fn in_water(&self) -> bool {
        self.game
            .world
            .player(self.client_num)
            .map(|p| p.water_level > 0)
            .unwrap_or(false)
    }

    fn think(&mut self, cmd: &UserCmd) {
        self.game.think(self.client_num, cmd);
    }
}

/// Teams spawn facing each other across the origin
fn spawn_point(client_num: usize, team: Team) -> (Vec3, f32) {
    let lane = (client_num as f32 * SPAWN_SPACING) % (SPAWN_DISTANCE * 2.0) - SPAWN_DISTANCE;
    match team {
        Team::Axis => (Vec3::new(-SPAWN_DISTANCE, lane, 0.0), 0.0),
        Team::Allies => (Vec3::new(SPAWN_DISTANCE, lane, 0.0), 180.0),
        Team::Spectator => (Vec3::new(0.0, 0.0, 128.0), 0.0),
    }
}

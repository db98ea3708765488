//! Integration tests for lag compensation and command smoothing
//!
//! These tests drive the game through its public entry points and check the
//! cross-module behaviour: history feeding rewinds, rewinds feeding hits,
//! antiwarp pacing movement, and the UDP server speaking the protocol.

use assert_approx_eq::assert_approx_eq;
use bincode::{deserialize, serialize};
use server::config::ServerConfig;
use server::game::GameState;
use server::history::{HistoryStore, Pose};
use server::network::{Server, PROTOCOL_VERSION};
use server::world::{BoxWorld, OpenWorld};
use shared::{Buttons, HitRegion, Packet, Team, UserCmd, Vec3, Weapon};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const FRAME_MSEC: i32 = 50;

fn lag_config(antilag: bool) -> ServerConfig {
    ServerConfig {
        antilag,
        antiwarp: false,
        ..ServerConfig::default()
    }
}

fn place(game: &mut GameState, client_num: usize, origin: Vec3) {
    if let Some(player) = game.world.player_mut(client_num) {
        player.pose.origin = origin;
        player.link();
    }
}

fn fire_at(from: Vec3, at: Vec3, server_time: i32) -> UserCmd {
    let delta = at - from;
    let mut cmd = UserCmd::new(server_time);
    cmd.angles = Vec3::new(0.0, delta.y.atan2(delta.x).to_degrees(), 0.0);
    cmd.weapon = Weapon::Rifle;
    cmd.buttons = Buttons::ATTACK;
    cmd
}

const SECOND_ORIGIN: Vec3 = Vec3::new(0.0, 320.0, 0.0);

struct Range {
    game: GameState,
    shooter: usize,
    /// Idle second shooter standing at `SECOND_ORIGIN`
    second: usize,
    target: usize,
}

/// Shooter at the origin, target strafing along +y at x=300, ten frames of
/// history recorded. The target sits at y = 20 * frame.
fn strafing_target(config: ServerConfig) -> Range {
    let mut game = GameState::new(config, Box::new(OpenWorld));
    let shooter = game.add_player(Team::Allies, false).unwrap_or_default();
    let second = game.add_player(Team::Allies, false).unwrap_or_default();
    let target = game.add_player(Team::Axis, false).unwrap_or_default();
    place(&mut game, shooter, Vec3::ZERO);
    place(&mut game, second, SECOND_ORIGIN);

    for frame in 1..=10 {
        place(&mut game, target, Vec3::new(300.0, 20.0 * frame as f32, 0.0));
        game.run_frame(frame * FRAME_MSEC);
    }
    Range {
        game,
        shooter,
        second,
        target,
    }
}

/// LAG COMPENSATION TESTS
mod lag_compensation_tests {
    use super::*;

    /// A shot aimed where the target was 250ms ago lands with rewind on
    #[test]
    fn lagged_shot_hits_where_target_was() {
        let Range {
            mut game,
            shooter,
            target,
            ..
        } = strafing_target(lag_config(true));
        assert_eq!(game.level_time(), 500);

        // at t=250 the target stood at y=100
        let cmd = fire_at(Vec3::ZERO, Vec3::new(300.0, 100.0, 0.0), 250);
        game.client_command(shooter, cmd, 0);
        let hits = game.run_frame(550);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].shooter, shooter);
        assert_eq!(hits[0].target, target);
        assert!(hits[0].distance > 290.0 && hits[0].distance < 320.0);
    }

    /// The same shot misses when the server only knows the live position
    #[test]
    fn same_shot_misses_without_rewind() {
        let Range {
            mut game, shooter, ..
        } = strafing_target(lag_config(false));

        let cmd = fire_at(Vec3::ZERO, Vec3::new(300.0, 100.0, 0.0), 250);
        game.client_command(shooter, cmd, 0);
        assert!(game.run_frame(550).is_empty());
    }

    /// Every pose is bit-for-bit back in place after a shot
    #[test]
    fn shot_leaves_every_pose_untouched() {
        let Range {
            mut game,
            shooter,
            target,
            ..
        } = strafing_target(lag_config(true));
        let before = game.world.player(target).map(|p| (p.pose, p.abs_min, p.abs_max));

        let cmd = fire_at(Vec3::ZERO, Vec3::new(300.0, 100.0, 0.0), 250);
        game.client_command(shooter, cmd, 0);

        let after = game.world.player(target).map(|p| (p.pose, p.abs_min, p.abs_max));
        assert_eq!(before, after);
        assert!(game.world.attached_volumes().is_empty());
        assert!(game
            .world
            .player(target)
            .map(|p| p.rewound_to.is_none() && p.backup.saved_at().is_none())
            .unwrap_or(false));
    }

    /// Two shooters with different latencies rewind the same bystander in
    /// one tick; each sees it where they saw it.
    #[test]
    fn two_shooters_same_tick_each_see_their_own_past() {
        let Range {
            mut game,
            shooter: first,
            second,
            target,
        } = strafing_target(lag_config(true));
        // two rifle hits would kill a full-health target and swap in a corpse pose
        if let Some(p) = game.world.player_mut(target) {
            p.health = 1000;
        }

        let live = game.world.player(target).map(|p| p.pose);

        // t=250 -> y=100, t=400 -> y=160
        let cmd = fire_at(Vec3::ZERO, Vec3::new(300.0, 100.0, 0.0), 250);
        game.client_command(first, cmd, 0);
        let cmd = fire_at(SECOND_ORIGIN, Vec3::new(300.0, 160.0, 0.0), 400);
        game.client_command(second, cmd, 0);

        let hits = game.run_frame(550);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.target == target));
        assert_approx_eq!(hits[0].impact.y, 100.0, 20.0);
        assert_approx_eq!(hits[1].impact.y, 160.0, 20.0);

        let restored = game.world.player(target).map(|p| (p.pose, p.health));
        // run_frame does not move the target, so the live pose survives both windows
        assert_eq!(restored, live.map(|pose| (pose, 1000 - 2 * Weapon::Rifle.damage())));
    }

    /// Pellets all land on the rewound target, never the live one
    #[test]
    fn shotgun_pellets_share_the_rewound_pose() {
        let Range {
            mut game,
            shooter,
            target,
            ..
        } = strafing_target(lag_config(true));
        place(&mut game, shooter, Vec3::new(200.0, 100.0, 0.0));

        let mut cmd = fire_at(
            Vec3::new(200.0, 100.0, 0.0),
            Vec3::new(300.0, 100.0, 0.0),
            250,
        );
        cmd.weapon = Weapon::Shotgun;
        game.client_command(shooter, cmd, 0);
        let hits = game.run_frame(550);

        assert!(!hits.is_empty());
        assert!(hits.len() <= Weapon::Shotgun.pellet_count() as usize);
        for hit in &hits {
            assert_eq!(hit.target, target);
            assert!(hit.impact.y < 140.0, "pellet hit live pose at y={}", hit.impact.y);
        }
    }

    /// A freshly respawned player can be rewound immediately
    #[test]
    fn respawn_seeds_history_for_immediate_rewind() {
        let mut game = GameState::new(lag_config(true), Box::new(OpenWorld));
        let target = game.add_player(Team::Axis, false).unwrap_or_default();
        let origin = game.world.player(target).map(|p| p.pose.origin).unwrap_or_default();
        let now = game.level_time();

        let resolved = game
            .world
            .player(target)
            .and_then(|p| p.history.resolve(now - 3 * FRAME_MSEC, now));
        assert_eq!(resolved.map(|r| r.pose.origin), Some(origin));
    }

    /// Hits on the head volume are credited to the owner
    #[test]
    fn head_shot_reports_head_region() {
        let Range {
            mut game,
            shooter,
            target,
            ..
        } = strafing_target(lag_config(true));
        let cmd = fire_at(Vec3::ZERO, Vec3::new(300.0, 100.0, 0.0), 250);
        game.client_command(shooter, cmd, 0);
        let hits = game.run_frame(550);

        // eye height 40 clears the 36-unit standing box, so only the head is hit
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target, target);
        assert_eq!(hits[0].region, HitRegion::Head);
    }
}

/// HISTORY TESTS
mod history_tests {
    use super::*;

    /// Capacity 5 seeded at tick 40: recording at t=40 evicts t=-160 and a
    /// resolve at t=20 lands halfway between the two newest snapshots.
    #[test]
    fn capacity_five_store_interpolates_between_newest() {
        let mut store: HistoryStore<5> = HistoryStore::new();
        store.reset(0, &Pose::default(), 40);

        let moved = Pose {
            origin: Vec3::new(100.0, 0.0, 0.0),
            ..Pose::default()
        };
        store.record(40, &moved);

        let times: Vec<i32> = store.iter_newest_first().map(|s| s.time).collect();
        assert_eq!(times, vec![40, 0, -40, -80, -120]);

        let resolved = store.resolve(20, 40).map(|r| r.pose.origin);
        assert_eq!(resolved, Some(Vec3::new(50.0, 0.0, 0.0)));
    }

    /// Resolving at "now" returns the latest record unchanged
    #[test]
    fn resolve_at_now_is_identity_for_players() {
        let Range { game, target, .. } = strafing_target(lag_config(true));
        let now = game.level_time();
        let player = game.world.player(target).unwrap();

        let resolved = player.history.resolve(now, now).map(|r| r.pose);
        assert_eq!(resolved, Some(player.history.latest().pose));
    }
}

/// ANTIWARP TESTS
mod antiwarp_tests {
    use super::*;

    fn smoothing_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.antiwarp_tuning.warmup_msec = 0;
        config
    }

    fn forward(server_time: i32) -> UserCmd {
        let mut cmd = UserCmd::new(server_time);
        cmd.forward_move = 127;
        cmd
    }

    /// A 300ms burst is replayed over several frames, never all at once
    #[test]
    fn burst_is_paced_over_frames() {
        let mut game = GameState::new(smoothing_config(), Box::new(OpenWorld));
        let id = game.add_player(Team::Axis, false).unwrap_or_default();

        for t in (25..=300).step_by(25) {
            game.client_command(id, forward(t), 0);
        }
        let mut last = game.world.player(id).map(|p| p.command_time).unwrap_or(0);
        assert!(last < 300);

        let max_delta = game.config.antiwarp_tuning.max_delta;
        let mut real_time = 0;
        while last < 300 {
            real_time += FRAME_MSEC;
            game.run_frame(real_time);
            let now = game.world.player(id).map(|p| p.command_time).unwrap_or(0);
            let advanced = (now - last) as f32;
            assert!(
                advanced <= (FRAME_MSEC as f32 + max_delta) * 1.05,
                "advanced {}ms in one frame",
                advanced
            );
            last = now;
            assert!(real_time < 2000, "backlog never drained");
        }
    }

    /// Delay is reported while a backlog exists and only in debug mode
    #[test]
    fn snapshot_reports_delay_in_debug_mode() {
        let mut config = smoothing_config();
        config.antiwarp_debug = true;
        let mut game = GameState::new(config, Box::new(OpenWorld));
        let id = game.add_player(Team::Axis, false).unwrap_or_default();

        for t in (25..=300).step_by(25) {
            game.client_command(id, forward(t), 0);
        }
        let snap = game.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].antiwarp_delay > 0);
    }

    /// Bots and freshly connected players skip the queue
    #[test]
    fn bots_and_new_connections_run_immediately() {
        let mut game = GameState::new(ServerConfig::default(), Box::new(OpenWorld));
        let human = game.add_player(Team::Axis, false).unwrap_or_default();
        // still inside the warm-up period
        assert!(game.client_command(human, forward(50), 0).is_none());

        let mut config = smoothing_config();
        config.max_clients = 4;
        let mut game = GameState::new(config, Box::new(OpenWorld));
        let bot = game.add_player(Team::Allies, true).unwrap_or_default();
        assert!(game.client_command(bot, forward(50), 0).is_none());
        assert_eq!(game.world.player(bot).map(|p| p.command_time), Some(50));
    }

    /// A client far behind loses its oldest commands
    #[test]
    fn stale_backlog_is_dropped() {
        let mut game = GameState::new(smoothing_config(), Box::new(OpenWorld));
        let id = game.add_player(Team::Axis, false).unwrap_or_default();

        let mut report = None;
        for t in (50..=1500).step_by(50) {
            report = game.client_command(id, forward(t), 0);
        }
        let report = report.unwrap();
        assert!(report.final_drop_threshold <= game.config.antiwarp_tuning.max_drop_threshold);
        let queued = game.world.player(id).map(|p| p.commands.len()).unwrap_or(0);
        assert!(queued < 30);
    }
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    #[test]
    fn packet_serialization_roundtrip() {
        let test_packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                team: Team::Allies,
            },
            Packet::Command {
                sequence: 42,
                cmd: UserCmd::new(123456),
            },
            Packet::Disconnect,
            Packet::Connected {
                client_id: 3,
                server_time: 1000,
            },
            Packet::Snapshot {
                tick: 7,
                server_time: 350,
                players: vec![],
            },
            Packet::Disconnected {
                reason: "Test".to_string(),
            },
        ];

        for packet in test_packets {
            let serialized = serialize(&packet).unwrap();
            let deserialized: Packet = deserialize(&serialized).unwrap();

            match (&packet, &deserialized) {
                (Packet::Connect { .. }, Packet::Connect { .. }) => {}
                (Packet::Command { .. }, Packet::Command { .. }) => {}
                (Packet::Disconnect, Packet::Disconnect) => {}
                (Packet::Connected { .. }, Packet::Connected { .. }) => {}
                (Packet::Snapshot { .. }, Packet::Snapshot { .. }) => {}
                (Packet::Disconnected { .. }, Packet::Disconnected { .. }) => {}
                _ => panic!("Packet type mismatch after serialization"),
            }
        }
    }

    /// Connects over real UDP and waits for the first snapshot
    #[tokio::test]
    async fn server_accepts_connection_and_streams_snapshots() {
        let config = ServerConfig {
            max_clients: 4,
            ..ServerConfig::default()
        };
        let mut server = Server::new("127.0.0.1:0", config, Box::new(BoxWorld::arena()))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = async move {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let connect = Packet::Connect {
                client_version: PROTOCOL_VERSION,
                team: Team::Axis,
            };
            socket
                .send_to(&serialize(&connect).unwrap(), server_addr)
                .await
                .unwrap();

            let mut buf = [0u8; 4096];
            let mut client_id = None;
            loop {
                let (len, _) = socket.recv_from(&mut buf).await.unwrap();
                match deserialize::<Packet>(&buf[..len]).unwrap() {
                    Packet::Connected { client_id: id, .. } => client_id = Some(id),
                    Packet::Snapshot { players, .. } if client_id.is_some() => {
                        return (client_id, players);
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            result = server.run() => panic!("server stopped early: {:?}", result.err().map(|e| e.to_string())),
            outcome = timeout(Duration::from_secs(3), client) => {
                let (client_id, players) = outcome.expect("no snapshot within 3s");
                assert_eq!(client_id, Some(0));
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].team, Team::Axis);
            }
        }
    }
}

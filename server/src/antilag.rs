//! Historical hit resolution
//!
//! A shot from a lagged client is traced against where every other player
//! was when the client fired, not where they are now:
//!
//! 1. rewind: each eligible bystander's pose is backed up and replaced with
//!    the pose resolved from its history at the shooter's command time
//! 2. attach head and legs volumes for every combatant, corpses included
//! 3. adjust body heights by stance and trace
//! 4. if a head or legs volume was hit, credit its owner and pull the
//!    impact back towards the shooter
//! 5. detach the volumes and restore every rewound pose
//!
//! `HistoricalWindow` brackets steps 1 and 5 so several traces (shotgun
//! pellets) can share one rewind. It restores on drop, so an early return
//! can never leave a bystander stuck in the past.

use crate::config::ServerConfig;
use crate::hitvolume::{HitVolume, VolumeBuilder, VolumeKind};
use crate::world::{TraceResult, World};
use log::trace;
use shared::{Contents, EntityFlags, Vec3, Weapon, CROUCH_BODYHEIGHT, MASK_SHOT};

/// Distance an impact on a head or legs volume is pulled back along the shot
pub const REATTRIBUTE_NUDGE: f32 = 1.0;

/// One collision cast
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRequest {
    pub start: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub end: Vec3,
    /// Entity the trace passes through, normally the shooter
    pub pass: Option<usize>,
    pub mask: Contents,
    /// Weapon doing the tracing; melee widens low targets
    pub weapon: Weapon,
}

impl TraceRequest {
    /// A point trace for a bullet
    pub fn ray(start: Vec3, end: Vec3, pass: Option<usize>, weapon: Weapon) -> Self {
        Self {
            start,
            mins: Vec3::ZERO,
            maxs: Vec3::ZERO,
            end,
            pass,
            mask: MASK_SHOT,
            weapon,
        }
    }
}

/// Traces `request` for `shooter`, rewinding everyone else when lag
/// compensation is on and the shooter is a connected player.
pub fn historical_trace(
    world: &mut World,
    config: &ServerConfig,
    shooter: Option<usize>,
    request: &TraceRequest,
) -> TraceResult {
    match shooter {
        Some(client_num) if config.antilag && world.player(client_num).is_some() => {
            let mut window = HistoricalWindow::begin(world, config, client_num);
            window.trace(request)
        }
        _ => unlagged_trace(world, config.real_head, shooter, request),
    }
}

/// Rewind bracket for a series of traces by one shooter
///
/// Dropping the window restores every player it rewound.
pub struct HistoricalWindow<'w> {
    world: &'w mut World,
    shooter: usize,
    now: i32,
    real_head: bool,
    rewound: Vec<usize>,
}

impl<'w> HistoricalWindow<'w> {
    /// Rewinds every eligible player other than `shooter` to the shooter's
    /// last command time. Does nothing when lag compensation is off.
    pub fn begin(world: &'w mut World, config: &ServerConfig, shooter: usize) -> Self {
        let now = world.level_time;
        let mut rewound = Vec::new();

        let target_time = world.player(shooter).map(|p| p.last_cmd.server_time);
        if let (true, Some(target_time)) = (config.antilag, target_time) {
            for client_num in world.client_nums() {
                if client_num == shooter {
                    continue;
                }
                let Some(player) = world.player_mut(client_num) else {
                    continue;
                };
                if !player.is_rewind_safe(now) {
                    continue;
                }
                let Some(resolved) = player.history.resolve(target_time, now) else {
                    trace!(
                        "player {} has no history for t={}, tracing live",
                        client_num,
                        target_time
                    );
                    continue;
                };

                player.backup.save_if_absent(&player.pose, now);
                player.pose = resolved.pose;
                player.rewound_to = Some(resolved.anim_time);
                player.link();
                rewound.push(client_num);
            }
        }

        Self {
            world,
            shooter,
            now,
            real_head: config.real_head,
            rewound,
        }
    }

    /// Players currently shown at a historical pose
    pub fn rewound(&self) -> &[usize] {
        &self.rewound
    }

    pub fn world(&self) -> &World {
        &*self.world
    }

    pub fn trace(&mut self, request: &TraceRequest) -> TraceResult {
        unlagged_trace(&mut *self.world, self.real_head, Some(self.shooter), request)
    }

    /// Closes the window; same as dropping it.
    pub fn end(self) {}
}

impl Drop for HistoricalWindow<'_> {
    fn drop(&mut self) {
        for &client_num in &self.rewound {
            if let Some(player) = self.world.player_mut(client_num) {
                player.backup.restore(&mut player.pose, self.now);
                player.rewound_to = None;
                player.link();
            }
        }
    }
}

/// Traces against the poses players have right now, which inside a window
/// are the rewound ones.
pub fn unlagged_trace(
    world: &mut World,
    real_head: bool,
    shooter: Option<usize>,
    request: &TraceRequest,
) -> TraceResult {
    let volumes = build_body_parts(world, real_head, shooter);
    for volume in volumes {
        world.attach_volume(volume);
    }

    let heights = adjust_hitbox_heights(world, request.weapon);
    let mut result = world.trace(
        &request.start,
        &request.mins,
        &request.maxs,
        &request.end,
        request.pass,
        request.mask,
    );
    for (client_num, max_z) in heights {
        if let Some(player) = world.player_mut(client_num) {
            player.pose.maxs.z = max_z;
        }
    }

    reattribute(&mut result, request);
    world.detach_volumes();
    result
}

/// Head and legs volumes for every combatant except the shooter, corpses included
fn build_body_parts(world: &World, real_head: bool, shooter: Option<usize>) -> Vec<HitVolume> {
    let now = world.level_time;
    let builder = match world.skeleton() {
        Some(tags) if real_head => VolumeBuilder::realistic(tags),
        _ => VolumeBuilder::heuristic(),
    };

    let mut volumes = Vec::new();
    for player in world.players() {
        if Some(player.client_num) == shooter || !player.can_attach_body_parts() {
            continue;
        }
        let anim_time = player.anim_instant(now);
        volumes.push(builder.build_head(player.client_num, &player.pose, anim_time));
        if let Some(legs) = builder.build_legs(player.client_num, &player.pose, anim_time) {
            volumes.push(legs);
        }
    }
    volumes
}

/// Sets every player's box top for the cast; returns the old tops.
fn adjust_hitbox_heights(world: &mut World, weapon: Weapon) -> Vec<(usize, f32)> {
    let mut saved = Vec::new();
    for player in world.players_mut() {
        saved.push((player.client_num, player.pose.maxs.z));
        let lying = player
            .pose
            .e_flags
            .intersects(EntityFlags::DEAD | EntityFlags::PRONE);
        player.pose.maxs.z = if weapon.is_melee() && lying {
            CROUCH_BODYHEIGHT
        } else {
            player.hitbox_max_z()
        };
    }
    saved
}

/// Pulls an impact on a head or legs volume back towards the start, so the
/// reported distance reflects the body rather than the oversized proxy.
fn reattribute(result: &mut TraceResult, request: &TraceRequest) {
    let Some(contact) = result.contact else {
        return;
    };
    if contact.volume == VolumeKind::Owner {
        return;
    }

    let travelled = result.endpos.distance(&request.start);
    let total = request.end.distance(&request.start);
    if travelled <= 0.0 || total <= 0.0 {
        return;
    }

    // never pull back past the midpoint so the impact stays ahead of the muzzle
    let nudge = REATTRIBUTE_NUDGE.min(travelled / 2.0);
    let dir = (request.end - request.start).normalize();
    result.endpos = result.endpos.mul_add(-nudge, &dir);
    result.fraction = (travelled - nudge) / total;
}

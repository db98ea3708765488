//! Minimal movement processor
//!
//! Turns one user command into a new pose. Movement is flat and
//! instantaneous: no gravity, no acceleration, just the requested direction
//! at stance speed, clipped against world geometry.

use crate::entity::Player;
use crate::world::WorldGeometry;
use shared::{
    angle_vectors, Buttons, Contents, EntityFlags, MoveFlags, PmType, UserCmd, Vec3,
    CROUCH_BODYHEIGHT, CROUCH_VIEWHEIGHT, DEFAULT_VIEWHEIGHT, MASK_PLAYERSOLID, PLAYER_MAXS,
    PLAYER_SPEED, PRONE_BBOX_MAXZ, PRONE_VIEWHEIGHT,
};

/// Longest slice of time a single command may move a player
pub const MAX_MOVE_MSEC: i32 = 200;
const CROUCH_SPEED_SCALE: f32 = 0.5;
const PRONE_SPEED_SCALE: f32 = 0.2;
const WALK_SPEED_SCALE: f32 = 0.5;
const ANIM_FRAME_MSEC: i32 = 50;
const RUN_ANIM_FRAMES: i32 = 20;

/// Runs `cmd` for `player`. Always leaves `command_time` at the command's time.
pub fn pmove(player: &mut Player, cmd: &UserCmd, geometry: &dyn WorldGeometry) {
    let msec = cmd
        .server_time
        .saturating_sub(player.command_time)
        .min(MAX_MOVE_MSEC);
    player.command_time = cmd.server_time;
    if msec < 1 {
        return;
    }

    match player.pm_type {
        PmType::Dead => {
            player.velocity = Vec3::ZERO;
            return;
        }
        PmType::Spectator | PmType::Noclip => {
            player.pose.view_angles = cmd.angles;
            return;
        }
        PmType::Normal => {}
    }

    player.pose.view_angles = cmd.angles;
    player.pose.pm_flags.remove(MoveFlags::RESPAWNED);
    update_stance(player, cmd);

    let speed = PLAYER_SPEED * stance_speed_scale(player, cmd);
    let (mut forward, mut right, _) = angle_vectors(&Vec3::new(0.0, cmd.angles.y, 0.0));
    forward.z = 0.0;
    right.z = 0.0;

    let wish = forward * cmd.forward_move as f32 + right * cmd.right_move as f32;
    let amount = crate::antiwarp::command_scale(cmd, player.water_level > 0);
    player.velocity = wish.normalize() * (speed * amount);

    let step = player.velocity * (msec as f32 / 1000.0);
    if step != Vec3::ZERO {
        let start = player.pose.origin;
        let end = start + step;
        let fraction = geometry.trace(
            &start,
            &player.pose.mins,
            &player.pose.maxs,
            &end,
            MASK_PLAYERSOLID,
        );
        // stop just short of whatever was hit
        let travel = (fraction * step.length() - 0.125).max(0.0);
        player.pose.origin = start.mul_add(travel, &step.normalize());
    }

    let feet = player.pose.origin + Vec3::new(0.0, 0.0, player.pose.mins.z + 1.0);
    player.water_level = u8::from(geometry.point_contents(&feet).contains(Contents::WATER));

    player
        .pose
        .e_flags
        .set(EntityFlags::FIRING, cmd.buttons.contains(Buttons::ATTACK));
    animate(player, cmd);
    player.link();
}

fn update_stance(player: &mut Player, cmd: &UserCmd) {
    let pose = &mut player.pose;
    if cmd.buttons.contains(Buttons::PRONE) {
        pose.e_flags.insert(EntityFlags::PRONE);
        pose.e_flags.remove(EntityFlags::CROUCHING);
        pose.pm_flags.remove(MoveFlags::DUCKED);
        pose.view_height = PRONE_VIEWHEIGHT;
        pose.maxs.z = PRONE_BBOX_MAXZ;
    } else if cmd.up_move < 0 {
        pose.e_flags.remove(EntityFlags::PRONE);
        pose.e_flags.insert(EntityFlags::CROUCHING);
        pose.pm_flags.insert(MoveFlags::DUCKED);
        pose.view_height = CROUCH_VIEWHEIGHT;
        pose.maxs.z = CROUCH_BODYHEIGHT;
    } else {
        pose.e_flags.remove(EntityFlags::PRONE | EntityFlags::CROUCHING);
        pose.pm_flags.remove(MoveFlags::DUCKED);
        pose.view_height = DEFAULT_VIEWHEIGHT;
        pose.maxs.z = PLAYER_MAXS.z;
    }
}

fn stance_speed_scale(player: &Player, cmd: &UserCmd) -> f32 {
    let mut scale = 1.0;
    if player.pose.e_flags.contains(EntityFlags::PRONE) {
        scale *= PRONE_SPEED_SCALE;
    } else if player.pose.pm_flags.contains(MoveFlags::DUCKED) {
        scale *= CROUCH_SPEED_SCALE;
    }
    if cmd.buttons.contains(Buttons::WALK) {
        scale *= WALK_SPEED_SCALE;
    }
    scale
}

/// Advances torso and legs frames so history has animation state to carry.
fn animate(player: &mut Player, cmd: &UserCmd) {
    let frame = (cmd.server_time / ANIM_FRAME_MSEC).rem_euclid(RUN_ANIM_FRAMES);
    let moving = player.velocity != Vec3::ZERO;

    let legs = &mut player.pose.legs;
    if moving && legs.frame != frame {
        legs.old_frame = legs.frame;
        legs.old_frame_time = legs.frame_time;
        legs.frame = frame;
        legs.frame_time = cmd.server_time;
    }
    legs.yaw_angle = cmd.angles.y;
    legs.yawing = moving;

    let torso = &mut player.pose.torso;
    torso.yaw_angle = cmd.angles.y;
    torso.pitch_angle = cmd.angles.x;
    torso.pitching = torso.pitch_angle != 0.0;
}

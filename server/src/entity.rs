//! Per-connection player record
//!
//! A `Player` owns everything lag compensation needs for one client: its
//! pose history, the rewind backup slot and the queued command backlog.
//! They live as long as the connection and are reset, not recreated, on
//! respawn.

use crate::antiwarp::{self, CommandQueue};
use crate::backup::BackupSlot;
use crate::config::ServerConfig;
use crate::history::{HistoryStore, Pose};
use shared::{
    Contents, EntityFlags, MoveFlags, PlayerSnapshot, PmType, Team, UserCmd, Vec3,
    CROUCH_BODYHEIGHT, CROUCH_IDLE_BODYHEIGHT, DEAD_BBOX_MAXZ, DEAD_BODYHEIGHT, DEAD_VIEWHEIGHT,
    DEFAULT_BODYHEIGHT, DEFAULT_VIEWHEIGHT, PLAYER_MAXS, PLAYER_MINS, PRONE_BODYHEIGHT,
};

pub const MAX_HEALTH: i32 = 100;
pub const RESPAWN_DELAY_MSEC: i32 = 3000;

#[derive(Debug, Clone)]
pub struct Player {
    pub client_num: usize,
    pub team: Team,
    pub health: i32,
    pub pm_type: PmType,
    pub pose: Pose,
    pub velocity: Vec3,
    /// Server time of the last command run through movement
    pub command_time: i32,
    pub water_level: u8,
    pub linked: bool,
    pub abs_min: Vec3,
    pub abs_max: Vec3,
    pub is_bot: bool,
    pub connect_time: i32,
    pub death_time: Option<i32>,
    pub next_fire_time: i32,
    pub last_cmd: UserCmd,
    /// Snapshot time the current pose was rewound to, if it is rewound
    pub rewound_to: Option<i32>,
    pub history: HistoryStore,
    pub backup: BackupSlot,
    pub commands: CommandQueue,
    /// Last measured gap between newest queued command and command time
    pub antiwarp_delay: i32,
}

impl Player {
    pub fn new(client_num: usize, team: Team, connect_time: i32) -> Self {
        Self {
            client_num,
            team,
            health: MAX_HEALTH,
            pm_type: PmType::Normal,
            pose: standing_pose(Vec3::ZERO, 0.0),
            velocity: Vec3::ZERO,
            command_time: connect_time,
            water_level: 0,
            linked: false,
            abs_min: Vec3::ZERO,
            abs_max: Vec3::ZERO,
            is_bot: false,
            connect_time,
            death_time: None,
            next_fire_time: 0,
            last_cmd: UserCmd::new(connect_time),
            rewound_to: None,
            history: HistoryStore::new(),
            backup: BackupSlot::new(),
            commands: CommandQueue::new(),
            antiwarp_delay: 0,
        }
    }

    /// Puts the player back in play at `origin` and reseeds its history.
    pub fn spawn(&mut self, origin: Vec3, yaw: f32, now: i32, frame_msec: i32) {
        self.health = MAX_HEALTH;
        self.pm_type = if self.team.is_combatant() {
            PmType::Normal
        } else {
            PmType::Spectator
        };
        self.pose = standing_pose(origin, yaw);
        self.velocity = Vec3::ZERO;
        self.death_time = None;
        self.rewound_to = None;
        self.backup.clear();
        self.commands.clear();
        self.antiwarp_delay = 0;
        self.pose.pm_flags.insert(MoveFlags::RESPAWNED);
        self.link();
        self.reset_history(now, frame_msec);
    }

    /// Whether rewinding this player is safe and meaningful at level time `now`
    pub fn is_rewind_safe(&self, now: i32) -> bool {
        if !self.linked || !self.team.is_combatant() {
            return false;
        }
        if self.pose.pm_flags.contains(MoveFlags::LIMBO) {
            return false;
        }
        // the tick a player dies it still counts, so the corpse lands where it was shot
        if self.pm_type == PmType::Dead && self.death_time == Some(now) {
            return true;
        }
        if self.health <= 0 || self.pm_type != PmType::Normal {
            return false;
        }
        !self.pose.e_flags.contains(EntityFlags::MOUNTED_TANK)
    }

    /// Whether head and legs volumes go on this player for a trace.
    ///
    /// Wider than rewind safety: corpses keep their volumes after the
    /// death tick, so a lying body can still be shot in the legs.
    pub fn can_attach_body_parts(&self) -> bool {
        self.linked
            && self.team.is_combatant()
            && !self.pose.pm_flags.contains(MoveFlags::LIMBO)
            && matches!(self.pm_type, PmType::Normal | PmType::Dead)
    }

    /// Appends the live pose to history if the player is eligible.
    pub fn record_pose(&mut self, now: i32) -> bool {
        if !self.is_rewind_safe(now) {
            return false;
        }
        self.history.record(now, &self.pose);
        true
    }

    pub fn reset_history(&mut self, now: i32, frame_msec: i32) {
        self.history.reset(now, &self.pose, frame_msec);
    }

    /// Time at which head and legs should be evaluated: the rewound
    /// snapshot's time, or `now` for a live pose.
    pub fn anim_instant(&self, now: i32) -> i32 {
        self.rewound_to.unwrap_or(now)
    }

    pub fn contents(&self) -> Contents {
        if self.pose.e_flags.contains(EntityFlags::DEAD) {
            Contents::CORPSE
        } else {
            Contents::BODY
        }
    }

    /// Top of the box bullets are traced against, by stance
    pub fn hitbox_max_z(&self) -> f32 {
        let flags = self.pose.e_flags;
        if flags.contains(EntityFlags::DEAD) {
            DEAD_BODYHEIGHT
        } else if flags.contains(EntityFlags::PRONE) {
            PRONE_BODYHEIGHT
        } else if self.pose.pm_flags.contains(MoveFlags::DUCKED) {
            if self.velocity == Vec3::ZERO {
                CROUCH_IDLE_BODYHEIGHT
            } else {
                CROUCH_BODYHEIGHT
            }
        } else {
            DEFAULT_BODYHEIGHT
        }
    }

    /// Recomputes the broad-phase box from the current pose.
    pub fn link(&mut self) {
        let mut maxs = self.pose.maxs;
        // room for the taller melee box used against low targets
        maxs.z = maxs.z.max(CROUCH_BODYHEIGHT);
        self.abs_min = self.pose.origin + self.pose.mins - Vec3::splat(1.0);
        self.abs_max = self.pose.origin + maxs + Vec3::splat(1.0);
        self.linked = true;
    }

    pub fn unlink(&mut self) {
        self.linked = false;
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0 && self.pm_type == PmType::Normal
    }

    /// Applies damage; returns true if this hit killed the player.
    pub fn take_damage(&mut self, amount: i32, now: i32) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.health -= amount;
        if self.health <= 0 {
            self.die(now);
            return true;
        }
        false
    }

    fn die(&mut self, now: i32) {
        self.pm_type = PmType::Dead;
        self.death_time = Some(now);
        self.velocity = Vec3::ZERO;
        self.pose.e_flags.remove(EntityFlags::PRONE | EntityFlags::CROUCHING | EntityFlags::FIRING);
        self.pose.e_flags.insert(EntityFlags::DEAD);
        self.pose.pm_flags.remove(MoveFlags::DUCKED);
        self.pose.view_height = DEAD_VIEWHEIGHT;
        self.pose.maxs.z = DEAD_BBOX_MAXZ;
        self.link();
    }

    pub fn should_respawn(&self, now: i32) -> bool {
        matches!(self.death_time, Some(died) if now - died >= RESPAWN_DELAY_MSEC)
    }

    pub fn wants_antiwarp(&self, config: &ServerConfig, intermission: bool, now: i32) -> bool {
        antiwarp::wants_antiwarp(
            config,
            intermission,
            self.team,
            self.pose.pm_flags,
            self.is_bot,
            now - self.connect_time,
        )
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.client_num as u32,
            team: self.team,
            origin: self.pose.origin,
            view_angles: self.pose.view_angles,
            velocity: self.velocity,
            e_flags: self.pose.e_flags,
            health: self.health,
            antiwarp_delay: self.antiwarp_delay,
        }
    }
}

fn standing_pose(origin: Vec3, yaw: f32) -> Pose {
    Pose {
        origin,
        mins: PLAYER_MINS,
        maxs: PLAYER_MAXS,
        view_angles: Vec3::new(0.0, yaw, 0.0),
        view_height: DEFAULT_VIEWHEIGHT,
        ..Default::default()
    }
}

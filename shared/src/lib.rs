use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub mod math;

pub use math::{angle_normalize180, angle_vectors, lerp_angle, Vec3, PITCH, ROLL, YAW};

pub const DEFAULT_SV_FPS: u32 = 20;
pub const PLAYER_SPEED: f32 = 320.0;
pub const CMD_MOVE_MAX: f32 = 127.0;
pub const MAX_TRACE: f32 = 8192.0;
pub const MAX_CLIENTS: usize = 64;

pub const DEFAULT_VIEWHEIGHT: i32 = 40;
pub const CROUCH_VIEWHEIGHT: i32 = 16;
pub const DEAD_VIEWHEIGHT: i32 = -16;
pub const PRONE_VIEWHEIGHT: i32 = -8;

pub const DEFAULT_BODYHEIGHT: f32 = 36.0;
pub const CROUCH_BODYHEIGHT: f32 = 24.0;
pub const CROUCH_IDLE_BODYHEIGHT: f32 = 18.0;
pub const DEAD_BODYHEIGHT: f32 = 4.0;
pub const PRONE_BODYHEIGHT: f32 = -8.0;

pub const PLAYER_MINS: Vec3 = Vec3::new(-18.0, -18.0, -24.0);
pub const PLAYER_MAXS: Vec3 = Vec3::new(18.0, 18.0, 48.0);
/// Lowest box top that keeps a prone player from sticking in the floor.
pub const PRONE_BBOX_MAXZ: f32 = 12.0;
pub const DEAD_BBOX_MAXZ: f32 = 24.0;

bitflags! {
    /// Entity state flags that travel with the pose.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EntityFlags: u32 {
        const DEAD = 1 << 0;
        const PRONE = 1 << 1;
        const CROUCHING = 1 << 2;
        const MOUNTED_TANK = 1 << 3;
        const FIRING = 1 << 4;
    }
}

bitflags! {
    /// Movement processor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MoveFlags: u32 {
        const DUCKED = 1 << 0;
        const LIMBO = 1 << 1;
        const TIME_LOCKPLAYER = 1 << 2;
        const RESPAWNED = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Contents: u32 {
        const SOLID = 1 << 0;
        const WATER = 1 << 1;
        const BODY = 1 << 2;
        const CORPSE = 1 << 3;
    }
}

pub const MASK_SHOT: Contents = Contents::SOLID.union(Contents::BODY).union(Contents::CORPSE);
pub const MASK_PLAYERSOLID: Contents = Contents::SOLID.union(Contents::BODY);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Buttons: u32 {
        const ATTACK = 1 << 0;
        const WALK = 1 << 1;
        const PRONE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Team {
    Axis,
    Allies,
    #[default]
    Spectator,
}

impl Team {
    pub fn is_combatant(&self) -> bool {
        matches!(self, Team::Axis | Team::Allies)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PmType {
    #[default]
    Normal,
    Dead,
    Spectator,
    Noclip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Weapon {
    Knife,
    Syringe,
    Pistol,
    #[default]
    Smg,
    Rifle,
    Shotgun,
}

impl Weapon {
    /// Melee-class weapons get the taller crouch box against low targets.
    pub fn is_melee(&self) -> bool {
        matches!(self, Weapon::Knife | Weapon::Syringe)
    }

    pub fn range(&self) -> f32 {
        match self {
            Weapon::Knife | Weapon::Syringe => 48.0,
            _ => MAX_TRACE,
        }
    }

    pub fn pellet_count(&self) -> u32 {
        match self {
            Weapon::Shotgun => 8,
            _ => 1,
        }
    }

    /// Flat damage per hit (per pellet for the shotgun).
    pub fn damage(&self) -> i32 {
        match self {
            Weapon::Knife => 50,
            Weapon::Syringe => 10,
            Weapon::Pistol => 18,
            Weapon::Smg => 14,
            Weapon::Rifle => 60,
            Weapon::Shotgun => 12,
        }
    }

    pub fn fire_interval_msec(&self) -> i32 {
        match self {
            Weapon::Knife | Weapon::Syringe => 400,
            Weapon::Pistol => 150,
            Weapon::Smg => 100,
            Weapon::Rifle => 1000,
            Weapon::Shotgun => 800,
        }
    }

    /// Cone half-width in units at 8192 units of travel.
    pub fn spread(&self) -> f32 {
        match self {
            Weapon::Shotgun => 700.0,
            Weapon::Smg => 150.0,
            Weapon::Pistol => 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitRegion {
    Body,
    Head,
    Legs,
}

/// One input command as produced by a client for one client frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UserCmd {
    /// Server time the client believed it was when the command was made (ms).
    pub server_time: i32,
    pub angles: Vec3,
    pub buttons: Buttons,
    pub weapon: Weapon,
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

impl UserCmd {
    pub fn new(server_time: i32) -> Self {
        Self {
            server_time,
            ..Default::default()
        }
    }

    pub fn is_attacking(&self) -> bool {
        self.buttons.contains(Buttons::ATTACK)
    }
}

/// Per-player state sent to clients each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: u32,
    pub team: Team,
    pub origin: Vec3,
    pub view_angles: Vec3,
    pub velocity: Vec3,
    pub e_flags: EntityFlags,
    pub health: i32,
    /// How far behind the newest queued command this player is being simulated (ms).
    pub antiwarp_delay: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        team: Team,
    },
    Command {
        sequence: u32,
        cmd: UserCmd,
    },
    Disconnect,

    Connected {
        client_id: u32,
        server_time: i32,
    },
    Snapshot {
        tick: u32,
        server_time: i32,
        players: Vec<PlayerSnapshot>,
    },
    HitConfirm {
        shooter: u32,
        target: u32,
        region: HitRegion,
        impact: Vec3,
        distance: f32,
    },
    Disconnected {
        reason: String,
    },
}

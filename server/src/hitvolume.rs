//! Transient head and legs hit volumes
//!
//! Right before a shot is traced, each potential target gets a small head box
//! and, when lying down, a legs box. They live only for that one cast.
//!
//! Two ways to place them:
//! - realistic: ask a `TagEvaluator` for skeleton anchor points at the
//!   pose's animation instant
//! - heuristic: offset from the view angles by stance, which works for any
//!   model because it needs nothing but angles and flags
//!
//! The realistic path falls back to the heuristic one whenever a tag is
//! missing.

use crate::history::Pose;
use shared::{
    angle_normalize180, angle_vectors, Contents, EntityFlags, HitRegion, MoveFlags, Vec3,
    CROUCH_VIEWHEIGHT,
};

pub const HEAD_MINS: Vec3 = Vec3::new(-6.0, -6.0, -2.0);
pub const HEAD_MAXS: Vec3 = Vec3::new(6.0, 6.0, 10.0);
pub const LEGS_MINS: Vec3 = Vec3::new(-13.5, -13.5, -24.0);
pub const LEGS_MAXS: Vec3 = Vec3::new(13.5, 13.5, -14.4);

const HEAD_UP: f32 = 18.0;
const HEAD_FORWARD_UPRIGHT: f32 = 5.0;
const HEAD_FORWARD_PRONE: f32 = 24.0;
const HEAD_FORWARD_DEAD: f32 = -24.0;
const PRONE_HEAD_DROP: i32 = 56;
const DEAD_HEAD_DROP: i32 = 40;
const CROUCH_HEAD_DROP: i32 = 12;
/// Pitch scale that matches where the model's head actually sits.
const HEAD_PITCH_SCALE: f32 = 0.75;
/// Looking further down than this while prone would push the head into the floor.
const PRONE_MAX_PITCH: f32 = 15.0;

const LEGS_OFFSET: f32 = 32.0;
const PRONE_LEGS_Z_OFFSET: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// The player's own bounding box
    Owner,
    Head,
    Legs,
}

impl VolumeKind {
    pub fn region(self) -> HitRegion {
        match self {
            VolumeKind::Owner => HitRegion::Body,
            VolumeKind::Head => HitRegion::Head,
            VolumeKind::Legs => HitRegion::Legs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stance {
    Standing,
    Crouched,
    Prone,
    Dead,
}

impl Stance {
    pub fn of(pose: &Pose) -> Stance {
        if pose.e_flags.contains(EntityFlags::DEAD) {
            Stance::Dead
        } else if pose.e_flags.contains(EntityFlags::PRONE) {
            Stance::Prone
        } else if pose.pm_flags.contains(MoveFlags::DUCKED)
            || pose.e_flags.contains(EntityFlags::CROUCHING)
        {
            Stance::Crouched
        } else {
            Stance::Standing
        }
    }

    pub fn is_lying(self) -> bool {
        matches!(self, Stance::Prone | Stance::Dead)
    }
}

/// A box that a trace can hit, owned by a player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitVolume {
    pub kind: VolumeKind,
    pub owner: usize,
    pub origin: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: Contents,
}

impl HitVolume {
    pub fn abs_min(&self) -> Vec3 {
        self.origin + self.mins
    }

    pub fn abs_max(&self) -> Vec3 {
        self.origin + self.maxs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorTag {
    Head,
    FootLeft,
    FootRight,
}

impl AnchorTag {
    pub fn name(self) -> &'static str {
        match self {
            AnchorTag::Head => "tag_head",
            AnchorTag::FootLeft => "tag_footleft",
            AnchorTag::FootRight => "tag_footright",
        }
    }
}

/// Evaluates named skeleton anchors for an animated pose
pub trait TagEvaluator {
    /// World position of `tag` for `pose` at animation instant `anim_time`,
    /// or `None` if the model has no such tag.
    fn tag_origin(&self, pose: &Pose, anim_time: i32, tag: AnchorTag) -> Option<Vec3>;
}

/// Skeleton with fixed per-stance anchor offsets, rotated by view yaw
///
/// Stands in for a real animation system; it ignores the animation instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigidSkeleton;

impl RigidSkeleton {
    /// (forward, side, up) offset of a tag for a stance
    fn local_offset(stance: Stance, view_height: i32, tag: AnchorTag) -> Vec3 {
        let side = match tag {
            AnchorTag::FootLeft => 6.0,
            AnchorTag::FootRight => -6.0,
            AnchorTag::Head => 0.0,
        };
        match (stance, tag) {
            (Stance::Standing, AnchorTag::Head) => Vec3::new(4.0, 0.0, view_height as f32 - 2.0),
            (Stance::Crouched, AnchorTag::Head) => {
                Vec3::new(6.0, 0.0, CROUCH_VIEWHEIGHT as f32 - 2.0)
            }
            (Stance::Prone, AnchorTag::Head) => Vec3::new(28.0, 0.0, -16.0),
            (Stance::Dead, AnchorTag::Head) => Vec3::new(-28.0, 0.0, -18.0),
            (Stance::Prone, _) => Vec3::new(-36.0, side, -20.0),
            (Stance::Dead, _) => Vec3::new(36.0, side, -20.0),
            (_, _) => Vec3::new(0.0, side, -22.0),
        }
    }
}

impl TagEvaluator for RigidSkeleton {
    fn tag_origin(&self, pose: &Pose, _anim_time: i32, tag: AnchorTag) -> Option<Vec3> {
        let local = Self::local_offset(Stance::of(pose), pose.view_height, tag);
        let (forward, right, _) = angle_vectors(&Vec3::new(0.0, pose.view_angles.y, 0.0));
        let offset = forward * local.x + right * -local.y + Vec3::new(0.0, 0.0, local.z);
        Some(pose.origin + offset)
    }
}

/// Places head and legs volumes for one trace
#[derive(Clone, Copy, Default)]
pub struct VolumeBuilder<'a> {
    realistic: Option<&'a dyn TagEvaluator>,
}

impl<'a> VolumeBuilder<'a> {
    pub fn heuristic() -> Self {
        Self { realistic: None }
    }

    pub fn realistic(tags: &'a dyn TagEvaluator) -> Self {
        Self {
            realistic: Some(tags),
        }
    }

    /// Head box for `owner`'s `pose`; `anim_time` is the live level time or,
    /// for a rewound player, the historical snapshot time.
    pub fn build_head(&self, owner: usize, pose: &Pose, anim_time: i32) -> HitVolume {
        let origin = self
            .realistic
            .and_then(|tags| tags.tag_origin(pose, anim_time, AnchorTag::Head))
            .unwrap_or_else(|| heuristic_head_origin(pose));

        HitVolume {
            kind: VolumeKind::Head,
            owner,
            origin,
            mins: HEAD_MINS,
            maxs: HEAD_MAXS,
            contents: Contents::BODY,
        }
    }

    /// Legs box, only for prone or dead players
    pub fn build_legs(&self, owner: usize, pose: &Pose, anim_time: i32) -> Option<HitVolume> {
        let stance = Stance::of(pose);
        if !stance.is_lying() {
            return None;
        }

        let feet = self.realistic.and_then(|tags| {
            let left = tags.tag_origin(pose, anim_time, AnchorTag::FootLeft)?;
            let right = tags.tag_origin(pose, anim_time, AnchorTag::FootRight)?;
            Some(left.lerp(&right, 0.5))
        });

        let origin = match feet {
            Some(mid) => Vec3::new(mid.x, mid.y, pose.origin.z + PRONE_LEGS_Z_OFFSET),
            None => heuristic_legs_origin(pose, stance),
        };

        Some(HitVolume {
            kind: VolumeKind::Legs,
            owner,
            origin,
            mins: LEGS_MINS,
            maxs: LEGS_MAXS,
            contents: Contents::BODY,
        })
    }
}

fn heuristic_head_origin(pose: &Pose) -> Vec3 {
    let stance = Stance::of(pose);
    let height = match stance {
        Stance::Prone => pose.view_height - PRONE_HEAD_DROP,
        Stance::Dead => pose.view_height - DEAD_HEAD_DROP,
        Stance::Crouched => CROUCH_VIEWHEIGHT - CROUCH_HEAD_DROP,
        Stance::Standing => pose.view_height,
    } as f32;

    let mut angles = pose.view_angles;
    angles.x = match stance {
        Stance::Dead => 0.0,
        Stance::Prone => (angle_normalize180(angles.x) * HEAD_PITCH_SCALE).min(PRONE_MAX_PITCH),
        _ => angle_normalize180(angles.x) * HEAD_PITCH_SCALE,
    };

    let (forward, _, up) = angle_vectors(&angles);
    let reach = match stance {
        Stance::Prone => HEAD_FORWARD_PRONE,
        Stance::Dead => HEAD_FORWARD_DEAD,
        _ => HEAD_FORWARD_UPRIGHT,
    };

    let mut origin = pose.origin + forward * reach + up * HEAD_UP;
    origin.z += height / 2.0;
    origin
}

fn heuristic_legs_origin(pose: &Pose, stance: Stance) -> Vec3 {
    let (mut flat, _, _) = angle_vectors(&pose.view_angles);
    flat.z = 0.0;
    let flat = flat.normalize();

    // prone legs trail behind, a corpse's legs lie ahead of it
    let reach = if stance == Stance::Dead {
        LEGS_OFFSET
    } else {
        -LEGS_OFFSET
    };

    Vec3::new(
        pose.origin.x + flat.x * reach,
        pose.origin.y + flat.y * reach,
        pose.origin.z + PRONE_LEGS_Z_OFFSET,
    )
}

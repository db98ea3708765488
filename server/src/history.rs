//! Per-player position history and time rewinding
//!
//! Every eligible player records one `PoseSnapshot` per server frame into a
//! fixed-size ring. The ring is never empty: a reset seeds every slot with
//! the current pose at synthetic, tick-spaced timestamps walking back from
//! "now", so an old slot is only ever stale, never missing.
//!
//! Resolving a target time walks backwards from the newest slot until it
//! finds the first snapshot at or before the target, then blends that
//! snapshot with its newer neighbour. How each pose field is blended is
//! decided by a single policy table (`PoseField::policy`), so new animation
//! channels only need a table entry.

use log::trace;
use shared::{EntityFlags, MoveFlags, Vec3};

/// Snapshots kept per player (about 850ms at 20Hz).
pub const MAX_POSE_HISTORY: usize = 17;

/// Animation sub-state of one body part (torso or legs)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnimFrame {
    pub old_frame_model: i32,
    pub frame_model: i32,
    pub old_frame: i32,
    pub frame: i32,
    pub old_frame_time: i32,
    pub frame_time: i32,
    pub yaw_angle: f32,
    pub pitch_angle: f32,
    pub yawing: bool,
    pub pitching: bool,
}

/// Everything about a player that a rewind replaces and a restore puts back
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub origin: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub view_angles: Vec3,
    pub e_flags: EntityFlags,
    pub pm_flags: MoveFlags,
    pub view_height: i32,
    pub torso: AnimFrame,
    pub legs: AnimFrame,
}

/// A pose stamped with the level time it was recorded at
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseSnapshot {
    pub time: i32,
    pub pose: Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Componentwise linear blend
    Interpolate,
    /// Shortest-arc blend per component
    InterpolateAngles,
    /// Copied from whichever bounding snapshot is closer in time
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseField {
    Origin,
    Mins,
    Maxs,
    ViewAngles,
    EntityFlags,
    MoveFlags,
    ViewHeight,
    Torso,
    Legs,
}

impl PoseField {
    pub const ALL: [PoseField; 9] = [
        PoseField::Origin,
        PoseField::Mins,
        PoseField::Maxs,
        PoseField::ViewAngles,
        PoseField::EntityFlags,
        PoseField::MoveFlags,
        PoseField::ViewHeight,
        PoseField::Torso,
        PoseField::Legs,
    ];

    pub fn policy(self) -> FieldPolicy {
        match self {
            PoseField::Origin | PoseField::Mins | PoseField::Maxs => FieldPolicy::Interpolate,
            PoseField::ViewAngles => FieldPolicy::InterpolateAngles,
            PoseField::EntityFlags
            | PoseField::MoveFlags
            | PoseField::ViewHeight
            | PoseField::Torso
            | PoseField::Legs => FieldPolicy::Nearest,
        }
    }

    fn vector(self, pose: &Pose) -> Option<Vec3> {
        match self {
            PoseField::Origin => Some(pose.origin),
            PoseField::Mins => Some(pose.mins),
            PoseField::Maxs => Some(pose.maxs),
            PoseField::ViewAngles => Some(pose.view_angles),
            _ => None,
        }
    }

    fn vector_mut(self, pose: &mut Pose) -> Option<&mut Vec3> {
        match self {
            PoseField::Origin => Some(&mut pose.origin),
            PoseField::Mins => Some(&mut pose.mins),
            PoseField::Maxs => Some(&mut pose.maxs),
            PoseField::ViewAngles => Some(&mut pose.view_angles),
            _ => None,
        }
    }

    /// Copies this field verbatim from `src` into `dst`.
    pub fn copy(self, dst: &mut Pose, src: &Pose) {
        match self {
            PoseField::Origin => dst.origin = src.origin,
            PoseField::Mins => dst.mins = src.mins,
            PoseField::Maxs => dst.maxs = src.maxs,
            PoseField::ViewAngles => dst.view_angles = src.view_angles,
            PoseField::EntityFlags => dst.e_flags = src.e_flags,
            PoseField::MoveFlags => dst.pm_flags = src.pm_flags,
            PoseField::ViewHeight => dst.view_height = src.view_height,
            PoseField::Torso => dst.torso = src.torso,
            PoseField::Legs => dst.legs = src.legs,
        }
    }

    fn blend(self, dst: &mut Pose, older: &Pose, newer: &Pose, frac: f32, nearest: &Pose) {
        let policy = self.policy();
        let blended = match (policy, self.vector(older), self.vector(newer)) {
            (FieldPolicy::Interpolate, Some(a), Some(b)) => Some(a.lerp(&b, frac)),
            (FieldPolicy::InterpolateAngles, Some(a), Some(b)) => Some(a.lerp_angles(&b, frac)),
            _ => None,
        };

        match (blended, self.vector_mut(dst)) {
            (Some(value), Some(slot)) => *slot = value,
            _ => self.copy(dst, nearest),
        }
    }
}

/// Outcome of a successful time rewind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPose {
    pub pose: Pose,
    /// Timestamp of the snapshot that supplied the discrete fields; the
    /// animation instant for head and legs reconstruction
    pub anim_time: i32,
    pub older_time: i32,
    pub newer_time: i32,
}

/// Fixed-capacity ring of pose snapshots, always full
#[derive(Debug, Clone)]
pub struct HistoryStore<const N: usize = MAX_POSE_HISTORY> {
    markers: [PoseSnapshot; N],
    top: usize,
}

impl<const N: usize> Default for HistoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HistoryStore<N> {
    pub fn new() -> Self {
        assert!(N > 0, "history needs at least one slot");
        Self {
            markers: [PoseSnapshot::default(); N],
            top: N - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Index of the most recently written slot
    pub fn top(&self) -> usize {
        self.top
    }

    pub fn latest(&self) -> &PoseSnapshot {
        &self.markers[self.top]
    }

    pub fn slot(&self, index: usize) -> &PoseSnapshot {
        &self.markers[index % N]
    }

    /// Snapshots from newest to oldest
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &PoseSnapshot> + '_ {
        (0..N).map(move |back| &self.markers[(self.top + N - back) % N])
    }

    fn prev(index: usize) -> usize {
        if index == 0 {
            N - 1
        } else {
            index - 1
        }
    }

    /// Advances the cursor one slot and overwrites the oldest snapshot.
    pub fn record(&mut self, time: i32, pose: &Pose) {
        self.top = (self.top + 1) % N;
        self.markers[self.top] = PoseSnapshot { time, pose: *pose };
    }

    /// Fills every slot with `pose`, stamped `now`, `now - frame_msec`, ...
    ///
    /// The mounted-vehicle flag is never stored in history.
    pub fn reset(&mut self, now: i32, pose: &Pose, frame_msec: i32) {
        let mut seeded = *pose;
        seeded.e_flags.remove(EntityFlags::MOUNTED_TANK);

        self.top = N - 1;
        let mut time = now;
        for index in (0..N).rev() {
            self.markers[index] = PoseSnapshot { time, pose: seeded };
            time -= frame_msec;
        }
    }

    /// Reconstructs the pose at `target_time`, never extrapolating past `now`.
    ///
    /// Returns `None` when no snapshot pair bounds the target; the caller must
    /// then leave the live pose untouched.
    pub fn resolve(&self, target_time: i32, now: i32) -> Option<ResolvedPose> {
        let target = target_time.min(now);

        let mut newer = self.top;
        let mut older = self.top;
        loop {
            if self.markers[older].time <= target {
                break;
            }
            newer = older;
            older = Self::prev(older);
            if older == self.top {
                trace!(
                    "no history brackets t={} (newest {}, oldest {})",
                    target,
                    self.markers[self.top].time,
                    self.markers[(self.top + 1) % N].time
                );
                return None;
            }
        }

        let older_snap = &self.markers[older];
        let newer_snap = &self.markers[newer];

        if older == newer || older_snap.time == newer_snap.time {
            return Some(ResolvedPose {
                pose: older_snap.pose,
                anim_time: older_snap.time,
                older_time: older_snap.time,
                newer_time: newer_snap.time,
            });
        }

        let frac = (target - older_snap.time) as f32 / (newer_snap.time - older_snap.time) as f32;

        // ties go to the newer snapshot
        let nearest = if newer_snap.time - target <= target - older_snap.time {
            newer_snap
        } else {
            older_snap
        };

        let mut pose = nearest.pose;
        for field in PoseField::ALL {
            field.blend(&mut pose, &older_snap.pose, &newer_snap.pose, frac, &nearest.pose);
        }

        Some(ResolvedPose {
            pose,
            anim_time: nearest.time,
            older_time: older_snap.time,
            newer_time: newer_snap.time,
        })
    }
}

//! Entity directory and the collision primitive
//!
//! Players live in a fixed arena indexed by client number. Traces sweep a
//! box from start to end against static world geometry, every linked player
//! body and whatever transient hit volumes are attached at the time.

use crate::entity::Player;
use crate::hitvolume::{HitVolume, TagEvaluator, VolumeKind};
use log::info;
use shared::{Contents, HitRegion, Vec3};

/// Static level geometry
pub trait WorldGeometry: Send + Sync {
    /// Fraction of the sweep from `start` to `end` that is free of solids
    /// matching `mask`; 1.0 when nothing is in the way.
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> f32;

    fn point_contents(&self, point: &Vec3) -> Contents;
}

/// No geometry at all
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWorld;

impl WorldGeometry for OpenWorld {
    fn trace(&self, _: &Vec3, _: &Vec3, _: &Vec3, _: &Vec3, _: Contents) -> f32 {
        1.0
    }

    fn point_contents(&self, _: &Vec3) -> Contents {
        Contents::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Brush {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: Contents,
}

/// Geometry made of axis-aligned brushes
#[derive(Debug, Clone, Default)]
pub struct BoxWorld {
    brushes: Vec<Brush>,
}

impl BoxWorld {
    pub fn new(brushes: Vec<Brush>) -> Self {
        Self { brushes }
    }

    /// A small open arena with a few cover blocks and a pool
    pub fn arena() -> Self {
        let solid = |mins: Vec3, maxs: Vec3| Brush {
            mins,
            maxs,
            contents: Contents::SOLID,
        };
        Self::new(vec![
            solid(Vec3::new(-1024.0, -1024.0, -64.0), Vec3::new(1024.0, 1024.0, -25.0)),
            solid(Vec3::new(-128.0, 192.0, -24.0), Vec3::new(-64.0, 256.0, 40.0)),
            solid(Vec3::new(64.0, -256.0, -24.0), Vec3::new(128.0, -192.0, 40.0)),
            Brush {
                mins: Vec3::new(384.0, 384.0, -24.0),
                maxs: Vec3::new(640.0, 640.0, 16.0),
                contents: Contents::WATER,
            },
        ])
    }

    pub fn brushes(&self) -> &[Brush] {
        &self.brushes
    }
}

impl WorldGeometry for BoxWorld {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, mask: Contents) -> f32 {
        self.brushes
            .iter()
            .filter(|b| b.contents.intersects(mask))
            .filter_map(|b| sweep_box(start, end, &(b.mins - *maxs), &(b.maxs - *mins)))
            .fold(1.0, f32::min)
    }

    fn point_contents(&self, point: &Vec3) -> Contents {
        self.brushes
            .iter()
            .filter(|b| contains(&b.mins, &b.maxs, point))
            .fold(Contents::empty(), |acc, b| acc | b.contents)
    }
}

fn contains(mins: &Vec3, maxs: &Vec3, point: &Vec3) -> bool {
    (0..3).all(|i| point.get(i) >= mins.get(i) && point.get(i) <= maxs.get(i))
}

/// Entry fraction of the segment `start..end` into the box, if it enters.
///
/// A segment starting inside the box enters at 0.
pub fn sweep_box(start: &Vec3, end: &Vec3, box_min: &Vec3, box_max: &Vec3) -> Option<f32> {
    let dir = *end - *start;
    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;

    for i in 0..3 {
        let s = start.get(i);
        let d = dir.get(i);
        if d.abs() < 1e-6 {
            if s < box_min.get(i) || s > box_max.get(i) {
                return None;
            }
        } else {
            let inv_d = 1.0 / d;
            let mut t1 = (box_min.get(i) - s) * inv_d;
            let mut t2 = (box_max.get(i) - s) * inv_d;
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
            }
            t_min = t_min.max(t1);
            t_max = t_max.min(t2);
            if t_min > t_max {
                return None;
            }
        }
    }

    Some(t_min)
}

/// What a trace ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub entity: usize,
    pub volume: VolumeKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceResult {
    pub fraction: f32,
    pub endpos: Vec3,
    pub start_solid: bool,
    /// Player hit, if any; `None` for world geometry or a clean miss
    pub contact: Option<Contact>,
}

impl TraceResult {
    pub fn hit_player(&self) -> Option<usize> {
        self.contact.map(|c| c.entity)
    }

    pub fn region(&self) -> Option<HitRegion> {
        self.contact.map(|c| c.volume.region())
    }
}

pub struct World {
    players: Vec<Option<Player>>,
    volumes: Vec<HitVolume>,
    geometry: Box<dyn WorldGeometry>,
    skeleton: Option<Box<dyn TagEvaluator + Send + Sync>>,
    pub level_time: i32,
}

impl World {
    pub fn new(max_clients: usize, geometry: Box<dyn WorldGeometry>) -> Self {
        Self {
            players: (0..max_clients).map(|_| None).collect(),
            volumes: Vec::new(),
            geometry,
            skeleton: None,
            level_time: 0,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, client_num: usize) -> Option<&Player> {
        self.players.get(client_num).and_then(Option::as_ref)
    }

    pub fn player_mut(&mut self, client_num: usize) -> Option<&mut Player> {
        self.players.get_mut(client_num).and_then(Option::as_mut)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> + '_ {
        self.players.iter().flatten()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut Player> + '_ {
        self.players.iter_mut().flatten()
    }

    pub fn client_nums(&self) -> Vec<usize> {
        self.players().map(|p| p.client_num).collect()
    }

    /// Lowest free client slot
    pub fn free_slot(&self) -> Option<usize> {
        self.players.iter().position(Option::is_none)
    }

    /// Places `player` into its slot, replacing any previous occupant.
    pub fn insert_player(&mut self, player: Player) -> bool {
        let client_num = player.client_num;
        match self.players.get_mut(client_num) {
            Some(slot) => {
                *slot = Some(player);
                true
            }
            None => false,
        }
    }

    pub fn remove_player(&mut self, client_num: usize) -> Option<Player> {
        let removed = self.players.get_mut(client_num).and_then(Option::take);
        if removed.is_some() {
            info!("Removed player {} from world", client_num);
        }
        removed
    }

    pub fn link(&mut self, client_num: usize) {
        if let Some(player) = self.player_mut(client_num) {
            player.link();
        }
    }

    pub fn unlink(&mut self, client_num: usize) {
        if let Some(player) = self.player_mut(client_num) {
            player.unlink();
        }
    }

    /// Linked players whose broad-phase box overlaps `mins..maxs`
    pub fn entities_in_box(&self, mins: &Vec3, maxs: &Vec3) -> Vec<usize> {
        self.players()
            .filter(|p| p.linked)
            .filter(|p| {
                (0..3).all(|i| {
                    p.abs_min.get(i) <= maxs.get(i) && p.abs_max.get(i) >= mins.get(i)
                })
            })
            .map(|p| p.client_num)
            .collect()
    }

    pub fn geometry(&self) -> &dyn WorldGeometry {
        self.geometry.as_ref()
    }

    /// A player together with the level geometry it moves through
    pub fn player_with_geometry(
        &mut self,
        client_num: usize,
    ) -> Option<(&mut Player, &dyn WorldGeometry)> {
        let player = self.players.get_mut(client_num)?.as_mut()?;
        Some((player, self.geometry.as_ref()))
    }

    pub fn point_contents(&self, point: &Vec3) -> Contents {
        self.geometry.point_contents(point)
    }

    /// Installs the evaluator used for realistic head and legs placement.
    pub fn set_skeleton(&mut self, skeleton: Box<dyn TagEvaluator + Send + Sync>) {
        self.skeleton = Some(skeleton);
    }

    pub fn skeleton(&self) -> Option<&dyn TagEvaluator> {
        self.skeleton.as_deref().map(|s| s as &dyn TagEvaluator)
    }

    pub fn attach_volume(&mut self, volume: HitVolume) {
        self.volumes.push(volume);
    }

    pub fn attached_volumes(&self) -> &[HitVolume] {
        &self.volumes
    }

    pub fn detach_volumes(&mut self) {
        self.volumes.clear();
    }

    /// Sweeps `mins..maxs` from `start` to `end`, ignoring player `pass`.
    pub fn trace(
        &self,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
        pass: Option<usize>,
        mask: Contents,
    ) -> TraceResult {
        let mut fraction = self.geometry.trace(start, mins, maxs, end, mask);
        let mut contact = None;

        let sweep_min = start.min(end) + *mins;
        let sweep_max = start.max(end) + *maxs;

        for client_num in self.entities_in_box(&sweep_min, &sweep_max) {
            if Some(client_num) == pass {
                continue;
            }
            let Some(player) = self.player(client_num) else {
                continue;
            };
            if !player.contents().intersects(mask) {
                continue;
            }
            let pose = &player.pose;
            let box_min = pose.origin + pose.mins - *maxs;
            let box_max = pose.origin + pose.maxs - *mins;
            if let Some(t) = sweep_box(start, end, &box_min, &box_max) {
                if t < fraction {
                    fraction = t;
                    contact = Some(Contact {
                        entity: client_num,
                        volume: VolumeKind::Owner,
                    });
                }
            }
        }

        for volume in &self.volumes {
            if Some(volume.owner) == pass || !volume.contents.intersects(mask) {
                continue;
            }
            let box_min = volume.abs_min() - *maxs;
            let box_max = volume.abs_max() - *mins;
            if let Some(t) = sweep_box(start, end, &box_min, &box_max) {
                if t < fraction {
                    fraction = t;
                    contact = Some(Contact {
                        entity: volume.owner,
                        volume: volume.kind,
                    });
                }
            }
        }

        TraceResult {
            fraction,
            endpos: start.lerp(end, fraction),
            start_solid: fraction == 0.0,
            contact,
        }
    }
}

//! Core simulation engine for the TankNet mesh-network sandbox.
//!
//! The engine owns terrain generation, tank mobility, link-topology
//! computation, and the control-command state machine. It is transport
//! agnostic: the app crate drives the tick loop and publishes snapshots,
//! while any presentation layer reads those snapshots.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tanknet_index::{NeighborhoodIndex, UniformGridIndex};
use thiserror::Error;

/// Communication range shared by every participant, in world units.
pub const DEFAULT_RADIO_RANGE: f32 = 20.0;

/// Distance at which a target-seeking tank counts a goal as reached.
const TARGET_CAPTURE_RADIUS: f32 = 2.0;

/// Monotonic tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    /// The tick following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Tick zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// 2D position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to `other`.
    #[must_use]
    pub fn distance_sq(self, other: Self) -> f32 {
        (self.x - other.x).powi(2) + (self.y - other.y).powi(2)
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        self.distance_sq(other).sqrt()
    }
}

fn clamp_to_bounds(position: Position, width: f32, height: f32) -> Position {
    Position::new(
        position.x.clamp(0.0, width.next_down()),
        position.y.clamp(0.0, height.next_down()),
    )
}

/// Validation failures for the live-tunable parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ParamError {
    #[error("nb_tanks must be positive")]
    ZeroTanks,
    #[error("max_step_size must be non-negative and finite")]
    InvalidStepSize,
    #[error("sigma values must be positive and finite")]
    InvalidSigma,
}

/// The parameter subset exposed for live reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimParams {
    /// Number of tanks recreated on reset.
    pub nb_tanks: u32,
    /// Per-tick displacement bound in world units.
    pub max_step_size: f32,
    /// Terrain correlation length along the x axis.
    pub sigma_x: f32,
    /// Terrain correlation length along the y axis.
    pub sigma_y: f32,
}

impl SimParams {
    /// Check the invariants the control surface relies on.
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.nb_tanks == 0 {
            return Err(ParamError::ZeroTanks);
        }
        if !(self.max_step_size >= 0.0) || !self.max_step_size.is_finite() {
            return Err(ParamError::InvalidStepSize);
        }
        if !(self.sigma_x > 0.0)
            || !(self.sigma_y > 0.0)
            || !self.sigma_x.is_finite()
            || !self.sigma_y.is_finite()
        {
            return Err(ParamError::InvalidSigma);
        }
        Ok(())
    }
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            nb_tanks: 10,
            max_step_size: 0.3,
            sigma_x: 16.0,
            sigma_y: 4.0,
        }
    }
}

/// Visual constants echoed to the dashboard; never read by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub tank_color: String,
    pub hq_color: String,
    pub target_color: String,
    pub link_color: String,
    /// Whether the dashed radio ring is drawn around each tank.
    pub show_radio_ring: bool,
    /// Draw radius of a tank marker in world units.
    pub tank_draw_radius: f32,
    /// Click hit-box radius in world units.
    pub hit_radius: f32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            tank_color: "blue".to_owned(),
            hq_color: "yellow".to_owned(),
            target_color: "red".to_owned(),
            link_color: "white".to_owned(),
            show_radio_ring: true,
            tank_draw_radius: 1.0,
            hit_radius: 2.0,
        }
    }
}

/// Terrain generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TerrainKind {
    /// White noise smoothed separably with the configured sigmas.
    Smoothed,
    /// Closed-form crossed sine ridges.
    SineRidges { freq_x: f32, freq_y: f32 },
    /// All-zero altitude.
    Flat,
}

impl Default for TerrainKind {
    fn default() -> Self {
        Self::Smoothed
    }
}

/// Mobility strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MobilityKind {
    #[default]
    RandomWalk,
    TargetSeeking,
}

/// Connectivity strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConnectivityKind {
    /// Pure Euclidean range test.
    Range,
    /// Range test plus terrain line-of-sight shadowing.
    TerrainShadow { margin: f32 },
}

impl Default for ConnectivityKind {
    fn default() -> Self {
        Self::Range
    }
}

/// Errors raised while materializing a world from configuration.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    InvalidParams(#[from] ParamError),
}

/// Static configuration for a TankNet world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankNetConfig {
    /// Width of the map in world units.
    pub world_width: u32,
    /// Height of the map in world units.
    pub world_height: u32,
    /// Live-tunable parameters.
    pub params: SimParams,
    /// Communication range shared by tanks and HQ.
    pub radio_range: f32,
    /// Number of static targets placed at reset.
    pub nb_targets: u32,
    /// Terrain generation strategy.
    pub terrain: TerrainKind,
    /// Mobility strategy.
    pub mobility: MobilityKind,
    /// Connectivity strategy.
    pub connectivity: ConnectivityKind,
    /// Optional preset formation; length must equal `params.nb_tanks`.
    pub initial_positions: Option<Vec<(f32, f32)>>,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Tick cadence of the stepper loop.
    pub tick_interval_ms: u64,
    /// When set, a `max_step_size`-only reconfigure applies in place
    /// instead of resetting terrain and population.
    pub live_param_tuning: bool,
    /// Visual constants echoed to the dashboard.
    pub display: DisplaySettings,
}

impl Default for TankNetConfig {
    fn default() -> Self {
        Self {
            world_width: 100,
            world_height: 100,
            params: SimParams::default(),
            radio_range: DEFAULT_RADIO_RANGE,
            nb_targets: 3,
            terrain: TerrainKind::default(),
            mobility: MobilityKind::default(),
            connectivity: ConnectivityKind::default(),
            initial_positions: None,
            rng_seed: None,
            history_capacity: 256,
            tick_interval_ms: 100,
            live_param_tuning: false,
            display: DisplaySettings::default(),
        }
    }
}

impl TankNetConfig {
    /// Validate every field the engine relies on.
    pub fn validate(&self) -> Result<(), WorldStateError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(WorldStateError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        self.params.validate()?;
        if !(self.radio_range > 0.0) || !self.radio_range.is_finite() {
            return Err(WorldStateError::InvalidConfig(
                "radio_range must be positive and finite",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldStateError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(WorldStateError::InvalidConfig(
                "tick_interval_ms must be non-zero",
            ));
        }
        if let Some(positions) = &self.initial_positions {
            if positions.len() != self.params.nb_tanks as usize {
                return Err(WorldStateError::InvalidConfig(
                    "initial_positions length must match nb_tanks",
                ));
            }
            let (w, h) = (self.world_width as f32, self.world_height as f32);
            if positions
                .iter()
                .any(|&(x, y)| !(0.0..w).contains(&x) || !(0.0..h).contains(&y))
            {
                return Err(WorldStateError::InvalidConfig(
                    "initial_positions must lie inside the map",
                ));
            }
        }
        if let ConnectivityKind::TerrainShadow { margin } = self.connectivity
            && (!(margin >= 0.0) || !margin.is_finite())
        {
            return Err(WorldStateError::InvalidConfig(
                "terrain shadow margin must be non-negative and finite",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Dense altitude grid, immutable after generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainField {
    width: u32,
    height: u32,
    cells: Vec<f32>,
}

impl TerrainField {
    /// Generate a field for the given strategy.
    ///
    /// `Smoothed` starts from independent noise in `[-1, 1)` and applies a
    /// separable Gaussian blur with half-width `ceil(3 sigma)` per axis,
    /// renormalized at the clamped borders, then rescales to unit amplitude.
    #[must_use]
    pub fn generate(
        width: u32,
        height: u32,
        kind: TerrainKind,
        sigma_x: f32,
        sigma_y: f32,
        rng: &mut SmallRng,
    ) -> Self {
        let (w, h) = (width as usize, height as usize);
        let cells = match kind {
            TerrainKind::Flat => vec![0.0; w * h],
            TerrainKind::SineRidges { freq_x, freq_y } => {
                let mut cells = vec![0.0; w * h];
                for y in 0..h {
                    for x in 0..w {
                        let fx = (std::f32::consts::TAU * x as f32 * freq_x / w as f32).sin();
                        let fy = (std::f32::consts::TAU * y as f32 * freq_y / h as f32).sin();
                        cells[y * w + x] = fx * fy;
                    }
                }
                cells
            }
            TerrainKind::Smoothed => {
                let mut cells: Vec<f32> = (0..w * h).map(|_| rng.random_range(-1.0..1.0)).collect();
                cells = smooth_axis(&cells, w, h, sigma_x, true);
                cells = smooth_axis(&cells, w, h, sigma_y, false);
                let peak = cells.iter().fold(0.0_f32, |acc, &v| acc.max(v.abs()));
                if peak > 0.0 {
                    for cell in &mut cells {
                        *cell /= peak;
                    }
                }
                cells
            }
        };
        Self {
            width,
            height,
            cells,
        }
    }

    /// All-zero field, mostly useful as a placeholder in tests.
    #[must_use]
    pub fn flat(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![0.0; width as usize * height as usize],
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major cell values.
    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Altitude of a grid cell.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.cells[y as usize * self.width as usize + x as usize])
    }

    /// Altitude at a world position, sampled at the nearest cell.
    #[must_use]
    pub fn altitude(&self, x: f32, y: f32) -> f32 {
        let cx = (x.round().max(0.0) as u32).min(self.width.saturating_sub(1));
        let cy = (y.round().max(0.0) as u32).min(self.height.saturating_sub(1));
        self.get(cx, cy).unwrap_or(0.0)
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let half = (3.0 * sigma).ceil().max(1.0) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel = Vec::with_capacity(2 * half + 1);
    for i in 0..=2 * half {
        let offset = i as f32 - half as f32;
        kernel.push((-offset * offset / denom).exp());
    }
    let total: f32 = kernel.iter().sum();
    for weight in &mut kernel {
        *weight /= total;
    }
    kernel
}

fn smooth_axis(cells: &[f32], width: usize, height: usize, sigma: f32, along_x: bool) -> Vec<f32> {
    let kernel = gaussian_kernel(sigma);
    let half = kernel.len() / 2;
    let mut out = vec![0.0_f32; cells.len()];
    for y in 0..height {
        for x in 0..width {
            let (limit, coord) = if along_x { (width, x) } else { (height, y) };
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (k, &weight) in kernel.iter().enumerate() {
                let tap = coord as isize + k as isize - half as isize;
                if tap < 0 || tap >= limit as isize {
                    continue;
                }
                let idx = if along_x {
                    y * width + tap as usize
                } else {
                    tap as usize * width + x
                };
                acc += weight * cells[idx];
                norm += weight;
            }
            out[y * width + x] = if norm > 0.0 {
                acc / norm
            } else {
                cells[y * width + x]
            };
        }
    }
    out
}

/// A mobile network agent with a stable identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tank {
    /// Identity assigned at creation, never reused and never renumbered.
    pub idx: u32,
    pub position: Position,
    pub alive: bool,
}

/// Outcome of a roster kill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterKill {
    Killed,
    AlreadyDead,
    Unknown,
}

/// Owns every tank created since the last reset, dead ones included.
///
/// Rows are append-only: a tank's `idx` equals its row position, so lookups
/// are O(1) and killing a tank never shifts the identities of the others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TankRoster {
    tanks: Vec<Tank>,
}

impl TankRoster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tank, returning its freshly assigned identity.
    pub fn spawn(&mut self, position: Position) -> u32 {
        let idx = self.tanks.len() as u32;
        self.tanks.push(Tank {
            idx,
            position,
            alive: true,
        });
        idx
    }

    /// Mark a tank dead. Unknown or already-dead identities are reported,
    /// never fatal.
    pub fn kill(&mut self, idx: u32) -> RosterKill {
        match self.tanks.get_mut(idx as usize) {
            None => RosterKill::Unknown,
            Some(tank) if !tank.alive => RosterKill::AlreadyDead,
            Some(tank) => {
                tank.alive = false;
                RosterKill::Killed
            }
        }
    }

    #[must_use]
    pub fn get(&self, idx: u32) -> Option<&Tank> {
        self.tanks.get(idx as usize)
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> Option<&mut Tank> {
        self.tanks.get_mut(idx as usize)
    }

    /// Whether the identity exists and is alive.
    #[must_use]
    pub fn is_alive(&self, idx: u32) -> bool {
        self.get(idx).is_some_and(|tank| tank.alive)
    }

    /// Iterate alive tanks in ascending identity order.
    pub fn alive(&self) -> impl Iterator<Item = &Tank> {
        self.tanks.iter().filter(|tank| tank.alive)
    }

    /// Number of alive tanks.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.alive().count()
    }

    /// Total rows, dead tanks included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tanks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tanks.is_empty()
    }
}

/// One endpoint of a link. Tanks order before HQ so normalized pairs are
/// unambiguous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LinkEnd {
    Tank(u32),
    Hq,
}

/// A derived, symmetric, range-based connectivity edge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Link {
    pub a: LinkEnd,
    pub b: LinkEnd,
}

impl Link {
    /// Build a normalized link; the smaller endpoint always lands in `a`.
    #[must_use]
    pub fn new(x: LinkEnd, y: LinkEnd) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// Whether either endpoint is the given tank.
    #[must_use]
    pub fn touches(&self, idx: u32) -> bool {
        self.a == LinkEnd::Tank(idx) || self.b == LinkEnd::Tank(idx)
    }

    /// Whether either endpoint is HQ.
    #[must_use]
    pub fn touches_hq(&self) -> bool {
        self.a == LinkEnd::Hq || self.b == LinkEnd::Hq
    }
}

/// Read-only world data handed to a mobility policy for one tank step.
pub struct MobilityContext<'a> {
    pub width: f32,
    pub height: f32,
    pub max_step_size: f32,
    pub hq: Position,
    pub targets: &'a [Position],
}

/// Advances one tank by one bounded step.
///
/// Implementations must keep the returned position inside
/// `[0, width) x [0, height)` and must not draw randomness for dead tanks
/// (the engine never calls them for dead tanks).
pub trait MobilityPolicy: Send {
    fn name(&self) -> &'static str;

    fn step(&mut self, tank: &Tank, ctx: &MobilityContext<'_>, rng: &mut SmallRng) -> Position;
}

/// Uniform random displacement within a disk of radius `max_step_size`,
/// clamped (not reflected) to the map bounds.
#[derive(Debug, Default)]
pub struct RandomWalkMobility;

impl MobilityPolicy for RandomWalkMobility {
    fn name(&self) -> &'static str {
        "random_walk"
    }

    fn step(&mut self, tank: &Tank, ctx: &MobilityContext<'_>, rng: &mut SmallRng) -> Position {
        // Two draws per alive tank, every tick, so the stream shape stays
        // stable even when max_step_size is zero.
        let angle: f32 = rng.random_range(0.0..std::f32::consts::TAU);
        let radius = ctx.max_step_size * rng.random::<f32>().sqrt();
        let next = Position::new(
            tank.position.x + radius * angle.cos(),
            tank.position.y + radius * angle.sin(),
        );
        clamp_to_bounds(next, ctx.width, ctx.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    Target(usize),
    ReturnToHq,
}

#[derive(Debug, Clone, Copy)]
struct TankGoal {
    goal: Goal,
    last_target: usize,
}

/// Patrol behaviour recovered from the original dashboard run loop: tanks
/// shuttle between assigned targets and HQ, moving at most `max_step_size`
/// per tick straight toward the current goal.
#[derive(Debug, Default)]
pub struct TargetSeekingMobility {
    goals: HashMap<u32, TankGoal>,
}

impl TargetSeekingMobility {
    fn goal_position(goal: Goal, ctx: &MobilityContext<'_>) -> Position {
        match goal {
            Goal::ReturnToHq => ctx.hq,
            Goal::Target(i) => ctx.targets.get(i).copied().unwrap_or(ctx.hq),
        }
    }
}

impl MobilityPolicy for TargetSeekingMobility {
    fn name(&self) -> &'static str {
        "target_seeking"
    }

    fn step(&mut self, tank: &Tank, ctx: &MobilityContext<'_>, _rng: &mut SmallRng) -> Position {
        let entry = self.goals.entry(tank.idx).or_insert_with(|| {
            let first = if ctx.targets.is_empty() {
                Goal::ReturnToHq
            } else {
                Goal::Target(tank.idx as usize % ctx.targets.len())
            };
            TankGoal {
                goal: first,
                last_target: tank.idx as usize,
            }
        });

        let mut goal_pos = Self::goal_position(entry.goal, ctx);
        if tank.position.distance(goal_pos) <= TARGET_CAPTURE_RADIUS {
            entry.goal = match entry.goal {
                Goal::Target(i) => {
                    entry.last_target = i;
                    Goal::ReturnToHq
                }
                Goal::ReturnToHq if ctx.targets.is_empty() => Goal::ReturnToHq,
                Goal::ReturnToHq => {
                    let next = (entry.last_target + 1) % ctx.targets.len();
                    Goal::Target(next)
                }
            };
            goal_pos = Self::goal_position(entry.goal, ctx);
        }

        let dist = tank.position.distance(goal_pos);
        if dist <= f32::EPSILON {
            return tank.position;
        }
        let step = dist.min(ctx.max_step_size);
        let next = Position::new(
            tank.position.x + (goal_pos.x - tank.position.x) / dist * step,
            tank.position.y + (goal_pos.y - tank.position.y) / dist * step,
        );
        clamp_to_bounds(next, ctx.width, ctx.height)
    }
}

/// Read-only world data handed to a connectivity policy.
pub struct ConnectivityView<'a> {
    /// Alive tanks in ascending identity order.
    pub tanks: &'a [(u32, Position)],
    pub hq: Position,
    pub radio_range: f32,
    pub terrain: &'a TerrainField,
}

/// Recomputes the full link set from current positions.
pub trait ConnectivityPolicy: Send {
    fn name(&self) -> &'static str;

    fn compute_links(&mut self, view: &ConnectivityView<'_>) -> Vec<Link>;
}

/// Naive pairwise sweep; the fallback when the grid cannot be built and the
/// reference that the grid path is tested against.
#[must_use]
pub fn pairwise_links(ends: &[(LinkEnd, Position)], radio_range: f32) -> Vec<Link> {
    let radius_sq = radio_range * radio_range;
    let mut links = Vec::new();
    for i in 0..ends.len() {
        for j in i + 1..ends.len() {
            if ends[i].1.distance_sq(ends[j].1) <= radius_sq {
                links.push(Link::new(ends[i].0, ends[j].0));
            }
        }
    }
    links.sort_unstable();
    links
}

fn participant_ends(view: &ConnectivityView<'_>) -> Vec<(LinkEnd, Position)> {
    let mut ends: Vec<(LinkEnd, Position)> = view
        .tanks
        .iter()
        .map(|&(idx, position)| (LinkEnd::Tank(idx), position))
        .collect();
    ends.push((LinkEnd::Hq, view.hq));
    ends
}

/// Euclidean range test over a uniform grid; distance exactly equal to the
/// range links, coincident participants link.
#[derive(Debug, Default)]
pub struct RangeConnectivity {
    index: UniformGridIndex,
}

impl ConnectivityPolicy for RangeConnectivity {
    fn name(&self) -> &'static str {
        "range"
    }

    fn compute_links(&mut self, view: &ConnectivityView<'_>) -> Vec<Link> {
        let ends = participant_ends(view);
        let positions: Vec<(f32, f32)> = ends.iter().map(|&(_, p)| (p.x, p.y)).collect();
        self.index.cell_size = view.radio_range;
        if self.index.rebuild(&positions).is_err() {
            return pairwise_links(&ends, view.radio_range);
        }
        let radius_sq = view.radio_range * view.radio_range;
        let index = &self.index;
        let mut links: Vec<Link> = (0..ends.len())
            .into_par_iter()
            .map(|slot| {
                let mut found = Vec::new();
                index.neighbors_within(slot, radius_sq, &mut |other, _| {
                    if other > slot {
                        found.push(Link::new(ends[slot].0, ends[other].0));
                    }
                });
                found
            })
            .reduce(Vec::new, |mut acc, mut part| {
                acc.append(&mut part);
                acc
            });
        links.sort_unstable();
        links
    }
}

/// Range test plus line-of-sight shadowing: a link is discarded when an
/// interior terrain sample rises more than `margin` above both endpoints.
#[derive(Debug)]
pub struct TerrainShadowConnectivity {
    margin: f32,
    inner: RangeConnectivity,
}

impl TerrainShadowConnectivity {
    #[must_use]
    pub fn new(margin: f32) -> Self {
        Self {
            margin,
            inner: RangeConnectivity::default(),
        }
    }

    fn line_of_sight(&self, terrain: &TerrainField, a: Position, b: Position) -> bool {
        let dist = a.distance(b);
        let samples = dist.ceil() as u32;
        if samples < 2 {
            return true;
        }
        let ceiling = terrain.altitude(a.x, a.y).max(terrain.altitude(b.x, b.y)) + self.margin;
        for i in 1..samples {
            let t = i as f32 / samples as f32;
            let x = a.x + (b.x - a.x) * t;
            let y = a.y + (b.y - a.y) * t;
            if terrain.altitude(x, y) > ceiling {
                return false;
            }
        }
        true
    }
}

impl ConnectivityPolicy for TerrainShadowConnectivity {
    fn name(&self) -> &'static str {
        "terrain_shadow"
    }

    fn compute_links(&mut self, view: &ConnectivityView<'_>) -> Vec<Link> {
        let mut by_end: HashMap<LinkEnd, Position> = view
            .tanks
            .iter()
            .map(|&(idx, position)| (LinkEnd::Tank(idx), position))
            .collect();
        by_end.insert(LinkEnd::Hq, view.hq);
        self.inner
            .compute_links(view)
            .into_iter()
            .filter(|link| {
                let (Some(&a), Some(&b)) = (by_end.get(&link.a), by_end.get(&link.b)) else {
                    return false;
                };
                self.line_of_sight(view.terrain, a, b)
            })
            .collect()
    }
}

fn make_mobility(kind: MobilityKind) -> Box<dyn MobilityPolicy> {
    match kind {
        MobilityKind::RandomWalk => Box::new(RandomWalkMobility),
        MobilityKind::TargetSeeking => Box::new(TargetSeekingMobility::default()),
    }
}

fn make_connectivity(kind: ConnectivityKind) -> Box<dyn ConnectivityPolicy> {
    match kind {
        ConnectivityKind::Range => Box::new(RangeConnectivity::default()),
        ConnectivityKind::TerrainShadow { margin } => {
            Box::new(TerrainShadowConnectivity::new(margin))
        }
    }
}

/// Commands accepted by the control surface, applied strictly between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlCommand {
    Start,
    Stop,
    Reset,
    SetParams(SimParams),
    KillTank { idx: u32 },
    SpawnTank { x: f32, y: f32 },
}

/// Deterministic result of applying one control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Started,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
    ResetComplete,
    /// Full reset under the new parameters.
    ParamsApplied,
    /// Live tuning: step bound adjusted in place.
    ParamsAdjusted,
    Rejected(ParamError),
    Killed { idx: u32 },
    AlreadyDead { idx: u32 },
    UnknownTank { idx: u32 },
    Spawned { idx: u32 },
}

impl CommandOutcome {
    /// Whether the command left the world untouched.
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning
                | Self::AlreadyStopped
                | Self::Rejected(_)
                | Self::AlreadyDead { .. }
                | Self::UnknownTank { .. }
        )
    }
}

/// Events produced by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    pub links: usize,
    /// Links discarded by the audit because they referenced a dead tank.
    pub healed_links: usize,
}

/// Per-tick history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub alive: usize,
    pub links: usize,
    /// Alive tanks with no link at all.
    pub isolated: usize,
    /// Links incident to HQ.
    pub hq_degree: usize,
}

/// Alive-tank view carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TankView {
    pub idx: u32,
    pub x: f32,
    pub y: f32,
}

/// Immutable, fully-formed view of the world at one step, safe to share
/// across threads behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub step: u64,
    pub map_size: (u32, u32),
    pub terrain: Arc<TerrainField>,
    /// Alive tanks in ascending identity order.
    pub tanks: Vec<TankView>,
    /// Links expressed over stable tank identities.
    pub links: Vec<Link>,
    pub hq: (f32, f32),
    pub targets: Vec<(f32, f32)>,
    pub running: bool,
}

impl SimulationSnapshot {
    /// Translate identity-based links into array positions within `tanks`
    /// for positional consumers; HQ maps to `tanks.len()`.
    #[must_use]
    pub fn positional_links(&self) -> Vec<(usize, usize)> {
        let slot_of: HashMap<u32, usize> = self
            .tanks
            .iter()
            .enumerate()
            .map(|(slot, tank)| (tank.idx, slot))
            .collect();
        let resolve = |end: LinkEnd| match end {
            LinkEnd::Hq => Some(self.tanks.len()),
            LinkEnd::Tank(idx) => slot_of.get(&idx).copied(),
        };
        self.links
            .iter()
            .filter_map(|link| Some((resolve(link.a)?, resolve(link.b)?)))
            .collect()
    }
}

/// The authoritative world: single mutator, arbitrarily many snapshot
/// readers via the published `SimulationSnapshot`.
pub struct WorldState {
    config: TankNetConfig,
    step: Tick,
    running: bool,
    rng: SmallRng,
    terrain: Arc<TerrainField>,
    hq: Position,
    targets: Vec<Position>,
    roster: TankRoster,
    links: Vec<Link>,
    mobility: Box<dyn MobilityPolicy>,
    connectivity: Box<dyn ConnectivityPolicy>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("step", &self.step)
            .field("running", &self.running)
            .field("alive", &self.roster.alive_count())
            .field("links", &self.links.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a world from configuration and materialize the first
    /// terrain, HQ, targets, and roster.
    pub fn new(config: TankNetConfig) -> Result<Self, WorldStateError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let mut world = Self {
            mobility: make_mobility(config.mobility),
            connectivity: make_connectivity(config.connectivity),
            terrain: Arc::new(TerrainField::flat(config.world_width, config.world_height)),
            hq: Position::default(),
            targets: Vec::new(),
            roster: TankRoster::new(),
            links: Vec::new(),
            history: VecDeque::with_capacity(config.history_capacity),
            step: Tick::zero(),
            running: false,
            rng,
            config,
        };
        world.reset();
        Ok(world)
    }

    /// Rebuild terrain, HQ, targets, and population from the current
    /// configuration. Always leaves the world STOPPED at step zero.
    pub fn reset(&mut self) {
        self.running = false;
        self.step = Tick::zero();
        let params = self.config.params;
        self.terrain = Arc::new(TerrainField::generate(
            self.config.world_width,
            self.config.world_height,
            self.config.terrain,
            params.sigma_x,
            params.sigma_y,
            &mut self.rng,
        ));
        let (w, h) = (
            self.config.world_width as f32,
            self.config.world_height as f32,
        );
        self.hq = Position::new(w / 2.0, h / 2.0);
        self.targets = (0..self.config.nb_targets)
            .map(|_| {
                Position::new(
                    self.rng.random_range(0.0..w),
                    self.rng.random_range(0.0..h),
                )
            })
            .collect();
        self.roster = TankRoster::new();
        match &self.config.initial_positions {
            Some(positions) => {
                for &(x, y) in positions {
                    self.roster.spawn(Position::new(x, y));
                }
            }
            None => {
                for _ in 0..params.nb_tanks {
                    let position = Position::new(
                        self.rng.random_range(0.0..w),
                        self.rng.random_range(0.0..h),
                    );
                    self.roster.spawn(position);
                }
            }
        }
        self.links.clear();
        self.history.clear();
        self.mobility = make_mobility(self.config.mobility);
        self.connectivity = make_connectivity(self.config.connectivity);
    }

    /// Advance one tick: mobility, link recomputation, audit, counter,
    /// history. The controller only calls this while RUNNING; calling it
    /// directly (as tests do) advances unconditionally.
    pub fn step(&mut self) -> TickEvents {
        self.stage_mobility();
        self.stage_connectivity();
        let healed = self.audit_links();
        self.step = self.step.next();
        self.push_summary();
        TickEvents {
            tick: self.step,
            links: self.links.len(),
            healed_links: healed,
        }
    }

    fn stage_mobility(&mut self) {
        let alive: Vec<u32> = self.roster.alive().map(|tank| tank.idx).collect();
        let hq = self.hq;
        let targets = std::mem::take(&mut self.targets);
        let ctx = MobilityContext {
            width: self.config.world_width as f32,
            height: self.config.world_height as f32,
            max_step_size: self.config.params.max_step_size,
            hq,
            targets: &targets,
        };
        // Dead tanks draw nothing; alive tanks advance in identity order so
        // seeded runs stay reproducible.
        for idx in alive {
            let Some(tank) = self.roster.get(idx).copied() else {
                continue;
            };
            let next = self.mobility.step(&tank, &ctx, &mut self.rng);
            if let Some(tank) = self.roster.get_mut(idx) {
                tank.position = next;
            }
        }
        self.targets = targets;
    }

    fn stage_connectivity(&mut self) {
        let alive: Vec<(u32, Position)> = self
            .roster
            .alive()
            .map(|tank| (tank.idx, tank.position))
            .collect();
        let view = ConnectivityView {
            tanks: &alive,
            hq: self.hq,
            radio_range: self.config.radio_range,
            terrain: &self.terrain,
        };
        self.links = self.connectivity.compute_links(&view);
    }

    /// Discard links that reference a non-alive tank, returning how many
    /// were healed. Runs after every recomputation and after every kill so
    /// a policy bug can never leak corruption into a published snapshot.
    fn audit_links(&mut self) -> usize {
        let roster = &self.roster;
        let before = self.links.len();
        self.links.retain(|link| {
            [link.a, link.b].iter().all(|end| match end {
                LinkEnd::Hq => true,
                LinkEnd::Tank(idx) => roster.is_alive(*idx),
            })
        });
        before - self.links.len()
    }

    fn push_summary(&mut self) {
        let mut degree: HashMap<u32, usize> = HashMap::new();
        let mut hq_degree = 0;
        for link in &self.links {
            for end in [link.a, link.b] {
                match end {
                    LinkEnd::Hq => hq_degree += 1,
                    LinkEnd::Tank(idx) => *degree.entry(idx).or_default() += 1,
                }
            }
        }
        let isolated = self
            .roster
            .alive()
            .filter(|tank| !degree.contains_key(&tank.idx))
            .count();
        let summary = TickSummary {
            tick: self.step,
            alive: self.roster.alive_count(),
            links: self.links.len(),
            isolated,
            hq_degree,
        };
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Apply one control command as an atomic transition.
    pub fn apply_command(&mut self, command: ControlCommand) -> CommandOutcome {
        match command {
            ControlCommand::Start => {
                if self.running {
                    CommandOutcome::AlreadyRunning
                } else {
                    self.running = true;
                    CommandOutcome::Started
                }
            }
            ControlCommand::Stop => {
                if self.running {
                    self.running = false;
                    CommandOutcome::Stopped
                } else {
                    CommandOutcome::AlreadyStopped
                }
            }
            ControlCommand::Reset => {
                self.reset();
                CommandOutcome::ResetComplete
            }
            ControlCommand::SetParams(params) => self.apply_params(params),
            ControlCommand::KillTank { idx } => match self.roster.kill(idx) {
                RosterKill::Unknown => CommandOutcome::UnknownTank { idx },
                RosterKill::AlreadyDead => CommandOutcome::AlreadyDead { idx },
                RosterKill::Killed => {
                    self.audit_links();
                    CommandOutcome::Killed { idx }
                }
            },
            ControlCommand::SpawnTank { x, y } => {
                let position = clamp_to_bounds(
                    Position::new(x, y),
                    self.config.world_width as f32,
                    self.config.world_height as f32,
                );
                let idx = self.roster.spawn(position);
                CommandOutcome::Spawned { idx }
            }
        }
    }

    fn apply_params(&mut self, params: SimParams) -> CommandOutcome {
        if let Err(err) = params.validate() {
            return CommandOutcome::Rejected(err);
        }
        let current = self.config.params;
        let step_only = params.nb_tanks == current.nb_tanks
            && params.sigma_x == current.sigma_x
            && params.sigma_y == current.sigma_y;
        if self.config.live_param_tuning && step_only {
            self.config.params = params;
            CommandOutcome::ParamsAdjusted
        } else {
            self.config.params = params;
            // A population or terrain parameter changed; the preset
            // formation no longer matches the new count.
            if let Some(positions) = &self.config.initial_positions
                && positions.len() != params.nb_tanks as usize
            {
                self.config.initial_positions = None;
            }
            self.reset();
            CommandOutcome::ParamsApplied
        }
    }

    /// Build the immutable snapshot for publication.
    #[must_use]
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            step: self.step.0,
            map_size: (self.config.world_width, self.config.world_height),
            terrain: Arc::clone(&self.terrain),
            tanks: self
                .roster
                .alive()
                .map(|tank| TankView {
                    idx: tank.idx,
                    x: tank.position.x,
                    y: tank.position.y,
                })
                .collect(),
            links: self.links.clone(),
            hq: (self.hq.x, self.hq.y),
            targets: self.targets.iter().map(|t| (t.x, t.y)).collect(),
            running: self.running,
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &TankNetConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.step
    }

    /// Whether the stepper should be advancing this world.
    #[must_use]
    pub const fn running(&self) -> bool {
        self.running
    }

    /// Read-only access to the tank roster.
    #[must_use]
    pub fn roster(&self) -> &TankRoster {
        &self.roster
    }

    /// The current derived link set.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The current terrain instance.
    #[must_use]
    pub fn terrain(&self) -> &Arc<TerrainField> {
        &self.terrain
    }

    /// Fixed HQ position for this terrain instance.
    #[must_use]
    pub const fn hq(&self) -> Position {
        self.hq
    }

    /// Fixed target positions for this terrain instance.
    #[must_use]
    pub fn targets(&self) -> &[Position] {
        &self.targets
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_config(nb_tanks: u32) -> TankNetConfig {
        TankNetConfig {
            params: SimParams {
                nb_tanks,
                ..SimParams::default()
            },
            rng_seed: Some(0xA11CE),
            ..TankNetConfig::default()
        }
    }

    fn line_config(positions: Vec<(f32, f32)>) -> TankNetConfig {
        TankNetConfig {
            params: SimParams {
                nb_tanks: positions.len() as u32,
                max_step_size: 0.0,
                ..SimParams::default()
            },
            initial_positions: Some(positions),
            terrain: TerrainKind::Flat,
            rng_seed: Some(7),
            ..TankNetConfig::default()
        }
    }

    #[test]
    fn terrain_is_deterministic_for_a_seed() {
        let mut rng_a = SmallRng::seed_from_u64(99);
        let mut rng_b = SmallRng::seed_from_u64(99);
        let a = TerrainField::generate(64, 48, TerrainKind::Smoothed, 8.0, 3.0, &mut rng_a);
        let b = TerrainField::generate(64, 48, TerrainKind::Smoothed, 8.0, 3.0, &mut rng_b);
        assert_eq!(a.cells(), b.cells());
        assert!(a.cells().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn larger_sigma_smooths_harder() {
        let roughness = |sigma: f32| {
            let mut rng = SmallRng::seed_from_u64(5);
            let field = TerrainField::generate(80, 80, TerrainKind::Smoothed, sigma, sigma, &mut rng);
            let cells = field.cells();
            let mut acc = 0.0_f32;
            for y in 0..80_usize {
                for x in 1..80_usize {
                    acc += (cells[y * 80 + x] - cells[y * 80 + x - 1]).abs();
                }
            }
            acc / cells.iter().fold(0.0_f32, |m, v| m.max(v.abs()))
        };
        assert!(roughness(8.0) < roughness(1.0));
    }

    #[test]
    fn sine_ridges_match_closed_form() {
        let mut rng = SmallRng::seed_from_u64(1);
        let field = TerrainField::generate(
            20,
            20,
            TerrainKind::SineRidges {
                freq_x: 1.0,
                freq_y: 2.0,
            },
            1.0,
            1.0,
            &mut rng,
        );
        let expected = (std::f32::consts::TAU * 3.0 / 20.0).sin()
            * (std::f32::consts::TAU * 2.0 * 7.0 / 20.0).sin();
        assert!((field.get(3, 7).unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn altitude_sampling_rounds_and_clamps() {
        let mut field = TerrainField::flat(4, 4);
        field.cells[5] = 2.5; // cell (1, 1)
        assert_eq!(field.altitude(1.2, 0.8), 2.5);
        assert_eq!(field.altitude(-3.0, 0.0), field.get(0, 0).unwrap());
        assert_eq!(field.altitude(400.0, 400.0), field.get(3, 3).unwrap());
    }

    #[test]
    fn roster_identities_are_stable_across_kills() {
        let mut roster = TankRoster::new();
        for i in 0..4 {
            let idx = roster.spawn(Position::new(i as f32, 0.0));
            assert_eq!(idx, i);
        }
        assert_eq!(roster.kill(1), RosterKill::Killed);
        assert_eq!(roster.kill(1), RosterKill::AlreadyDead);
        assert_eq!(roster.kill(9), RosterKill::Unknown);
        assert_eq!(roster.alive_count(), 3);
        // survivors keep their identities
        let alive: Vec<u32> = roster.alive().map(|t| t.idx).collect();
        assert_eq!(alive, vec![0, 2, 3]);
        // reinforcements never reuse an identity
        assert_eq!(roster.spawn(Position::default()), 4);
    }

    #[test]
    fn random_walk_respects_bound_and_bounds() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut policy = RandomWalkMobility;
        let ctx = MobilityContext {
            width: 10.0,
            height: 10.0,
            max_step_size: 2.0,
            hq: Position::new(5.0, 5.0),
            targets: &[],
        };
        let mut tank = Tank {
            idx: 0,
            position: Position::new(0.5, 9.5),
            alive: true,
        };
        for _ in 0..200 {
            let next = policy.step(&tank, &ctx, &mut rng);
            assert!(tank.position.distance(next) <= 2.0 + 1e-4);
            assert!((0.0..10.0).contains(&next.x));
            assert!((0.0..10.0).contains(&next.y));
            tank.position = next;
        }
    }

    #[test]
    fn zero_step_size_freezes_positions() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut policy = RandomWalkMobility;
        let ctx = MobilityContext {
            width: 10.0,
            height: 10.0,
            max_step_size: 0.0,
            hq: Position::new(5.0, 5.0),
            targets: &[],
        };
        let tank = Tank {
            idx: 0,
            position: Position::new(4.0, 4.0),
            alive: true,
        };
        let next = policy.step(&tank, &ctx, &mut rng);
        assert_eq!(next, tank.position);
    }

    #[test]
    fn target_seeker_heads_for_its_goal() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut policy = TargetSeekingMobility::default();
        let targets = [Position::new(9.0, 0.0)];
        let ctx = MobilityContext {
            width: 10.0,
            height: 10.0,
            max_step_size: 1.0,
            hq: Position::new(0.0, 0.0),
            targets: &targets,
        };
        let mut tank = Tank {
            idx: 0,
            position: Position::new(0.0, 0.0),
            alive: true,
        };
        let before = tank.position.distance(targets[0]);
        let next = policy.step(&tank, &ctx, &mut rng);
        assert!(tank.position.distance(next) <= 1.0 + 1e-5);
        assert!(next.distance(targets[0]) < before);

        // park it at the target; the next step turns back toward HQ
        tank.position = Position::new(8.5, 0.0);
        let toward_hq = policy.step(&tank, &ctx, &mut rng);
        assert!(toward_hq.x < tank.position.x);
        assert!(toward_hq.distance(ctx.hq) < tank.position.distance(ctx.hq));
    }

    #[test]
    fn range_links_are_inclusive_at_the_boundary() {
        let terrain = TerrainField::flat(100, 100);
        let tanks = [
            (0, Position::new(10.0, 10.0)),
            (1, Position::new(30.0, 10.0)),
        ];
        let mut policy = RangeConnectivity::default();
        let links = policy.compute_links(&ConnectivityView {
            tanks: &tanks,
            hq: Position::new(90.0, 90.0),
            radio_range: 20.0,
            terrain: &terrain,
        });
        assert_eq!(
            links,
            vec![Link::new(LinkEnd::Tank(0), LinkEnd::Tank(1))]
        );

        let tanks = [
            (0, Position::new(10.0, 10.0)),
            (1, Position::new(30.01, 10.0)),
        ];
        let links = policy.compute_links(&ConnectivityView {
            tanks: &tanks,
            hq: Position::new(90.0, 90.0),
            radio_range: 20.0,
            terrain: &terrain,
        });
        assert!(links.is_empty());
    }

    #[test]
    fn coincident_participants_are_linked() {
        let terrain = TerrainField::flat(10, 10);
        let tanks = [(0, Position::new(5.0, 5.0)), (1, Position::new(5.0, 5.0))];
        let mut policy = RangeConnectivity::default();
        let links = policy.compute_links(&ConnectivityView {
            tanks: &tanks,
            hq: Position::new(5.0, 5.0),
            radio_range: 1.0,
            terrain: &terrain,
        });
        assert_eq!(links.len(), 3);
        assert!(links.iter().all(|l| l.a != l.b));
    }

    #[test]
    fn grid_agrees_with_pairwise_sweep() {
        let terrain = TerrainField::flat(100, 100);
        let tanks: Vec<(u32, Position)> = (0..40)
            .map(|i| {
                let f = i as f32;
                (i, Position::new((f * 17.3) % 100.0, (f * 31.1) % 100.0))
            })
            .collect();
        let hq = Position::new(50.0, 50.0);
        let mut policy = RangeConnectivity::default();
        let from_grid = policy.compute_links(&ConnectivityView {
            tanks: &tanks,
            hq,
            radio_range: 18.0,
            terrain: &terrain,
        });
        let mut ends: Vec<(LinkEnd, Position)> = tanks
            .iter()
            .map(|&(idx, p)| (LinkEnd::Tank(idx), p))
            .collect();
        ends.push((LinkEnd::Hq, hq));
        assert_eq!(from_grid, pairwise_links(&ends, 18.0));
    }

    #[test]
    fn terrain_shadow_drops_occluded_links() {
        let mut terrain = TerrainField::flat(40, 40);
        // a wall between x=10 and x=30 at y=10
        for x in 15..25 {
            terrain.cells[10 * 40 + x] = 5.0;
        }
        let tanks = [
            (0, Position::new(10.0, 10.0)),
            (1, Position::new(30.0, 10.0)),
            (2, Position::new(10.0, 30.0)),
            (3, Position::new(30.0, 30.0)),
        ];
        let mut policy = TerrainShadowConnectivity::new(1.0);
        let links = policy.compute_links(&ConnectivityView {
            tanks: &tanks,
            hq: Position::new(0.0, 0.0),
            radio_range: 20.0,
            terrain: &terrain,
        });
        let wall_pair = Link::new(LinkEnd::Tank(0), LinkEnd::Tank(1));
        let open_pair = Link::new(LinkEnd::Tank(2), LinkEnd::Tank(3));
        assert!(!links.contains(&wall_pair));
        assert!(links.contains(&open_pair));
    }

    #[test]
    fn world_initialises_with_full_population() {
        let world = WorldState::new(seeded_config(8)).expect("world");
        assert_eq!(world.tick(), Tick(0));
        assert!(!world.running());
        assert_eq!(world.roster().alive_count(), 8);
        assert_eq!(world.terrain().width(), 100);
        assert_eq!(world.targets().len(), 3);
        assert_eq!(world.hq(), Position::new(50.0, 50.0));
        for tank in world.roster().alive() {
            assert!((0.0..100.0).contains(&tank.position.x));
            assert!((0.0..100.0).contains(&tank.position.y));
        }
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = TankNetConfig::default();
        config.params.nb_tanks = 0;
        assert!(WorldState::new(config).is_err());

        let mut config = TankNetConfig::default();
        config.params.max_step_size = -1.0;
        assert!(WorldState::new(config).is_err());

        let mut config = TankNetConfig::default();
        config.params.sigma_x = 0.0;
        assert!(WorldState::new(config).is_err());

        let mut config = TankNetConfig::default();
        config.initial_positions = Some(vec![(1.0, 1.0)]);
        assert!(WorldState::new(config).is_err());

        let mut config = TankNetConfig::default();
        config.radio_range = 0.0;
        assert!(WorldState::new(config).is_err());
    }

    #[test]
    fn step_advances_and_summarises() {
        let mut world = WorldState::new(seeded_config(5)).expect("world");
        let events = world.step();
        assert_eq!(world.tick(), Tick(1));
        assert_eq!(events.tick, Tick(1));
        assert_eq!(events.healed_links, 0);
        let summary = world.history().last().expect("summary");
        assert_eq!(summary.tick, Tick(1));
        assert_eq!(summary.alive, 5);
        assert_eq!(summary.links, world.links().len());
    }

    #[test]
    fn displacement_is_bounded_per_tick() {
        let mut config = seeded_config(5);
        config.params.max_step_size = 2.0;
        let mut world = WorldState::new(config).expect("world");
        let before: Vec<(u32, Position)> = world
            .roster()
            .alive()
            .map(|t| (t.idx, t.position))
            .collect();
        world.step();
        for (idx, old) in before {
            let tank = world.roster().get(idx).expect("tank");
            assert!(tank.position.distance(old) <= 2.0 + 1e-4);
        }
    }

    #[test]
    fn kill_removes_tank_and_its_links() {
        let mut world = WorldState::new(line_config(vec![
            (45.0, 50.0),
            (48.0, 50.0),
        ]))
        .expect("world");
        world.step();
        assert!(world.links().iter().any(|l| l.touches(0)));

        let outcome = world.apply_command(ControlCommand::KillTank { idx: 0 });
        assert_eq!(outcome, CommandOutcome::Killed { idx: 0 });
        assert!(world.links().iter().all(|l| !l.touches(0)));
        assert!(!world.roster().is_alive(0));
        assert!(world.roster().is_alive(1));

        let again = world.apply_command(ControlCommand::KillTank { idx: 0 });
        assert_eq!(again, CommandOutcome::AlreadyDead { idx: 0 });
        let unknown = world.apply_command(ControlCommand::KillTank { idx: 42 });
        assert_eq!(unknown, CommandOutcome::UnknownTank { idx: 42 });
    }

    #[test]
    fn killing_the_only_neighbor_drops_the_hq_link() {
        // one tank parked next to HQ, the other far outside radio range
        let mut world = WorldState::new(line_config(vec![
            (55.0, 50.0),
            (5.0, 5.0),
        ]))
        .expect("world");
        world.step();
        assert!(world.links().iter().any(Link::touches_hq));

        world.apply_command(ControlCommand::KillTank { idx: 0 });
        world.step();
        let snapshot = world.snapshot();
        assert!(!snapshot.links.iter().any(Link::touches_hq));
    }

    #[test]
    fn dead_tanks_draw_no_randomness() {
        // Alive tanks draw in ascending identity order, so killing the last
        // tank must not disturb the survivors' random stream at all.
        let make = || {
            let mut config = seeded_config(4);
            config.params.max_step_size = 1.5;
            config.terrain = TerrainKind::Flat;
            WorldState::new(config).expect("world")
        };
        let mut killed = make();
        let mut control = make();
        killed.apply_command(ControlCommand::KillTank { idx: 3 });
        let frozen = killed.roster().get(3).expect("tank").position;
        for _ in 0..5 {
            killed.step();
            control.step();
        }
        for idx in 0..3 {
            assert_eq!(
                killed.roster().get(idx).map(|t| t.position),
                control.roster().get(idx).map(|t| t.position)
            );
        }
        // the dead tank never moves again
        assert_eq!(killed.roster().get(3).expect("tank").position, frozen);
    }

    #[test]
    fn seeded_worlds_evolve_identically() {
        let mut a = WorldState::new(seeded_config(6)).expect("a");
        let mut b = WorldState::new(seeded_config(6)).expect("b");
        for _ in 0..12 {
            a.step();
            b.step();
        }
        assert_eq!(a.snapshot().tanks, b.snapshot().tanks);
        assert_eq!(a.snapshot().links, b.snapshot().links);
        assert_eq!(a.terrain().cells(), b.terrain().cells());
    }

    #[test]
    fn reset_restores_population_and_step() {
        let mut world = WorldState::new(seeded_config(6)).expect("world");
        world.apply_command(ControlCommand::Start);
        for _ in 0..4 {
            world.step();
        }
        world.apply_command(ControlCommand::KillTank { idx: 2 });
        assert_eq!(world.roster().alive_count(), 5);

        let outcome = world.apply_command(ControlCommand::Reset);
        assert_eq!(outcome, CommandOutcome::ResetComplete);
        assert_eq!(world.tick(), Tick(0));
        assert!(!world.running());
        assert_eq!(world.roster().alive_count(), 6);
        assert!(world.links().is_empty());
        assert!(world.history().next().is_none());
    }

    #[test]
    fn start_stop_are_idempotent() {
        let mut world = WorldState::new(seeded_config(2)).expect("world");
        assert_eq!(
            world.apply_command(ControlCommand::Start),
            CommandOutcome::Started
        );
        assert_eq!(
            world.apply_command(ControlCommand::Start),
            CommandOutcome::AlreadyRunning
        );
        assert_eq!(
            world.apply_command(ControlCommand::Stop),
            CommandOutcome::Stopped
        );
        assert_eq!(
            world.apply_command(ControlCommand::Stop),
            CommandOutcome::AlreadyStopped
        );
    }

    #[test]
    fn rejected_params_leave_the_world_untouched() {
        let mut world = WorldState::new(seeded_config(4)).expect("world");
        world.step();
        let before = world.snapshot();
        let bad = SimParams {
            nb_tanks: 0,
            ..SimParams::default()
        };
        let outcome = world.apply_command(ControlCommand::SetParams(bad));
        assert_eq!(outcome, CommandOutcome::Rejected(ParamError::ZeroTanks));
        let after = world.snapshot();
        assert_eq!(before.step, after.step);
        assert_eq!(before.tanks, after.tanks);
        assert_eq!(before.links, after.links);
        assert_eq!(world.config().params, seeded_config(4).params);

        let negative_step = SimParams {
            max_step_size: -0.5,
            ..SimParams::default()
        };
        assert_eq!(
            world.apply_command(ControlCommand::SetParams(negative_step)),
            CommandOutcome::Rejected(ParamError::InvalidStepSize)
        );
    }

    #[test]
    fn set_params_resets_with_the_new_population() {
        let mut world = WorldState::new(seeded_config(4)).expect("world");
        for _ in 0..3 {
            world.step();
        }
        let params = SimParams {
            nb_tanks: 9,
            ..SimParams::default()
        };
        let outcome = world.apply_command(ControlCommand::SetParams(params));
        assert_eq!(outcome, CommandOutcome::ParamsApplied);
        assert_eq!(world.tick(), Tick(0));
        assert_eq!(world.roster().alive_count(), 9);
        assert!(!world.running());
    }

    #[test]
    fn live_tuning_adjusts_step_bound_in_place() {
        let mut config = seeded_config(4);
        config.live_param_tuning = true;
        let mut world = WorldState::new(config).expect("world");
        world.step();
        let before = world.snapshot();

        let tuned = SimParams {
            max_step_size: 1.7,
            ..world.config().params
        };
        let outcome = world.apply_command(ControlCommand::SetParams(tuned));
        assert_eq!(outcome, CommandOutcome::ParamsAdjusted);
        assert_eq!(world.tick().0, before.step);
        assert_eq!(world.snapshot().tanks, before.tanks);
        assert_eq!(world.config().params.max_step_size, 1.7);

        // a population change still forces the full reset
        let repop = SimParams {
            nb_tanks: 7,
            ..world.config().params
        };
        assert_eq!(
            world.apply_command(ControlCommand::SetParams(repop)),
            CommandOutcome::ParamsApplied
        );
        assert_eq!(world.tick(), Tick(0));
        assert_eq!(world.roster().alive_count(), 7);
    }

    #[test]
    fn spawned_reinforcements_get_fresh_identities() {
        let mut world = WorldState::new(seeded_config(3)).expect("world");
        world.apply_command(ControlCommand::KillTank { idx: 2 });
        let outcome = world.apply_command(ControlCommand::SpawnTank { x: 1.0, y: 2.0 });
        assert_eq!(outcome, CommandOutcome::Spawned { idx: 3 });
        assert!(world.roster().is_alive(3));
        assert_eq!(world.roster().alive_count(), 3);
        // out-of-bounds spawn positions are clamped inside the map
        let outcome = world.apply_command(ControlCommand::SpawnTank { x: 500.0, y: -4.0 });
        assert_eq!(outcome, CommandOutcome::Spawned { idx: 4 });
        let tank = world.roster().get(4).expect("tank");
        assert!((0.0..100.0).contains(&tank.position.x));
        assert!((0.0..100.0).contains(&tank.position.y));
    }

    #[test]
    fn audit_heals_corrupt_links() {
        let mut world = WorldState::new(seeded_config(2)).expect("world");
        world
            .links
            .push(Link::new(LinkEnd::Tank(99), LinkEnd::Hq));
        let healed = world.audit_links();
        assert_eq!(healed, 1);
        assert!(world.links().iter().all(|l| !l.touches(99)));
    }

    #[test]
    fn snapshot_translates_links_to_positions() {
        let mut world = WorldState::new(line_config(vec![
            (45.0, 50.0),
            (48.0, 50.0),
            (5.0, 5.0),
        ]))
        .expect("world");
        world.apply_command(ControlCommand::KillTank { idx: 0 });
        world.step();
        let snapshot = world.snapshot();
        assert_eq!(snapshot.tanks.len(), 2);
        let positional = snapshot.positional_links();
        assert_eq!(positional.len(), snapshot.links.len());
        for &(a, b) in &positional {
            assert!(a <= snapshot.tanks.len());
            assert!(b <= snapshot.tanks.len());
        }
        // tank 1 sits next to HQ; its link must resolve to slot 0 after the
        // dead tank is dropped from the sequence
        assert!(positional.contains(&(0, snapshot.tanks.len())));
    }

    #[test]
    fn history_is_bounded() {
        let mut config = seeded_config(2);
        config.history_capacity = 4;
        let mut world = WorldState::new(config).expect("world");
        for _ in 0..10 {
            world.step();
        }
        let ticks: Vec<u64> = world.history().map(|s| s.tick.0).collect();
        assert_eq!(ticks, vec![7, 8, 9, 10]);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = TankNetConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: TankNetConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }
}

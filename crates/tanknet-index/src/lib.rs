//! Spatial indexing abstractions for radio neighborhood queries.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from participant positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit neighbors of `slot` within the provided squared radius.
    ///
    /// The visitor receives the neighbor's slot in the `rebuild` order and
    /// the squared distance to it. The participant itself is never visited.
    fn neighbors_within(
        &self,
        slot: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid index bucketing participants into square cells.
///
/// A radius query only touches the cells overlapping the query disk, so the
/// cost is proportional to local density rather than total population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing participants.
    pub cell_size: f32,
    #[serde(skip)]
    buckets: HashMap<(i32, i32), Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            buckets: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Number of participants currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the index holds no participants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn cell_of(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(20.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        self.buckets.clear();
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (slot, &(x, y)) in positions.iter().enumerate() {
            let cell = self.cell_of(x, y);
            self.buckets.entry(cell).or_default().push(slot);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        slot: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(&(x, y)) = self.positions.get(slot) else {
            return;
        };
        if radius_sq < 0.0 {
            return;
        }
        let reach = (radius_sq.sqrt() / self.cell_size).ceil() as i32;
        let (cx, cy) = self.cell_of(x, y);
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                let Some(bucket) = self.buckets.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &other in bucket {
                    if other == slot {
                        continue;
                    }
                    let (ox, oy) = self.positions[other];
                    let d2 = (ox - x).powi(2) + (oy - y).powi(2);
                    if d2 <= radius_sq {
                        visitor(other, OrderedFloat(d2));
                    }
                }
            }
        }
    }
}

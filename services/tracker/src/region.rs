//! Spatial zone resolution for a single feed.
//!
//! Zones are declared in normalized `[0, 1]` coordinates and rescaled to pixel
//! coordinates the first time a frame of a given resolution is observed. A
//! point is resolved against polygonal block zones and rectangular seat zones
//! independently; the first zone in declaration order wins.

use serde::Deserialize;
use std::collections::HashMap;

/// A pixel position inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A named polygon in normalized coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockZone {
    pub name: String,
    pub vertices: Vec<(f64, f64)>,
}

/// A named axis-aligned box in normalized `(origin_x, origin_y, width, height)` form.
#[derive(Debug, Clone, PartialEq)]
pub struct SeatZone {
    pub name: String,
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: f64,
    pub height: f64,
}

/// Zone definitions for one feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneSet {
    pub blocks: Vec<BlockZone>,
    pub seats: Vec<SeatZone>,
}

impl ZoneSet {
    /// Whether any zone at all is defined.
    pub fn is_configured(&self) -> bool {
        !self.blocks.is_empty() || !self.seats.is_empty()
    }
}

/// Where a point landed relative to a feed's zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The feed has no zones; presence filtering is vacuously satisfied.
    Unconfigured,
    /// Zones exist but the point is in none of them.
    Outside,
    /// The point is in at least one block or seat zone.
    Inside {
        block: Option<String>,
        seat: Option<String>,
    },
}

impl Placement {
    /// Whether the point passes the presence filter.
    pub fn is_present(&self) -> bool {
        !matches!(self, Placement::Outside)
    }

    pub fn block(&self) -> Option<&str> {
        match self {
            Placement::Inside { block, .. } => block.as_deref(),
            _ => None,
        }
    }

    pub fn seat(&self) -> Option<&str> {
        match self {
            Placement::Inside { seat, .. } => seat.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ScaledBlock {
    name: String,
    vertices: Vec<Point>,
}

#[derive(Debug, Clone)]
struct ScaledSeat {
    name: String,
    x_min: i32,
    y_min: i32,
    x_max: i32,
    y_max: i32,
}

/// Per-feed region resolver with memoized pixel geometry.
#[derive(Debug)]
pub struct RegionIndex {
    zones: ZoneSet,
    resolution: Option<(u32, u32)>,
    blocks: Vec<ScaledBlock>,
    seats: Vec<ScaledSeat>,
}

impl RegionIndex {
    pub fn new(zones: ZoneSet) -> Self {
        Self {
            zones,
            resolution: None,
            blocks: Vec::new(),
            seats: Vec::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.zones.is_configured()
    }

    /// Rescale zones for the given frame resolution.
    ///
    /// Returns `true` when the geometry was recomputed, `false` when the
    /// resolution matched the last observed one.
    pub fn rescale(&mut self, width: u32, height: u32) -> bool {
        if self.resolution == Some((width, height)) {
            return false;
        }

        let (w, h) = (width as f64, height as f64);

        self.blocks = self
            .zones
            .blocks
            .iter()
            .map(|zone| ScaledBlock {
                name: zone.name.clone(),
                vertices: zone
                    .vertices
                    .iter()
                    .map(|&(x, y)| Point::new((x * w) as i32, (y * h) as i32))
                    .collect(),
            })
            .collect();

        self.seats = self
            .zones
            .seats
            .iter()
            .map(|zone| ScaledSeat {
                name: zone.name.clone(),
                x_min: (zone.origin_x * w) as i32,
                y_min: (zone.origin_y * h) as i32,
                x_max: ((zone.origin_x + zone.width) * w) as i32,
                y_max: ((zone.origin_y + zone.height) * h) as i32,
            })
            .collect();

        self.resolution = Some((width, height));
        true
    }

    /// Resolve a pixel point against the zones scaled by the last `rescale`.
    pub fn resolve(&self, point: Point) -> Placement {
        if !self.is_configured() {
            return Placement::Unconfigured;
        }

        let block = self
            .blocks
            .iter()
            .find(|zone| polygon_contains(&zone.vertices, point))
            .map(|zone| zone.name.clone());

        let seat = self
            .seats
            .iter()
            .find(|zone| {
                zone.x_min < point.x
                    && point.x < zone.x_max
                    && zone.y_min < point.y
                    && point.y < zone.y_max
            })
            .map(|zone| zone.name.clone());

        if block.is_none() && seat.is_none() {
            Placement::Outside
        } else {
            Placement::Inside { block, seat }
        }
    }
}

/// Inside-or-on-boundary test for a closed polygon.
fn polygon_contains(vertices: &[Point], point: Point) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (a, b) = (vertices[i], vertices[j]);

        if on_segment(a, b, point) {
            return true;
        }

        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = (b.x as f64 - a.x as f64) * (point.y as f64 - a.y as f64)
                / (b.y as f64 - a.y as f64)
                + a.x as f64;
            if (point.x as f64) < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    // i32 differences need 33 bits and their products 66
    let (ax, ay) = (a.x as i128, a.y as i128);
    let cross = (b.x as i128 - ax) * (p.y as i128 - ay) - (b.y as i128 - ay) * (p.x as i128 - ax);
    cross == 0
        && p.x >= a.x.min(b.x)
        && p.x <= a.x.max(b.x)
        && p.y >= a.y.min(b.y)
        && p.y <= a.y.max(b.y)
}

/// Errors raised while interpreting region definition files.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("Zone entry for source {source_id} must have exactly one name key")]
    MalformedEntry { source_id: String },

    #[error("Seat zone {name} must have 4 values, got {len}")]
    SeatArity { name: String, len: usize },
}

/// Raw `{ "<zone name>": <geometry> }` entries as they appear on disk.
pub type RawZoneEntries<G> = Vec<HashMap<String, G>>;

/// Build per-source zone sets from the on-disk block and seat definitions.
///
/// Each file maps a source id to an ordered list of single-key objects whose key
/// is the zone name.
pub fn zone_sets_from_raw(
    blocks: HashMap<String, RawZoneEntries<Vec<[f64; 2]>>>,
    seats: HashMap<String, RawZoneEntries<Vec<f64>>>,
) -> Result<HashMap<String, ZoneSet>, RegionError> {
    let mut sets: HashMap<String, ZoneSet> = HashMap::new();

    for (source_id, entries) in blocks {
        let set = sets.entry(source_id.clone()).or_default();
        for entry in entries {
            let (name, points) = single_entry(&source_id, entry)?;
            set.blocks.push(BlockZone {
                name,
                vertices: points.into_iter().map(|[x, y]| (x, y)).collect(),
            });
        }
    }

    for (source_id, entries) in seats {
        let set = sets.entry(source_id.clone()).or_default();
        for entry in entries {
            let (name, values) = single_entry(&source_id, entry)?;
            if values.len() != 4 {
                return Err(RegionError::SeatArity {
                    name,
                    len: values.len(),
                });
            }
            set.seats.push(SeatZone {
                name,
                origin_x: values[0],
                origin_y: values[1],
                width: values[2],
                height: values[3],
            });
        }
    }

    Ok(sets)
}

fn single_entry<G>(source_id: &str, entry: HashMap<String, G>) -> Result<(String, G), RegionError> {
    if entry.len() != 1 {
        return Err(RegionError::MalformedEntry {
            source_id: source_id.to_string(),
        });
    }
    entry
        .into_iter()
        .next()
        .ok_or_else(|| RegionError::MalformedEntry {
            source_id: source_id.to_string(),
        })
}

/// Deserializable shape of the block regions file.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct BlockRegionsFile(pub HashMap<String, RawZoneEntries<Vec<[f64; 2]>>>);

/// Deserializable shape of the seat regions file.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct SeatRegionsFile(pub HashMap<String, RawZoneEntries<Vec<f64>>>);

//! Deck geometry for XYZ liquid handlers
//!
//! A liquid handler deck has numbered beds (1 is the far left). Each bed
//! carries a rack whose layout code fixes the well grid and the probe working
//! height. Wells are numbered from 1, column by column: all wells at the
//! first X offset, front to back, then the next column.
//!
//! ```text
//!   bed 1        bed 2        ...
//!   ┌──────┐     ┌──────┐
//!   │ 1  10│     │ 1  10│      wells run along Y first,
//!   │ 2  11│     │ 2  11│      then step to the next X column
//!   │ ...  │     │ ...  │
//!   └──────┘     └──────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bed positions on a full-size deck.
pub const BED_COUNT: u32 = 6;

/// Supported rack layouts, identified by their catalogue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum RackLayout {
    /// 27 positions, 3 × 9.
    Code204,
    /// 75 positions, 5 × 15.
    Code207,
    /// 96 positions, 6 × 16 with every other column staggered.
    Code209,
    /// 20 positions, 5 × 4, for single-bed printer-frame handlers.
    Code304,
}

struct Geometry {
    columns: &'static [f64],
    rows: Rows,
    // Probe tip height above the bed at the working position.
    height_mm: f64,
    // X offset of each bed, or `None` for single-bed frames.
    bed_offsets: Option<[f64; BED_COUNT as usize]>,
    // Added to Y on odd columns.
    stagger_mm: f64,
}

enum Rows {
    Listed(&'static [f64]),
    Pitched { first: f64, pitch: f64, count: u32 },
}

impl Rows {
    fn len(&self) -> u32 {
        match self {
            Rows::Listed(rows) => rows.len() as u32,
            Rows::Pitched { count, .. } => *count,
        }
    }

    fn at(&self, index: u32) -> f64 {
        match self {
            Rows::Listed(rows) => rows[index as usize],
            Rows::Pitched { first, pitch, .. } => first + pitch * f64::from(index),
        }
    }
}

static GEOMETRY_204: Geometry = Geometry {
    columns: &[0.0, 31.8, 63.6],
    rows: Rows::Listed(&[
        103.4, 135.2, 166.9, 198.7, 230.4, 262.1, 293.9, 325.6, 357.4,
    ]),
    height_mm: 60.0,
    bed_offsets: Some([22.2, 141.8, 261.3, 380.9, 500.5, 620.0]),
    stagger_mm: 0.0,
};

static GEOMETRY_207: Geometry = Geometry {
    columns: &[0.0, 19.3, 38.6, 57.9, 77.2],
    rows: Rows::Listed(&[
        95.0, 114.3, 133.6, 152.9, 172.2, 191.5, 210.8, 230.1, 249.4, 268.7, 288.0, 307.3, 326.6,
        345.9, 365.0,
    ]),
    height_mm: 115.0,
    bed_offsets: Some([15.0, 134.6, 254.2, 373.8, 493.4, 613.0]),
    stagger_mm: 0.0,
};

static GEOMETRY_209: Geometry = Geometry {
    columns: &[0.0, 16.6, 33.2, 49.8, 66.4, 83.0],
    rows: Rows::Pitched {
        first: 93.0,
        pitch: 17.7,
        count: 16,
    },
    height_mm: 86.0,
    bed_offsets: Some([13.0, 132.6, 252.2, 371.8, 491.4, 611.0]),
    stagger_mm: 8.5,
};

static GEOMETRY_304: Geometry = Geometry {
    columns: &[30.5, 71.5, 112.5, 153.5, 194.5],
    rows: Rows::Listed(&[30.5, 71.5, 112.5, 153.5]),
    height_mm: 10.0,
    bed_offsets: None,
    stagger_mm: 0.0,
};

impl RackLayout {
    /// Catalogue code.
    pub fn code(&self) -> u32 {
        match self {
            RackLayout::Code204 => 204,
            RackLayout::Code207 => 207,
            RackLayout::Code209 => 209,
            RackLayout::Code304 => 304,
        }
    }

    fn geometry(&self) -> &'static Geometry {
        match self {
            RackLayout::Code204 => &GEOMETRY_204,
            RackLayout::Code207 => &GEOMETRY_207,
            RackLayout::Code209 => &GEOMETRY_209,
            RackLayout::Code304 => &GEOMETRY_304,
        }
    }

    /// Number of wells in the rack.
    pub fn well_count(&self) -> u32 {
        let g = self.geometry();
        g.columns.len() as u32 * g.rows.len()
    }

    /// Position of `well` when the rack sits on `bed`.
    pub fn well_position(&self, bed: u32, well: u32) -> Result<WellPosition, DeckError> {
        let g = self.geometry();
        if well == 0 || well > self.well_count() {
            return Err(DeckError::NoSuchWell {
                bed,
                well,
                rack: *self,
            });
        }
        let offset = match g.bed_offsets {
            Some(offsets) => match bed.checked_sub(1).and_then(|i| offsets.get(i as usize)) {
                Some(offset) => *offset,
                None => return Err(DeckError::NoSuchBed(bed)),
            },
            None => 0.0,
        };

        let index = well - 1;
        let column = index / g.rows.len();
        let row = index % g.rows.len();
        let stagger = if column % 2 == 1 { g.stagger_mm } else { 0.0 };
        Ok(WellPosition {
            x_mm: g.columns[column as usize] + offset,
            y_mm: g.rows.at(row) + stagger,
            height_mm: g.height_mm,
        })
    }
}

impl TryFrom<u32> for RackLayout {
    type Error = DeckError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            204 => Ok(RackLayout::Code204),
            207 => Ok(RackLayout::Code207),
            209 => Ok(RackLayout::Code209),
            304 => Ok(RackLayout::Code304),
            other => Err(DeckError::UnknownLayout(other)),
        }
    }
}

impl From<RackLayout> for u32 {
    fn from(layout: RackLayout) -> Self {
        layout.code()
    }
}

impl fmt::Display for RackLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rack {}", self.code())
    }
}

/// Resolved well coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WellPosition {
    /// Deck X in mm.
    pub x_mm: f64,
    /// Deck Y in mm.
    pub y_mm: f64,
    /// Probe tip height above the bed at the working position, in mm.
    pub height_mm: f64,
}

/// Deck addressing failures.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeckError {
    #[error("unknown rack layout {0}; supported: 204, 207, 209, 304")]
    UnknownLayout(u32),

    #[error("bed {0} does not exist")]
    NoSuchBed(u32),

    #[error("no rack assigned to bed {0}")]
    EmptyBed(u32),

    #[error("{rack} on bed {bed} has no well {well}")]
    NoSuchWell { bed: u32, well: u32, rack: RackLayout },
}

/// Rack placed on a bed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BedAssignment {
    /// Bed number, 1-based.
    pub bed: u32,
    /// Rack layout code.
    pub rack: RackLayout,
}

/// Racks currently on the deck.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deck {
    beds: BTreeMap<u32, RackLayout>,
}

impl Deck {
    /// Build a deck from assignments. Later assignments replace earlier ones.
    pub fn new(assignments: &[BedAssignment]) -> Result<Self, DeckError> {
        let mut deck = Deck::default();
        for assignment in assignments {
            deck.assign(assignment.bed, assignment.rack)?;
        }
        Ok(deck)
    }

    /// Place `rack` on `bed`.
    pub fn assign(&mut self, bed: u32, rack: RackLayout) -> Result<(), DeckError> {
        if bed == 0 || (rack.geometry().bed_offsets.is_some() && bed > BED_COUNT) {
            return Err(DeckError::NoSuchBed(bed));
        }
        self.beds.insert(bed, rack);
        Ok(())
    }

    /// Rack on `bed`, if any.
    pub fn rack(&self, bed: u32) -> Option<RackLayout> {
        self.beds.get(&bed).copied()
    }

    /// Coordinates of `well` on `bed`.
    pub fn locate(&self, bed: u32, well: u32) -> Result<WellPosition, DeckError> {
        self.rack(bed)
            .ok_or(DeckError::EmptyBed(bed))?
            .well_position(bed, well)
    }
}

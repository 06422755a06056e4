//! Drawn gesture patterns
//!
//! A pattern is an ordered sequence of cell indices on a square grid. Cells are
//! numbered row-major from the top-left corner, so on a 3x3 grid the middle row
//! is `3, 4, 5`.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::DerivationError;

/// Smallest grid a pattern may be drawn on
pub const MIN_GRID_SIZE: u8 = 3;

/// Largest grid (one column letter per column)
pub const MAX_GRID_SIZE: u8 = 26;

/// Validated pattern, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Pattern {
    cells: Vec<u16>,
    grid: u8,
}

impl Pattern {
    /// Validate and wrap a pattern
    pub fn new(cells: Vec<u16>, grid: u8) -> Result<Self, DerivationError> {
        if !(MIN_GRID_SIZE..=MAX_GRID_SIZE).contains(&grid) {
            return Err(DerivationError::InvalidGridSize {
                grid,
                min: MIN_GRID_SIZE,
                max: MAX_GRID_SIZE,
            });
        }

        if cells.is_empty() {
            return Err(DerivationError::EmptyPattern);
        }

        let cell_count = u16::from(grid) * u16::from(grid);
        if let Some(&cell) = cells.iter().find(|&&c| c >= cell_count) {
            return Err(DerivationError::CellOutOfRange { cell, grid });
        }

        Ok(Self { cells, grid })
    }

    /// Parse the `"0,1,2,5"` form used by the CLI
    pub fn parse(text: &str, grid: u8) -> Result<Self, DerivationError> {
        let mut cells = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let cell = part
                .parse::<u16>()
                .map_err(|_| DerivationError::UnparsableCell(part.to_string()))?;
            cells.push(cell);
        }
        Self::new(cells, grid)
    }

    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    pub fn grid_size(&self) -> u8 {
        self.grid
    }

    /// Canonical byte encoding fed to the KDF: `grid=<G>;c0,c1,...`
    pub fn canonical_bytes(&self) -> Zeroizing<Vec<u8>> {
        let joined = self
            .cells
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut encoded = format!("grid={};{}", self.grid, joined);
        let bytes = Zeroizing::new(encoded.as_bytes().to_vec());
        encoded.zeroize();
        bytes
    }

    /// Grid-letter rendering, e.g. `A1-B2-C3`, used for auto-generated vault names.
    pub fn grid_letters(&self) -> String {
        self.cells
            .iter()
            .map(|&cell| {
                let row = cell / u16::from(self.grid);
                let col = cell % u16::from(self.grid);
                // col < 26 is guaranteed by MAX_GRID_SIZE
                format!("{}{}", char::from(b'A' + col as u8), row + 1)
            })
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("grid", &self.grid)
            .field("cells", &"<redacted>")
            .finish()
    }
}

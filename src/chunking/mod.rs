pub mod chunker;

/// Upper bound for points in a single chunk file. A cell at the finest
/// counter-grid level may still exceed this; that case is reported in the
/// logs and the oversized chunk is kept.
pub const MAX_POINTS_PER_CHUNK: i64 = 5_000_000;

/// Cells per axis of the fine counting grid.
pub const GRID_SIZE: i64 = 128;

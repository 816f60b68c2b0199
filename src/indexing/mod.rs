use crate::model::metadata::ChunkingMetadata;
use anyhow::{Context, Result};
use std::path::Path;

pub mod compression;
pub mod hierarchy;
pub mod indexing;
pub mod model;
pub mod writer;

/// Node split budget of the per-chunk octree builder. Nodes below this
/// count become leaves.
pub const MAX_POINTS_PER_NODE: i64 = 20_000;

pub fn read_chunking_metadata(path: &Path) -> Result<ChunkingMetadata> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("read chunk metadata {}", path.display()))?;

	serde_json::from_str(&contents).context("parse chunk metadata")
}

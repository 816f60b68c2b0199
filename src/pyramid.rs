//! Counter-grid pyramid shared by the chunker and the per-chunk octree
//! builder: collapse a Morton-addressed counting grid into the coarsest set
//! of octree cells that stay within a point budget.

use crate::morton::morton_encode;

#[derive(Clone, Debug)]
pub struct NodeCandidate {
	/// child digits relative to the grid root, e.g. "063"
	pub name: String,
	pub index_start: i64,
	pub num_points: i64,
	pub level: i64,
	pub x: i64,
	pub y: i64,
	pub z: i64,
}

/// Level `l` holds `8^l` cells, each the sum of its eight children one
/// level below. The last level is the input grid itself.
pub fn create_sum_pyramid(grid: Vec<i64>, grid_size: usize) -> Vec<Vec<i64>> {
	let max_level = (grid_size as f64).log2() as usize;

	let mut pyramid: Vec<Vec<i64>> = Vec::with_capacity(max_level + 1);
	for level in 0..max_level {
		pyramid.push(vec![0; 8usize.pow(level as u32)]);
	}
	pyramid.push(grid);

	let mut current_grid_size = grid_size / 2;
	for level in (0..max_level).rev() {
		for x in 0..current_grid_size {
			for y in 0..current_grid_size {
				for z in 0..current_grid_size {
					let index = morton_encode(x as u64, y as u64, z as u64) as usize;
					let index_p1 =
						morton_encode(2 * x as u64, 2 * y as u64, 2 * z as u64) as usize;

					let mut sum = 0;
					for i in 0..8 {
						sum += pyramid[level + 1][index_p1 + i];
					}

					pyramid[level][index] = sum;
				}
			}
		}

		current_grid_size /= 2;
	}

	pyramid
}

/// Walks the pyramid from the root, emitting every cell that fits the
/// budget (or sits at the finest level) as a candidate. Empty cells are
/// skipped.
pub fn create_nodes(pyramid: &[Vec<i64>], max_points: i64) -> Vec<NodeCandidate> {
	let mut pyramid_offsets: Vec<Vec<i64>> = Vec::with_capacity(pyramid.len());
	for counters in pyramid {
		let mut offsets = vec![0; counters.len()];
		for i in 1..counters.len() {
			offsets[i] = offsets[i - 1] + counters[i - 1];
		}

		pyramid_offsets.push(offsets);
	}

	let max_level = (pyramid.len() - 1) as i64;

	let root = NodeCandidate {
		name: String::new(),
		index_start: 0,
		num_points: 0,
		level: 0,
		x: 0,
		y: 0,
		z: 0,
	};

	let mut nodes = Vec::new();
	let mut stack = vec![root];

	while let Some(mut candidate) = stack.pop() {
		let level = candidate.level as usize;
		let (x, y, z) = (candidate.x, candidate.y, candidate.z);

		let index = morton_encode(x as u64, y as u64, z as u64) as usize;
		let num_points = pyramid[level][index];

		if candidate.level == max_level {
			// finest cell; may be split again in a later pass
			if num_points > 0 {
				candidate.num_points = num_points;
				nodes.push(candidate);
			}
		} else if num_points > max_points {
			for i in 0..8u64 {
				let index_p1 =
					morton_encode(2 * x as u64, 2 * y as u64, 2 * z as u64) as usize + i as usize;
				let count = pyramid[level + 1][index_p1];

				if count > 0 {
					stack.push(NodeCandidate {
						name: format!("{}{}", candidate.name, i),
						index_start: pyramid_offsets[level + 1][index_p1],
						num_points: count,
						level: candidate.level + 1,
						x: 2 * x + ((i as i64 & 0b100) >> 2),
						y: 2 * y + ((i as i64 & 0b010) >> 1),
						z: 2 * z + (i as i64 & 0b001),
					});
				}
			}
		} else if num_points > 0 {
			candidate.num_points = num_points;
			nodes.push(candidate);
		}
	}

	nodes
}

#[cfg(test)]
mod tests {
	use super::*;

	fn grid_with(grid_size: usize, cells: &[(u64, u64, u64, i64)]) -> Vec<i64> {
		let mut grid = vec![0i64; grid_size * grid_size * grid_size];
		for &(x, y, z, count) in cells {
			grid[morton_encode(x, y, z) as usize] = count;
		}
		grid
	}

	#[test]
	fn test_pyramid_levels_sum_to_total() {
		let grid = grid_with(8, &[(0, 0, 0, 100), (7, 7, 7, 23), (3, 4, 5, 7)]);
		let pyramid = create_sum_pyramid(grid, 8);

		assert_eq!(pyramid.len(), 4);
		assert_eq!(pyramid[0][0], 130);
		for level in &pyramid {
			assert_eq!(level.iter().sum::<i64>(), 130);
		}
	}

	#[test]
	fn test_single_candidate_when_total_fits_budget() {
		let grid = grid_with(8, &[(1, 2, 3, 50), (4, 4, 4, 50)]);
		let pyramid = create_sum_pyramid(grid, 8);
		let nodes = create_nodes(&pyramid, 1000);

		assert_eq!(nodes.len(), 1);
		assert_eq!(nodes[0].name, "");
		assert_eq!(nodes[0].num_points, 100);
	}

	#[test]
	fn test_overfull_root_splits_into_octants() {
		// two opposing corner cells, each above the budget on its own
		let grid = grid_with(8, &[(0, 0, 0, 10), (7, 7, 7, 10)]);
		let pyramid = create_sum_pyramid(grid, 8);
		let mut nodes = create_nodes(&pyramid, 15);

		nodes.sort_by(|a, b| a.name.cmp(&b.name));

		assert_eq!(nodes.len(), 2);
		assert_eq!(nodes[0].name, "0");
		assert_eq!(nodes[1].name, "7");
		assert!(nodes.iter().all(|n| n.num_points == 10));
	}

	#[test]
	fn test_index_start_is_morton_prefix_sum() {
		let grid = grid_with(8, &[(0, 0, 0, 30), (0, 0, 1, 30), (7, 7, 7, 30)]);
		let pyramid = create_sum_pyramid(grid, 8);
		let mut nodes = create_nodes(&pyramid, 40);

		nodes.sort_by(|a, b| a.name.cmp(&b.name));

		// cells of octant 0 come first in morton order, octant 7 last
		assert_eq!(nodes[0].name, "0");
		assert_eq!(nodes[0].index_start, 0);
		assert_eq!(nodes[0].num_points, 60);
		assert_eq!(nodes[1].name, "7");
		assert_eq!(nodes[1].index_start, 60);
	}

	#[test]
	fn test_max_level_cell_kept_even_over_budget() {
		let grid = grid_with(2, &[(1, 1, 1, 500)]);
		let pyramid = create_sum_pyramid(grid, 2);
		let nodes = create_nodes(&pyramid, 100);

		assert_eq!(nodes.len(), 1);
		assert_eq!(nodes[0].name, "7");
		assert_eq!(nodes[0].num_points, 500);
	}
}

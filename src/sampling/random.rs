//! Random sampler: a shared per-worker 128³ acceptance grid with an
//! iteration counter marks one winner per cell; acceptance is biased
//! toward cell interiors. Leaf buffers are shuffled in place so the
//! surviving order carries no ingest bias.

use crate::indexing::model::Node;
use crate::model::attributes::Attributes;
use crate::model::vector3::Vector3;
use crate::sampling::{decode_position, split_children, traverse_post, Sampler};
use rand::seq::SliceRandom;
use std::cell::RefCell;

const GRID_SIZE: i64 = 128;

thread_local! {
	// reused across nodes on the same worker; bumping the iteration
	// counter is the cheap way to clear it
	static ACCEPT_GRID: RefCell<(Vec<i64>, i64)> = RefCell::new((
		vec![-1; (GRID_SIZE * GRID_SIZE * GRID_SIZE) as usize],
		0,
	));
}

pub struct RandomSampler;

struct CellIndex {
	index: usize,
	distance: f64,
}

impl Sampler for RandomSampler {
	fn sample(
		&self,
		node: &mut Node,
		attributes: &Attributes,
		_base_spacing: f64,
		on_completed: &mut dyn FnMut(&mut Node),
		on_discarded: &mut dyn FnMut(&mut Node),
	) {
		let stride = attributes.bytes as usize;
		let scale = attributes.pos_scale.clone();
		let offset = attributes.pos_offset.clone();

		traverse_post(node, &mut |node| {
			node.sampled = true;

			if node.is_leaf() {
				shuffle_leaf(node, stride);
				return;
			}

			let min = node.min.clone();
			let size = &node.max - &node.min;

			let to_cell_index = |point: &Vector3| -> CellIndex {
				let nx = (point.x - min.x) / size.x;
				let ny = (point.y - min.y) / size.y;
				let nz = (point.z - min.z) / size.z;

				// position within the cell, -1..1 per axis
				let local = Vector3::new(
					2.0 * (GRID_SIZE as f64 * nx).fract() - 1.0,
					2.0 * (GRID_SIZE as f64 * ny).fract() - 1.0,
					2.0 * (GRID_SIZE as f64 * nz).fract() - 1.0,
				);
				let distance = local.length();

				let gx = ((GRID_SIZE as f64 * nx) as i64).clamp(0, GRID_SIZE - 1);
				let gy = ((GRID_SIZE as f64 * ny) as i64).clamp(0, GRID_SIZE - 1);
				let gz = ((GRID_SIZE as f64 * nz) as i64).clamp(0, GRID_SIZE - 1);

				CellIndex {
					index: (gx + gy * GRID_SIZE + gz * GRID_SIZE * GRID_SIZE) as usize,
					distance,
				}
			};

			ACCEPT_GRID.with(|grid| {
				let (grid, iteration) = &mut *grid.borrow_mut();
				*iteration += 1;

				let diagonal = 3f64.sqrt();

				let mut accepted_flags: Vec<Vec<u8>> = vec![Vec::new(); 8];
				let mut num_rejected_per_child = [0i64; 8];
				let mut num_accepted = 0i64;

				for child_index in 0..8 {
					let Some(child) = node.children[child_index].as_deref() else {
						continue;
					};

					let mut flags = vec![0u8; child.num_points as usize];
					let buffer = child.points.as_deref().unwrap_or(&[]);

					for i in 0..child.num_points as usize {
						let position = decode_position(buffer, i, stride, &scale, &offset);
						let cell = to_cell_index(&position);
						let grid_value = &mut grid[cell.index];

						let is_accepted = if child.num_points < 100 {
							true
						} else {
							cell.distance < 0.7 * diagonal && *grid_value < *iteration
						};

						if is_accepted {
							*grid_value = *iteration;
							num_accepted += 1;
						} else {
							num_rejected_per_child[child_index] += 1;
						}

						flags[i] = is_accepted as u8;
					}

					accepted_flags[child_index] = flags;
				}

				split_children(
					node,
					stride,
					num_accepted,
					&accepted_flags,
					&num_rejected_per_child,
					on_completed,
					on_discarded,
				);
			});
		});
	}
}

fn shuffle_leaf(node: &mut Node, stride: usize) {
	let Some(points) = node.points.take() else {
		return;
	};

	let mut indices: Vec<usize> = (0..node.num_points as usize).collect();
	indices.shuffle(&mut rand::thread_rng());

	let mut shuffled = vec![0u8; points.len()];
	for (source, &target) in indices.iter().enumerate() {
		shuffled[target * stride..(target + 1) * stride]
			.copy_from_slice(&points[source * stride..(source + 1) * stride]);
	}

	node.points = Some(shuffled);
}

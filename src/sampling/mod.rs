//! Bottom-up LOD samplers. Each sampler walks a subtree post-order and
//! selects representative points for every inner node from the union of
//! its children, under a per-level minimum spacing.

pub mod poisson;
pub mod poisson_average;
pub mod random;

use crate::indexing::model::Node;
use crate::model::attributes::Attributes;
use crate::model::options::SamplingMethod;
use crate::model::vector3::Vector3;

pub trait Sampler: Send + Sync {
	fn sample(
		&self,
		node: &mut Node,
		attributes: &Attributes,
		base_spacing: f64,
		on_completed: &mut dyn FnMut(&mut Node),
		on_discarded: &mut dyn FnMut(&mut Node),
	);
}

pub fn create_sampler(method: SamplingMethod) -> Box<dyn Sampler> {
	match method {
		SamplingMethod::Poisson => Box::new(poisson::PoissonSampler),
		SamplingMethod::PoissonAverage => Box::new(poisson_average::PoissonAverageSampler),
		SamplingMethod::Random => Box::new(random::RandomSampler),
	}
}

/// Post-order traversal that skips subtrees sampled in an earlier batch.
pub(crate) fn traverse_post(node: &mut Node, visit: &mut dyn FnMut(&mut Node)) {
	for child in node.children.iter_mut().flatten() {
		if !child.sampled {
			traverse_post(child, visit);
		}
	}

	visit(node);
}

/// A gathered child point in world space, remembering where it came from.
#[derive(Clone)]
pub(crate) struct SamplePoint {
	pub position: Vector3,
	pub point_index: usize,
	pub child_index: usize,
}

pub(crate) fn decode_position(
	points: &[u8],
	index: usize,
	stride: usize,
	scale: &Vector3,
	offset: &Vector3,
) -> Vector3 {
	let base = index * stride;
	let x = i32::from_le_bytes(points[base..base + 4].try_into().unwrap());
	let y = i32::from_le_bytes(points[base + 4..base + 8].try_into().unwrap());
	let z = i32::from_le_bytes(points[base + 8..base + 12].try_into().unwrap());

	Vector3 {
		x: x as f64 * scale.x + offset.x,
		y: y as f64 * scale.y + offset.y,
		z: z as f64 * scale.z + offset.z,
	}
}

pub(crate) fn spacing_at(base_spacing: f64, level: usize) -> f64 {
	base_spacing / 2f64.powi(level as i32)
}

/// Splits every child's buffer into the parent's accepted points and the
/// child's remaining rejected points, then applies the completion policy:
/// fully absorbed leaves are discarded, fully absorbed inner nodes stay as
/// empty inner nodes so the hierarchy never claims points that are gone.
pub(crate) fn split_children(
	node: &mut Node,
	stride: usize,
	num_accepted: i64,
	accepted_flags: &[Vec<u8>],
	num_rejected_per_child: &[i64; 8],
	on_completed: &mut dyn FnMut(&mut Node),
	on_discarded: &mut dyn FnMut(&mut Node),
) {
	let mut accepted: Vec<u8> = Vec::with_capacity(num_accepted as usize * stride);

	for child_index in 0..8 {
		let mut discard = false;

		if let Some(child) = node.children[child_index].as_deref_mut() {
			let num_rejected = num_rejected_per_child[child_index];
			let flags = &accepted_flags[child_index];
			let points = child.points.take().unwrap_or_default();

			let mut rejected: Vec<u8> = Vec::with_capacity(num_rejected as usize * stride);

			for i in 0..child.num_points as usize {
				let record = &points[i * stride..(i + 1) * stride];

				if flags[i] != 0 {
					accepted.extend_from_slice(record);
				} else {
					rejected.extend_from_slice(record);
				}
			}

			if num_rejected == 0 && child.is_leaf() {
				on_discarded(child);
				discard = true;
			} else if num_rejected > 0 {
				child.points = Some(rejected);
				child.num_points = num_rejected;
				on_completed(child);
			} else {
				child.points = None;
				child.num_points = 0;
				on_completed(child);
			}
		}

		if discard {
			node.children[child_index] = None;
		}
	}

	node.points = Some(accepted);
	node.num_points = num_accepted;
}

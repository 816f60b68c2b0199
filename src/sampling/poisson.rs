//! Poisson-disk sampler: candidates are visited from the node center
//! outwards, and a candidate is accepted iff no previously accepted point
//! lies within the level's spacing. The outside-in order makes the
//! distance checks prunable.

use crate::indexing::model::Node;
use crate::model::attributes::Attributes;
use crate::model::vector3::Vector3;
use crate::sampling::{
	decode_position, spacing_at, split_children, traverse_post, SamplePoint, Sampler,
};

/// Upper bound of distance checks per candidate. A pathological
/// configuration can therefore accept a point that violates spacing;
/// viewers tolerate that.
const MAX_DISTANCE_CHECKS: usize = 10_000;

pub struct PoissonSampler;

impl Sampler for PoissonSampler {
	fn sample(
		&self,
		node: &mut Node,
		attributes: &Attributes,
		base_spacing: f64,
		on_completed: &mut dyn FnMut(&mut Node),
		on_discarded: &mut dyn FnMut(&mut Node),
	) {
		let stride = attributes.bytes as usize;
		let scale = attributes.pos_scale.clone();
		let offset = attributes.pos_offset.clone();

		traverse_post(node, &mut |node| {
			node.sampled = true;

			if node.is_leaf() {
				return;
			}

			let spacing = spacing_at(base_spacing, node.level());
			let squared_spacing = spacing * spacing;
			let center = node.min.clone() + (&node.max - &node.min) * 0.5;

			// gather child points into world space, tagged with their
			// origin so accept/reject can be routed back
			let num_points_in_children: i64 = node
				.children
				.iter()
				.flatten()
				.map(|child| child.num_points)
				.sum();

			let mut points: Vec<SamplePoint> =
				Vec::with_capacity(num_points_in_children as usize);
			let mut accepted_flags: Vec<Vec<u8>> = vec![Vec::new(); 8];

			for child_index in 0..8 {
				let Some(child) = node.children[child_index].as_deref() else {
					continue;
				};

				accepted_flags[child_index] = vec![0; child.num_points as usize];
				let buffer = child.points.as_deref().unwrap_or(&[]);

				for i in 0..child.num_points as usize {
					let position = decode_position(buffer, i, stride, &scale, &offset);

					points.push(SamplePoint {
						position,
						point_index: i,
						child_index,
					});
				}
			}

			// stable sort by distance to the node center; ties keep the
			// deterministic gather order
			points.sort_by(|a, b| {
				let add = a.position.squared_distance_to(&center);
				let bdd = b.position.squared_distance_to(&center);

				add.partial_cmp(&bdd).unwrap()
			});

			let mut accepted: Vec<SamplePoint> = Vec::new();
			let mut num_accepted = 0i64;
			let mut num_rejected_per_child = [0i64; 8];

			for point in &points {
				let is_accepted = check_accept(point, &accepted, &center, spacing, squared_spacing);

				if is_accepted {
					accepted.push(point.clone());
					num_accepted += 1;
				} else {
					num_rejected_per_child[point.child_index] += 1;
				}

				accepted_flags[point.child_index][point.point_index] =
					if is_accepted { 1 } else { 0 };
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
	}
}

fn check_accept(
	candidate: &SamplePoint,
	accepted: &[SamplePoint],
	center: &Vector3,
	spacing: f64,
	squared_spacing: f64,
) -> bool {
	let cd = (&candidate.position - center).length();
	let limit = cd - spacing;
	let limit_squared = limit * limit;

	// walk earlier acceptances newest-first; once an accepted point sits
	// closer to the center than (candidate distance - spacing), all the
	// older ones do too and the candidate cannot conflict anymore
	for (j, point) in accepted.iter().rev().enumerate() {
		let pdd = point.position.squared_distance_to(center);

		if pdd < limit_squared {
			return true;
		}

		if point.position.squared_distance_to(&candidate.position) < squared_spacing {
			return false;
		}

		if j > MAX_DISTANCE_CHECKS {
			return true;
		}
	}

	true
}

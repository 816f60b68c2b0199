//! Poisson-disk sampler variant that checks spacing against a uniform 16³
//! acceptance grid instead of the outside-in scan, and averages the rgb of
//! all points within spacing into each accepted representative. Faster on
//! dense nodes.

use crate::indexing::model::Node;
use crate::model::attributes::Attributes;
use crate::model::vector3::Vector3;
use crate::sampling::{
	decode_position, spacing_at, split_children, traverse_post, Sampler,
};

const ACCEPT_GRID_SIZE: i64 = 16;

pub struct PoissonAverageSampler;

struct AvgPoint {
	position: Vector3,
	point_index: usize,
	child_index: usize,

	// cumulative color of every point within spacing, accepted only
	r: i64,
	g: i64,
	b: i64,
	w: i64,
}

struct CellRange {
	cell: usize,
	min: (i64, i64, i64),
	max: (i64, i64, i64),
}

fn cell_range(point: &AvgPoint, min: &Vector3, size: &Vector3, spacing: f64) -> CellRange {
	let g = ACCEPT_GRID_SIZE as f64;
	let p = &point.position;

	let clamp = |v: f64| (v as i64).clamp(0, ACCEPT_GRID_SIZE - 1);

	let ix = clamp(g * (p.x - min.x) / size.x);
	let iy = clamp(g * (p.y - min.y) / size.y);
	let iz = clamp(g * (p.z - min.z) / size.z);

	CellRange {
		cell: (ix + iy * ACCEPT_GRID_SIZE + iz * ACCEPT_GRID_SIZE * ACCEPT_GRID_SIZE) as usize,
		min: (
			clamp(g * (p.x - spacing - min.x) / size.x),
			clamp(g * (p.y - spacing - min.y) / size.y),
			clamp(g * (p.z - spacing - min.z) / size.z),
		),
		max: (
			clamp(g * (p.x + spacing - min.x) / size.x),
			clamp(g * (p.y + spacing - min.y) / size.y),
			clamp(g * (p.z + spacing - min.z) / size.z),
		),
	}
}

fn for_each_neighbor(
	range: &CellRange,
	grid: &[Vec<usize>],
	mut visit: impl FnMut(usize) -> bool,
) -> bool {
	for x in range.min.0..=range.max.0 {
		for y in range.min.1..=range.max.1 {
			for z in range.min.2..=range.max.2 {
				let index =
					(x + y * ACCEPT_GRID_SIZE + z * ACCEPT_GRID_SIZE * ACCEPT_GRID_SIZE) as usize;

				for &accepted_index in &grid[index] {
					if !visit(accepted_index) {
						return false;
					}
				}
			}
		}
	}

	true
}

impl Sampler for PoissonAverageSampler {
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
		let rgb_offset = attributes.get_offset("rgb").map(|o| o as usize);

		traverse_post(node, &mut |node| {
			node.sampled = true;

			if node.is_leaf() {
				return;
			}

			let spacing = spacing_at(base_spacing, node.level());
			let squared_spacing = spacing * spacing;
			let min = node.min.clone();
			let size = &node.max - &node.min;
			let center = node.min.clone() + (&node.max - &node.min) * 0.5;

			let mut points: Vec<AvgPoint> = Vec::new();
			let mut original_rgb: Vec<(u16, u16, u16)> = Vec::new();
			let mut accepted_flags: Vec<Vec<u8>> = vec![Vec::new(); 8];

			for child_index in 0..8 {
				let Some(child) = node.children[child_index].as_deref() else {
					continue;
				};

				accepted_flags[child_index] = vec![0; child.num_points as usize];
				let buffer = child.points.as_deref().unwrap_or(&[]);

				for i in 0..child.num_points as usize {
					let position = decode_position(buffer, i, stride, &scale, &offset);

					let rgb = rgb_offset
						.map(|rgb_offset| {
							let base = i * stride + rgb_offset;
							(
								u16::from_le_bytes(buffer[base..base + 2].try_into().unwrap()),
								u16::from_le_bytes(buffer[base + 2..base + 4].try_into().unwrap()),
								u16::from_le_bytes(buffer[base + 4..base + 6].try_into().unwrap()),
							)
						})
						.unwrap_or((0, 0, 0));

					original_rgb.push(rgb);
					points.push(AvgPoint {
						position,
						point_index: i,
						child_index,
						r: 0,
						g: 0,
						b: 0,
						w: 0,
					});
				}
			}

			// visit candidates from the center outwards; the order vector
			// keeps the gathered points addressable by their main index
			let mut order: Vec<usize> = (0..points.len()).collect();
			order.sort_by(|&a, &b| {
				let add = points[a].position.squared_distance_to(&center);
				let bdd = points[b].position.squared_distance_to(&center);

				add.partial_cmp(&bdd).unwrap()
			});

			let cells = (ACCEPT_GRID_SIZE * ACCEPT_GRID_SIZE * ACCEPT_GRID_SIZE) as usize;
			let mut grid_accepted: Vec<Vec<usize>> = vec![Vec::new(); cells];

			let mut num_accepted = 0i64;
			let mut num_rejected_per_child = [0i64; 8];

			for &candidate_index in &order {
				let candidate = &points[candidate_index];
				let range = cell_range(candidate, &min, &size, spacing);

				let is_accepted = for_each_neighbor(&range, &grid_accepted, |accepted_index| {
					let accepted = &points[accepted_index];
					let dd = accepted.position.squared_distance_to(&candidate.position);

					dd >= squared_spacing
				});

				if is_accepted {
					grid_accepted[range.cell].push(candidate_index);
					num_accepted += 1;
				} else {
					num_rejected_per_child[candidate.child_index] += 1;
				}

				accepted_flags[candidate.child_index][candidate.point_index] =
					if is_accepted { 1 } else { 0 };
			}

			if rgb_offset.is_some() {
				// every point contributes its color to all accepted
				// representatives within spacing
				for candidate_index in 0..points.len() {
					let candidate = &points[candidate_index];
					let candidate_rgb = original_rgb[candidate_index];
					let range = cell_range(candidate, &min, &size, spacing);

					let mut contributions: Vec<usize> = Vec::new();
					for_each_neighbor(&range, &grid_accepted, |accepted_index| {
						let accepted = &points[accepted_index];
						let dd = accepted.position.squared_distance_to(&candidate.position);

						if dd < squared_spacing {
							contributions.push(accepted_index);
						}
						true
					});

					for accepted_index in contributions {
						let accepted = &mut points[accepted_index];
						accepted.r += candidate_rgb.0 as i64;
						accepted.g += candidate_rgb.1 as i64;
						accepted.b += candidate_rgb.2 as i64;
						accepted.w += 1;
					}
				}

				// overwrite accepted representatives with their average
				// before the records move into the parent
				let rgb_offset = rgb_offset.unwrap();
				for point in &points {
					if point.w == 0 {
						continue;
					}

					let child = node.children[point.child_index].as_deref_mut().unwrap();
					let Some(buffer) = child.points.as_mut() else {
						continue;
					};

					let base = point.point_index * stride + rgb_offset;
					let averaged = [
						(point.r / point.w) as u16,
						(point.g / point.w) as u16,
						(point.b / point.w) as u16,
					];
					for (i, channel) in averaged.iter().enumerate() {
						buffer[base + i * 2..base + i * 2 + 2]
							.copy_from_slice(&channel.to_le_bytes());
					}
				}
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

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::attributes::{Attribute, AttributeType, Attributes};
	use crate::model::bounds::child_bounding_box_of;
	use byteorder::{LittleEndian, WriteBytesExt};

	fn rgb_attributes() -> Attributes {
		let mut attributes = Attributes::from_attributes(vec![
			Attribute::new("position", 12, 3, 4, AttributeType::INT32),
			Attribute::new("rgb", 6, 3, 2, AttributeType::UINT16),
		]);
		attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
		attributes.pos_offset = Vector3::empty();
		attributes
	}

	fn leaf_with_colored_points(
		name: &str,
		min: Vector3,
		max: Vector3,
		points: &[((f64, f64, f64), (u16, u16, u16))],
	) -> Node {
		let mut node = Node::new(name.to_string(), min, max);

		let mut buffer = Vec::new();
		for &((x, y, z), (r, g, b)) in points {
			buffer
				.write_i32::<LittleEndian>((x / 0.001).round() as i32)
				.unwrap();
			buffer
				.write_i32::<LittleEndian>((y / 0.001).round() as i32)
				.unwrap();
			buffer
				.write_i32::<LittleEndian>((z / 0.001).round() as i32)
				.unwrap();
			buffer.write_u16::<LittleEndian>(r).unwrap();
			buffer.write_u16::<LittleEndian>(g).unwrap();
			buffer.write_u16::<LittleEndian>(b).unwrap();
		}

		node.points = Some(buffer);
		node.num_points = points.len() as i64;
		node
	}

	#[test]
	fn test_acceptance_respects_spacing() {
		let min = Vector3::new(0.0, 0.0, 0.0);
		let max = Vector3::new(1.0, 1.0, 1.0);
		let mut root = Node::new("r".to_string(), min.clone(), max.clone());

		let bbox = child_bounding_box_of(&min, &max, 0);
		let points: Vec<((f64, f64, f64), (u16, u16, u16))> = (0..100)
			.map(|i| {
				let t = i as f64 / 100.0;
				(
					(t * 0.49, (t * 3.0) % 1.0 * 0.49, (t * 11.0) % 1.0 * 0.49),
					(100, 100, 100),
				)
			})
			.collect();
		root.children[0] = Some(Box::new(leaf_with_colored_points(
			"r0", bbox.min, bbox.max, &points,
		)));

		let attributes = rgb_attributes();
		let base_spacing = 0.1;
		PoissonAverageSampler.sample(
			&mut root,
			&attributes,
			base_spacing,
			&mut |_| {},
			&mut |_| {},
		);

		let stride = attributes.bytes as usize;
		let buffer = root.points.as_deref().unwrap();
		let decoded: Vec<Vector3> = (0..root.num_points as usize)
			.map(|i| {
				decode_position(buffer, i, stride, &attributes.pos_scale, &attributes.pos_offset)
			})
			.collect();

		for (i, a) in decoded.iter().enumerate() {
			for b in decoded.iter().skip(i + 1) {
				assert!(a.squared_distance_to(b).sqrt() >= base_spacing - 1e-9);
			}
		}
	}

	#[test]
	fn test_accepted_point_carries_averaged_color() {
		let min = Vector3::new(0.0, 0.0, 0.0);
		let max = Vector3::new(1.0, 1.0, 1.0);
		let mut root = Node::new("r".to_string(), min.clone(), max.clone());

		// a tight cluster well inside one spacing radius: one point
		// survives and averages the cluster's colors
		let bbox = child_bounding_box_of(&min, &max, 0);
		let points = vec![
			((0.100, 0.1, 0.1), (100, 0, 30)),
			((0.101, 0.1, 0.1), (200, 0, 60)),
			((0.102, 0.1, 0.1), (300, 0, 90)),
		];
		root.children[0] = Some(Box::new(leaf_with_colored_points(
			"r0", bbox.min, bbox.max, &points,
		)));

		let attributes = rgb_attributes();
		PoissonAverageSampler.sample(&mut root, &attributes, 0.2, &mut |_| {}, &mut |_| {});

		assert_eq!(root.num_points, 1);

		let buffer = root.points.as_deref().unwrap();
		let r = u16::from_le_bytes(buffer[12..14].try_into().unwrap());
		let b = u16::from_le_bytes(buffer[16..18].try_into().unwrap());

		assert_eq!(r, 200);
		assert_eq!(b, 60);
	}
}

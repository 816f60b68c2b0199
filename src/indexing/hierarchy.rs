//! Hierarchy index emission: the octree is cut into batches of depth 4,
//! serialized breadth-first as 22-byte records, with proxy records linking
//! the batches together inside `hierarchy.bin`.

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;

use super::model::{Hierarchy, Node};

pub const HIERARCHY_STEP_SIZE: usize = 4;

// type + childMask + numPoints + offset + size
const BYTES_PER_NODE: usize = 1 + 1 + 4 + 8 + 8;

#[repr(u8)]
pub enum NodeType {
	Normal = 0,
	Leaf = 1,
	Proxy = 2,
}

fn sort_breadth_first(nodes: &mut Vec<&Node>) {
	nodes.sort_by(|a, b| {
		if a.name.len() != b.name.len() {
			a.name.len().cmp(&b.name.len())
		} else {
			a.name.cmp(&b.name)
		}
	});
}

fn child_mask_of(node: &Node) -> u8 {
	let mut mask: u8 = 0;

	for i in 0..8 {
		if node.children[i].is_some() {
			mask |= 1 << i;
		}
	}

	mask
}

struct HierarchyChunk<'a> {
	name: String,
	nodes: Vec<&'a Node>,
}

fn gather_chunk(start: &Node, levels: usize) -> HierarchyChunk {
	// start node plus all descendants up to and including `levels` deeper
	let start_level = start.name.len() - 1;

	let mut chunk = HierarchyChunk {
		name: start.name.to_string(),
		nodes: Vec::new(),
	};

	let mut stack = vec![start];
	while let Some(node) = stack.pop() {
		chunk.nodes.push(node);

		let child_level = node.name.len();
		if child_level <= start_level + levels {
			for child in node.children.iter().flatten() {
				stack.push(child);
			}
		}
	}

	chunk
}

fn create_hierarchy_chunks(root: &Node, step_size: usize) -> Vec<HierarchyChunk> {
	let mut hierarchy_chunks = Vec::new();
	let mut stack = vec![root];

	while let Some(chunk_root) = stack.pop() {
		let chunk = gather_chunk(chunk_root, step_size);

		for node in &chunk.nodes {
			let is_proxy = node.level() == chunk_root.level() + step_size;
			if is_proxy {
				stack.push(node);
			}
		}

		hierarchy_chunks.push(chunk);
	}

	hierarchy_chunks
}

pub fn create_hierarchy(root: &Node) -> Hierarchy {
	let chunk_size = |chunk: &HierarchyChunk| chunk.nodes.len() * BYTES_PER_NODE;

	let mut chunks = create_hierarchy_chunks(root, HIERARCHY_STEP_SIZE);

	let mut chunk_pointers: HashMap<String, usize> = HashMap::new();
	let mut chunk_byte_offsets = vec![0usize; chunks.len()];
	let mut hierarchy_buffer_size = 0;

	for i in 0..chunks.len() {
		{
			let chunk = &mut chunks[i];
			chunk_pointers.insert(chunk.name.clone(), i);
			sort_breadth_first(&mut chunk.nodes);
		}
		if i >= 1 {
			chunk_byte_offsets[i] = chunk_byte_offsets[i - 1] + chunk_size(&chunks[i - 1]);
		}
		hierarchy_buffer_size += chunk_size(&chunks[i]);
	}

	let mut buffer: Vec<u8> = Vec::with_capacity(hierarchy_buffer_size);
	let mut depth = 0;

	for i in 0..chunks.len() {
		let chunk = &chunks[i];
		let chunk_level = chunk.name.len() - 1;

		for node in &chunk.nodes {
			let is_proxy = node.level() == chunk_level + HIERARCHY_STEP_SIZE;

			let child_mask = child_mask_of(node);
			let num_points = node.num_points as u32;

			let (node_type, target_offset, target_size) = if is_proxy {
				let target_chunk_index = chunk_pointers[&node.name];
				let target_chunk = &chunks[target_chunk_index];

				(
					NodeType::Proxy as u8,
					chunk_byte_offsets[target_chunk_index] as u64,
					chunk_size(target_chunk) as u64,
				)
			} else {
				let node_type = if node.is_leaf() {
					NodeType::Leaf as u8
				} else {
					NodeType::Normal as u8
				};

				(node_type, node.byte_offset as u64, node.byte_size as u64)
			};

			buffer.push(node_type);
			buffer.push(child_mask);
			buffer.write_u32::<LittleEndian>(num_points).unwrap();
			buffer.write_u64::<LittleEndian>(target_offset).unwrap();
			buffer.write_u64::<LittleEndian>(target_size).unwrap();

			depth = depth.max(node.level());
		}
	}

	Hierarchy {
		step_size: HIERARCHY_STEP_SIZE as u8,
		buffer,
		first_chunk_size: (chunks[0].nodes.len() * BYTES_PER_NODE) as u64,
		depth: depth as u8,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::vector3::Vector3;
	use byteorder::{LittleEndian, ReadBytesExt};
	use std::io::Cursor;

	#[derive(Debug, Clone)]
	struct DecodedNode {
		name: String,
		node_type: u8,
		num_points: u32,
		byte_offset: u64,
		byte_size: u64,
	}

	/// Reads one hierarchy batch and recurses through proxy records the
	/// way a viewer would.
	fn decode_chunk(
		buffer: &[u8],
		offset: usize,
		size: usize,
		root_name: &str,
		out: &mut Vec<DecodedNode>,
	) {
		let mut names = vec![root_name.to_string()];
		let mut cursor = Cursor::new(&buffer[offset..offset + size]);

		let mut index = 0;
		while (cursor.position() as usize) < size {
			let node_type = cursor.read_u8().unwrap();
			let child_mask = cursor.read_u8().unwrap();
			let num_points = cursor.read_u32::<LittleEndian>().unwrap();
			let byte_offset = cursor.read_u64::<LittleEndian>().unwrap();
			let byte_size = cursor.read_u64::<LittleEndian>().unwrap();

			let name = names[index].clone();
			index += 1;

			// breadth-first order: children line up behind the parents
			for i in 0..8 {
				if child_mask & (1 << i) != 0 {
					names.push(format!("{}{}", name, i));
				}
			}

			if node_type == NodeType::Proxy as u8 {
				decode_chunk(buffer, byte_offset as usize, byte_size as usize, &name, out);
			} else {
				out.push(DecodedNode {
					name,
					node_type,
					num_points,
					byte_offset,
					byte_size,
				});
			}
		}
	}

	fn build_deep_tree(depth: usize) -> Node {
		let mut root = Node::new(
			"r".to_string(),
			Vector3::new(0.0, 0.0, 0.0),
			Vector3::new(1.0, 1.0, 1.0),
		);

		// one chain of first children plus a sibling at each level
		let mut name = String::from("r");
		for level in 0..depth {
			name.push('0');
			let node = root.descendant_mut(&name);
			node.num_points = level as i64 + 1;
			node.byte_offset = 100 * level as i64;
			node.byte_size = 10;

			let sibling = format!("{}7", &name[..name.len() - 1]);
			let node = root.descendant_mut(&sibling);
			node.num_points = 1;
			node.byte_size = 4;
		}

		root.num_points = 99;
		root.byte_size = 1234;
		root
	}

	#[test]
	fn test_round_trip_through_proxies() {
		let root = build_deep_tree(6);

		let mut expected = Vec::new();
		root.traverse(&mut |node| {
			expected.push((
				node.name.clone(),
				node.num_points as u32,
				node.byte_offset as u64,
				node.byte_size as u64,
			))
		});

		let hierarchy = create_hierarchy(&root);
		assert_eq!(hierarchy.step_size, 4);
		assert_eq!(hierarchy.buffer.len() % 22, 0);

		let mut decoded = Vec::new();
		decode_chunk(
			&hierarchy.buffer,
			0,
			hierarchy.first_chunk_size as usize,
			"r",
			&mut decoded,
		);

		let mut decoded_set: Vec<_> = decoded
			.iter()
			.map(|n| (n.name.clone(), n.num_points, n.byte_offset, n.byte_size))
			.collect();
		decoded_set.sort();
		let mut expected = expected;
		expected.sort();

		assert_eq!(decoded_set, expected);
	}

	#[test]
	fn test_leaf_and_inner_types() {
		let root = build_deep_tree(2);
		let hierarchy = create_hierarchy(&root);

		let mut decoded = Vec::new();
		decode_chunk(
			&hierarchy.buffer,
			0,
			hierarchy.first_chunk_size as usize,
			"r",
			&mut decoded,
		);

		for node in &decoded {
			let has_children = decoded
				.iter()
				.any(|other| other.name.len() == node.name.len() + 1 && other.name.starts_with(&node.name));
			let expected = if has_children {
				NodeType::Normal as u8
			} else {
				NodeType::Leaf as u8
			};
			assert_eq!(node.node_type, expected, "node {}", node.name);
		}
	}

	#[test]
	fn test_depth_matches_deepest_node() {
		let root = build_deep_tree(6);
		let hierarchy = create_hierarchy(&root);

		assert_eq!(hierarchy.depth, 6);
	}

	#[test]
	fn test_first_chunk_covers_levels_zero_to_four() {
		let root = build_deep_tree(6);
		let hierarchy = create_hierarchy(&root);

		// levels 0..=4 of the chain tree: the root plus two nodes per
		// level; the level-4 entries are proxies into later batches
		let nodes_in_first = hierarchy.first_chunk_size as usize / 22;
		assert_eq!(nodes_in_first, 1 + 2 * 4);
	}
}

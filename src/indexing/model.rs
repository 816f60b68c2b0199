use crate::model::attributes::Attributes;
use crate::model::bounds::child_bounding_box_of;
use crate::model::vector3::Vector3;
use std::path::PathBuf;

/// Octree node. Children are owned exclusively by their parent; the tree
/// only points downward.
pub struct Node {
	pub name: String,
	pub min: Vector3,
	pub max: Vector3,

	pub children: Vec<Option<Box<Node>>>,

	pub points: Option<Vec<u8>>,
	pub num_points: i64,

	pub byte_offset: i64,
	pub byte_size: i64,

	pub sampled: bool,
}

impl Node {
	pub fn new(name: String, min: Vector3, max: Vector3) -> Node {
		Node {
			name,
			min,
			max,
			children: vec![None, None, None, None, None, None, None, None],
			points: None,
			num_points: 0,
			byte_offset: 0,
			byte_size: 0,
			sampled: false,
		}
	}

	pub fn level(&self) -> usize {
		self.name.len() - 1
	}

	pub fn is_leaf(&self) -> bool {
		self.children.iter().all(|child| child.is_none())
	}

	/// Returns the descendant reached by walking `digits` from this node,
	/// materializing intermediate nodes along the way.
	pub fn expand_to(&mut self, digits: &str) -> &mut Node {
		let mut current = self;

		for digit in digits.chars() {
			let index = digit as usize - '0' as usize;

			if current.children[index].is_none() {
				let bbox = child_bounding_box_of(&current.min, &current.max, index);
				let child_name = format!("{}{}", current.name, index);
				current.children[index] =
					Some(Box::new(Node::new(child_name, bbox.min, bbox.max)));
			}

			current = current.children[index].as_mut().unwrap();
		}

		current
	}

	/// Walks to a descendant by its absolute name. The name must extend
	/// this node's own name.
	pub fn descendant_mut(&mut self, name: &str) -> &mut Node {
		let digits = &name[self.name.len()..];
		self.expand_to(digits)
	}

	/// Hangs a fully built subtree into the tree at the position encoded
	/// in its name.
	pub fn add_descendant(&mut self, descendant: Box<Node>) {
		let digits: String = descendant.name[self.name.len()..].to_string();
		let parent_digits = &digits[..digits.len() - 1];
		let index = digits.chars().last().unwrap() as usize - '0' as usize;

		let parent = self.expand_to(parent_digits);
		parent.children[index] = Some(descendant);
	}

	pub fn traverse(&self, callback: &mut impl FnMut(&Node)) {
		callback(self);

		for child in self.children.iter().flatten() {
			child.traverse(callback);
		}
	}
}

#[derive(Clone)]
pub struct Chunk {
	pub file: PathBuf,
	pub id: String,
	pub min: Vector3,
	pub max: Vector3,
}

pub struct Chunks {
	pub list: Vec<Chunk>,
	pub min: Vector3,
	pub max: Vector3,
	pub attributes: Attributes,
}

/// A chunk-root point buffer parked in `tmpChunkRoots.bin`.
#[derive(Clone)]
pub struct FlushedChunkRoot {
	pub name: String,
	pub offset: u64,
	pub size: u64,
	pub num_points: i64,
}

pub struct Hierarchy {
	pub step_size: u8,
	pub buffer: Vec<u8>,
	pub first_chunk_size: u64,
	pub depth: u8,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn unit_root() -> Node {
		Node::new(
			"r".to_string(),
			Vector3::new(0.0, 0.0, 0.0),
			Vector3::new(1.0, 1.0, 1.0),
		)
	}

	#[test]
	fn test_expand_to_creates_intermediate_nodes() {
		let mut root = unit_root();

		let node = root.expand_to("063");
		assert_eq!(node.name, "r063");

		assert!(root.children[0].is_some());
		let child = root.children[0].as_ref().unwrap();
		assert!(child.children[6].is_some());
	}

	#[test]
	fn test_expand_to_subdivides_bounds() {
		let mut root = unit_root();

		// child 4 covers the +x half
		let node = root.expand_to("4");
		assert_eq!(node.min, Vector3::new(0.5, 0.0, 0.0));
		assert_eq!(node.max, Vector3::new(1.0, 0.5, 0.5));
	}

	#[test]
	fn test_add_descendant_attaches_subtree() {
		let mut root = unit_root();

		let mut subtree = Box::new(Node::new(
			"r25".to_string(),
			Vector3::empty(),
			Vector3::empty(),
		));
		subtree.num_points = 42;

		root.add_descendant(subtree);

		let reached = root.descendant_mut("r25");
		assert_eq!(reached.num_points, 42);
	}

	#[test]
	fn test_traverse_visits_whole_tree() {
		let mut root = unit_root();
		root.expand_to("0");
		root.expand_to("70");

		let mut names = Vec::new();
		root.traverse(&mut |node| names.push(node.name.clone()));
		names.sort();

		assert_eq!(names, vec!["r", "r0", "r7", "r70"]);
	}
}

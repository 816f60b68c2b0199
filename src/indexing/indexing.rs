//! Indexing pass: every chunk is expanded into a local octree, sampled
//! bottom-up and written to `octree.bin`; the chunk roots are then merged
//! and sampled up to the global root.

use crate::indexing::hierarchy::create_hierarchy;
use crate::indexing::model::{Chunk, Chunks, FlushedChunkRoot, Node};
use crate::indexing::writer::Writer;
use crate::indexing::{read_chunking_metadata, MAX_POINTS_PER_NODE};
use crate::logger;
use crate::model::attributes::Attributes;
use crate::model::bounds::child_bounding_box_of;
use crate::model::metadata::{Hierarchy as HierarchyJson, Metadata};
use crate::model::options::Options;
use crate::model::vector3::Vector3;
use crate::model::State;
use crate::morton::morton_encode;
use crate::pool::TaskPool;
use crate::pyramid::{create_nodes, create_sum_pyramid};
use crate::sampling::Sampler;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Producers stall while the writer backlog exceeds this.
const MAX_BACKLOG_MB: i64 = 1000;

/// Rough ceiling for point buffers held in memory at once.
const MAX_MEMORY_MB: u64 = 8 * 1024;

/// Chunk-root batches below this point count are merged into their parent
/// before the final sampling rounds.
const CHUNK_ROOT_BATCH_THRESHOLD: i64 = 5_000_000;

struct ChunkRootsFile {
	file: File,
	offset: u64,
	flushed: Vec<FlushedChunkRoot>,
}

pub struct Indexer {
	pub target_dir: PathBuf,
	pub attributes: Attributes,
	pub spacing: f64,
	pub writer: Writer,
	pub state: Arc<State>,

	chunk_roots: Mutex<ChunkRootsFile>,
	octree_depth: Mutex<i64>,
}

impl Indexer {
	fn new(
		target_dir: &Path,
		attributes: Attributes,
		spacing: f64,
		state: Arc<State>,
	) -> Result<Indexer> {
		let chunk_roots_path = target_dir.join("tmpChunkRoots.bin");
		let file = File::create(&chunk_roots_path)
			.with_context(|| format!("create {}", chunk_roots_path.display()))?;

		let writer = Writer::new(&target_dir.join("octree.bin"), Arc::clone(&state));

		Ok(Indexer {
			target_dir: target_dir.to_path_buf(),
			attributes,
			spacing,
			writer,
			state,
			chunk_roots: Mutex::new(ChunkRootsFile {
				file,
				offset: 0,
				flushed: Vec::new(),
			}),
			octree_depth: Mutex::new(0),
		})
	}

	pub fn wait_until_writer_backlog_below(&self, max_megabytes: i64) {
		while self.writer.backlog_size_mb() > max_megabytes {
			std::thread::sleep(Duration::from_millis(10));
		}
	}

	pub fn wait_until_memory_below(&self, max_megabytes: u64) {
		loop {
			let used = self.state.bytes_in_memory.load(Ordering::Relaxed) / (1024 * 1024);
			if used <= max_megabytes {
				break;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
	}

	/// Parks a sampled chunk root's points in `tmpChunkRoots.bin`; they
	/// are reloaded for the upper sampling rounds.
	fn flush_chunk_root(&self, chunk_root: &mut Node) {
		let Some(points) = chunk_root.points.take() else {
			return;
		};

		let mut chunk_roots = self.chunk_roots.lock().unwrap();

		if let Err(error) = chunk_roots.file.write_all(&points) {
			logger::fatal(&format!("failed to write tmpChunkRoots.bin: {}", error));
		}

		let offset = chunk_roots.offset;
		chunk_roots.offset += points.len() as u64;
		chunk_roots.flushed.push(FlushedChunkRoot {
			name: chunk_root.name.clone(),
			offset,
			size: points.len() as u64,
			num_points: chunk_root.num_points,
		});
	}

	fn track_depth(&self, level: i64) {
		let mut depth = self.octree_depth.lock().unwrap();
		*depth = (*depth).max(level);
	}
}

/// Reads the chunker's output back: the descriptor and one `Chunk` per
/// binary file, with bounds derived from the id digits.
pub fn get_chunks(target_dir: &Path) -> Result<Chunks> {
	let chunk_directory = target_dir.join("chunks");
	let metadata = read_chunking_metadata(&chunk_directory.join("metadata.json"))?;

	let min = Vector3::new(metadata.min[0], metadata.min[1], metadata.min[2]);
	let max = Vector3::new(metadata.max[0], metadata.max[1], metadata.max[2]);

	let mut attributes = Attributes::from_attributes(
		metadata.attributes.iter().map(|a| a.to_attribute()).collect(),
	);
	attributes.pos_scale = Vector3::new(metadata.scale[0], metadata.scale[1], metadata.scale[2]);
	attributes.pos_offset =
		Vector3::new(metadata.offset[0], metadata.offset[1], metadata.offset[2]);

	let mut list = Vec::new();
	for entry in std::fs::read_dir(&chunk_directory)
		.with_context(|| format!("read chunk directory {}", chunk_directory.display()))?
	{
		let path = entry?.path();
		let filename = path
			.file_name()
			.and_then(|n| n.to_str())
			.unwrap_or_default()
			.to_string();

		if !filename.ends_with(".bin") {
			continue;
		}

		let id = filename.replace("chunk_", "").replace(".bin", "");

		let mut bbox_min = min.clone();
		let mut bbox_max = max.clone();
		for digit in id.chars().skip(1) {
			let index = digit as usize - '0' as usize;
			let bbox = child_bounding_box_of(&bbox_min, &bbox_max, index);
			bbox_min = bbox.min;
			bbox_max = bbox.max;
		}

		list.push(Chunk {
			file: path,
			id,
			min: bbox_min,
			max: bbox_max,
		});
	}

	Ok(Chunks {
		list,
		min,
		max,
		attributes,
	})
}

const COUNTER_GRID_SIZE: i64 = 32;

fn node_grid_index(
	record: &[u8],
	attributes: &Attributes,
	min: &Vector3,
	size: &Vector3,
) -> usize {
	let x = i32::from_le_bytes(record[0..4].try_into().unwrap());
	let y = i32::from_le_bytes(record[4..8].try_into().unwrap());
	let z = i32::from_le_bytes(record[8..12].try_into().unwrap());

	let wx = x as f64 * attributes.pos_scale.x + attributes.pos_offset.x;
	let wy = y as f64 * attributes.pos_scale.y + attributes.pos_offset.y;
	let wz = z as f64 * attributes.pos_scale.z + attributes.pos_offset.z;

	let gx = (COUNTER_GRID_SIZE as f64 * (wx - min.x) / size.x) as i64;
	let gy = (COUNTER_GRID_SIZE as f64 * (wy - min.y) / size.y) as i64;
	let gz = (COUNTER_GRID_SIZE as f64 * (wz - min.z) / size.z) as i64;

	let gx = gx.clamp(0, COUNTER_GRID_SIZE - 1) as u64;
	let gy = gy.clamp(0, COUNTER_GRID_SIZE - 1) as u64;
	let gz = gz.clamp(0, COUNTER_GRID_SIZE - 1) as u64;

	morton_encode(gx, gy, gz) as usize
}

fn integer_position(record: &[u8]) -> (i32, i32, i32) {
	(
		i32::from_le_bytes(record[0..4].try_into().unwrap()),
		i32::from_le_bytes(record[4..8].try_into().unwrap()),
		i32::from_le_bytes(record[8..12].try_into().unwrap()),
	)
}

/// Expands a point buffer into an octree below `node`: count into a 32³
/// Morton grid, group the buffer by cell with a count-sort, materialize a
/// child node per planned cell and recurse into cells still over budget.
pub fn build_hierarchy(indexer: &Indexer, node: &mut Node, points: Vec<u8>, num_points: i64) {
	if num_points < MAX_POINTS_PER_NODE {
		node.num_points = num_points;
		node.points = Some(points);
		return;
	}

	let bpp = indexer.attributes.bytes as usize;
	let min = node.min.clone();
	let size = &node.max - &node.min;

	let cells = (COUNTER_GRID_SIZE * COUNTER_GRID_SIZE * COUNTER_GRID_SIZE) as usize;
	let mut counters = vec![0i64; cells];

	for i in 0..num_points as usize {
		let record = &points[i * bpp..(i + 1) * bpp];
		counters[node_grid_index(record, &indexer.attributes, &min, &size)] += 1;
	}

	// group points by cell through a count-sort into a scratch buffer
	let grouped = {
		let mut offsets = vec![0i64; cells];
		for i in 1..cells {
			offsets[i] = offsets[i - 1] + counters[i - 1];
		}

		let mut grouped = vec![0u8; num_points as usize * bpp];
		for i in 0..num_points as usize {
			let record = &points[i * bpp..(i + 1) * bpp];
			let cell = node_grid_index(record, &indexer.attributes, &min, &size);

			let target = offsets[cell] as usize;
			offsets[cell] += 1;

			grouped[target * bpp..(target + 1) * bpp].copy_from_slice(record);
		}

		grouped
	};

	let pyramid = create_sum_pyramid(counters, COUNTER_GRID_SIZE as usize);
	let candidates = create_nodes(&pyramid, MAX_POINTS_PER_NODE);

	let mut need_refinement: Vec<String> = Vec::new();
	let mut octree_depth = 0i64;

	for candidate in &candidates {
		let realization = node.expand_to(&candidate.name);
		realization.num_points = candidate.num_points;

		let start = candidate.index_start as usize * bpp;
		let end = start + candidate.num_points as usize * bpp;
		realization.points = Some(grouped[start..end].to_vec());

		if realization.num_points > MAX_POINTS_PER_NODE {
			need_refinement.push(realization.name.clone());
		}

		octree_depth = octree_depth.max(realization.level() as i64);
	}

	indexer.track_depth(octree_depth);

	for name in need_refinement {
		let subject = node.descendant_mut(&name);
		let mut buffer = subject.points.take().unwrap_or_default();
		let mut next_num_points = subject.num_points;

		if next_num_points == num_points {
			// the subsplit kept all of its parent's points, so the split
			// achieved nothing; decide between bad luck and duplicates
			let mut counts: HashMap<(i32, i32, i32), i64> = HashMap::new();
			for i in 0..next_num_points as usize {
				let key = integer_position(&buffer[i * bpp..(i + 1) * bpp]);
				*counts.entry(key).or_insert(0) += 1;
			}

			let num_unique = counts.len() as i64;
			let num_duplicates = next_num_points - num_unique;

			if num_duplicates < MAX_POINTS_PER_NODE / 2 {
				log::warn!(
					"Encountered unfavourable point distribution. Conversion continues anyway because not many duplicates were encountered. #points in box: {}, #unique points in box: {}",
					next_num_points,
					num_unique
				);
			} else {
				let mut handled: HashSet<(i32, i32, i32)> = HashSet::new();
				let mut distinct: Vec<usize> = Vec::with_capacity(num_unique as usize);

				for i in 0..next_num_points as usize {
					let key = integer_position(&buffer[i * bpp..(i + 1) * bpp]);
					if handled.insert(key) {
						distinct.push(i);
					}
				}

				log::warn!(
					"Too many duplicate points were encountered. #points: {}, #unique points: {}. Duplicates inside node {} will be dropped.",
					next_num_points,
					distinct.len(),
					name
				);

				let mut distinct_buffer = Vec::with_capacity(distinct.len() * bpp);
				for &index in &distinct {
					distinct_buffer.extend_from_slice(&buffer[index * bpp..(index + 1) * bpp]);
				}

				next_num_points = distinct.len() as i64;
				buffer = distinct_buffer;
			}
		}

		subject.num_points = 0;
		build_hierarchy(indexer, subject, buffer, next_num_points);
	}
}

/// Shadow tree over the flushed chunk roots, used to batch small subtrees
/// before the upper sampling rounds. It mirrors the primary tree by name
/// and never links back into it.
struct CRNode {
	name: String,
	num_points: i64,
	fcrs: Vec<FlushedChunkRoot>,
	children: Vec<Option<usize>>,
}

struct CRTask {
	name: String,
	fcrs: Vec<FlushedChunkRoot>,
}

fn process_chunk_roots(flushed: &[FlushedChunkRoot]) -> Vec<CRTask> {
	let mut nodes: Vec<CRNode> = vec![CRNode {
		name: "r".to_string(),
		num_points: 0,
		fcrs: Vec::new(),
		children: vec![None; 8],
	}];

	for fcr in flushed {
		let mut current = 0usize;

		for (i, digit) in fcr.name.chars().enumerate().skip(1) {
			let index = digit as usize - '0' as usize;

			if nodes[current].children[index].is_none() {
				nodes.push(CRNode {
					name: fcr.name[..=i].to_string(),
					num_points: 0,
					fcrs: Vec::new(),
					children: vec![None; 8],
				});
				let node_index = nodes.len() - 1;
				nodes[current].children[index] = Some(node_index);
			}

			current = nodes[current].children[index].unwrap();
		}

		nodes[current].fcrs.push(fcr.clone());
		nodes[current].num_points += fcr.num_points;
	}

	// post-order: merge subtrees whose cumulative points stay small, so
	// one sampling round covers them all
	fn merge(nodes: &mut Vec<CRNode>, index: usize) {
		let children: Vec<usize> = nodes[index].children.iter().flatten().copied().collect();
		if children.is_empty() {
			return;
		}

		for &child in &children {
			merge(nodes, child);
		}

		let num_points: i64 = children.iter().map(|&child| nodes[child].num_points).sum();
		nodes[index].num_points += num_points;

		if nodes[index].num_points < CHUNK_ROOT_BATCH_THRESHOLD {
			for &child in &children {
				let fcrs = std::mem::take(&mut nodes[child].fcrs);
				nodes[index].fcrs.extend(fcrs);
			}
			nodes[index].children = vec![None; 8];
		}
	}
	merge(&mut nodes, 0);

	nodes
		.into_iter()
		.filter(|node| !node.fcrs.is_empty())
		.map(|node| CRTask {
			name: node.name,
			fcrs: node.fcrs,
		})
		.collect()
}

fn read_chunk_root_buffer(path: &Path, fcr: &FlushedChunkRoot) -> Result<Vec<u8>> {
	let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
	file.seek(SeekFrom::Start(fcr.offset))?;

	let mut buffer = vec![0u8; fcr.size as usize];
	file.read_exact(&mut buffer)
		.with_context(|| format!("read chunk root {} from {}", fcr.name, path.display()))?;

	Ok(buffer)
}

pub fn do_indexing(
	target_dir: &Path,
	state: Arc<State>,
	options: &Options,
	sampler: Arc<dyn Sampler>,
) -> Result<()> {
	state.begin_pass("INDEXING", 3);

	let chunks = get_chunks(target_dir)?;
	let attributes = chunks.attributes.clone();
	let spacing = (&chunks.max - &chunks.min).x / 128.0;

	let indexer = Arc::new(Indexer::new(
		target_dir,
		attributes.clone(),
		spacing,
		Arc::clone(&state),
	)?);

	let root = Arc::new(Mutex::new(Node::new(
		"r".to_string(),
		chunks.min.clone(),
		chunks.max.clone(),
	)));

	let encoding = options.encoding;
	let keep_chunks = options.keep_chunks;

	let num_threads = std::thread::available_parallelism()
		.map(|n| n.get())
		.unwrap_or(4) + 4;

	{
		let pool = {
			let indexer = Arc::clone(&indexer);
			let sampler = Arc::clone(&sampler);
			let root = Arc::clone(&root);

			TaskPool::new(num_threads, move |chunk: Chunk| {
				index_chunk(&indexer, &sampler, &root, &chunk, encoding, keep_chunks);
			})
		};

		for chunk in chunks.list.iter().cloned() {
			pool.add_task(chunk);
		}

		pool.close();
	}

	let mut root = Arc::try_unwrap(root)
		.unwrap_or_else(|_| panic!("indexing workers still hold the octree root"))
		.into_inner()
		.unwrap();

	let mut on_completed = |node: &mut Node| {
		indexer.writer.write_and_unload(node, &attributes, encoding);
	};
	let mut on_discarded = |_node: &mut Node| {};

	{
		// sample the merged chunk-root batches up to the global root
		let chunk_roots_path = target_dir.join("tmpChunkRoots.bin");
		let flushed = indexer.chunk_roots.lock().unwrap().flushed.clone();
		let tasks = process_chunk_roots(&flushed);

		for task in tasks {
			for fcr in &task.fcrs {
				let buffer = read_chunk_root_buffer(&chunk_roots_path, fcr)?;

				let node = root.descendant_mut(&fcr.name);
				node.points = Some(buffer);
				node.num_points = fcr.num_points;
			}

			let task_node = root.descendant_mut(&task.name);
			if !task_node.sampled {
				sampler.sample(
					task_node,
					&attributes,
					spacing,
					&mut on_completed,
					&mut on_discarded,
				);
			}
		}
	}

	if !root.sampled {
		sampler.sample(
			&mut root,
			&attributes,
			spacing,
			&mut on_completed,
			&mut on_discarded,
		);
	}

	// the root is finished once all descendants are sampled
	on_completed(&mut root);

	indexer.writer.close_and_wait();

	let hierarchy = create_hierarchy(&root);
	let hierarchy_path = target_dir.join("hierarchy.bin");
	std::fs::write(&hierarchy_path, &hierarchy.buffer)
		.with_context(|| format!("write {}", hierarchy_path.display()))?;

	// depth as seen while building; sampling may have emptied the very
	// deepest nodes but viewers only use this as a hint
	let octree_depth = (*indexer.octree_depth.lock().unwrap()).max(hierarchy.depth as i64);

	let metadata = Metadata::create(
		&root.min,
		&root.max,
		&attributes,
		options,
		state.points_total.load(Ordering::Relaxed),
		HierarchyJson {
			first_chunk_size: hierarchy.first_chunk_size,
			step_size: hierarchy.step_size,
			depth: octree_depth as u8,
		},
		spacing,
	);

	let metadata_path = target_dir.join("metadata.json");
	let file = File::create(&metadata_path)
		.with_context(|| format!("create {}", metadata_path.display()))?;
	serde_json::to_writer_pretty(file, &metadata).context("write metadata.json")?;

	// temporary files
	std::fs::remove_file(target_dir.join("tmpChunkRoots.bin")).ok();
	if !options.keep_chunks {
		std::fs::remove_dir_all(target_dir.join("chunks")).ok();
	}

	Ok(())
}

fn index_chunk(
	indexer: &Indexer,
	sampler: &Arc<dyn Sampler>,
	root: &Mutex<Node>,
	chunk: &Chunk,
	encoding: crate::model::options::Encoding,
	keep_chunks: bool,
) {
	indexer.wait_until_writer_backlog_below(MAX_BACKLOG_MB);
	indexer.wait_until_memory_below(MAX_MEMORY_MB);

	log::info!("start indexing chunk {}", chunk.id);

	let filesize = std::fs::metadata(&chunk.file).map(|m| m.len()).unwrap_or(0);
	indexer
		.state
		.bytes_in_memory
		.fetch_add(filesize, Ordering::Relaxed);

	let point_buffer = match std::fs::read(&chunk.file) {
		Ok(buffer) => buffer,
		Err(error) => logger::fatal(&format!(
			"failed to read chunk file {}: {}",
			chunk.file.display(),
			error
		)),
	};

	if !keep_chunks {
		std::fs::remove_file(&chunk.file).ok();
	}

	let bpp = indexer.attributes.bytes as usize;
	let num_points = (point_buffer.len() / bpp) as i64;

	let mut chunk_root = Node::new(chunk.id.clone(), chunk.min.clone(), chunk.max.clone());
	build_hierarchy(indexer, &mut chunk_root, point_buffer, num_points);

	let mut on_completed = |node: &mut Node| {
		indexer.writer.write_and_unload(node, &indexer.attributes, encoding);
	};
	let mut on_discarded = |_node: &mut Node| {};

	sampler.sample(
		&mut chunk_root,
		&indexer.attributes,
		indexer.spacing,
		&mut on_completed,
		&mut on_discarded,
	);

	indexer.flush_chunk_root(&mut chunk_root);

	indexer
		.state
		.points_processed
		.fetch_add(num_points as u64, Ordering::Relaxed);

	{
		let mut root = root.lock().unwrap();

		if chunk_root.name.len() > 1 {
			root.add_descendant(Box::new(chunk_root));
		} else {
			// a single chunk covering everything becomes the root itself
			*root = chunk_root;
		}
	}

	log::info!("finished indexing chunk {}", chunk.id);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::attributes::{Attribute, AttributeType};
	use crate::model::options::{ChunkMethod, Encoding, SamplingMethod};
	use crate::sampling::create_sampler;
	use byteorder::{LittleEndian, WriteBytesExt};

	fn position_attributes() -> Attributes {
		let mut attributes = Attributes::from_attributes(vec![Attribute::new(
			"position",
			12,
			3,
			4,
			AttributeType::INT32,
		)]);
		attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
		attributes.pos_offset = Vector3::empty();
		attributes
	}

	fn encode_points(points: &[(f64, f64, f64)]) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(points.len() * 12);
		for &(x, y, z) in points {
			buffer
				.write_i32::<LittleEndian>((x / 0.001).round() as i32)
				.unwrap();
			buffer
				.write_i32::<LittleEndian>((y / 0.001).round() as i32)
				.unwrap();
			buffer
				.write_i32::<LittleEndian>((z / 0.001).round() as i32)
				.unwrap();
		}
		buffer
	}

	fn test_indexer(dir: &Path) -> Indexer {
		std::fs::create_dir_all(dir).unwrap();
		Indexer::new(dir, position_attributes(), 1.0 / 128.0, Arc::new(State::new())).unwrap()
	}

	fn scratch_dir(tag: &str) -> PathBuf {
		std::env::temp_dir().join(format!("octree-indexing-{}-{}", tag, std::process::id()))
	}

	#[test]
	fn test_build_hierarchy_small_buffer_stays_leaf() {
		let dir = scratch_dir("leaf");
		let indexer = test_indexer(&dir);

		let points = encode_points(&[(0.1, 0.1, 0.1), (0.9, 0.9, 0.9)]);
		let mut node = Node::new(
			"r".to_string(),
			Vector3::new(0.0, 0.0, 0.0),
			Vector3::new(1.0, 1.0, 1.0),
		);

		build_hierarchy(&indexer, &mut node, points, 2);

		assert!(node.is_leaf());
		assert_eq!(node.num_points, 2);

		indexer.writer.close_and_wait();
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn test_build_hierarchy_splits_and_conserves_points() {
		let dir = scratch_dir("split");
		let indexer = test_indexer(&dir);

		// enough points to force a split, spread over the unit cube
		let total = (MAX_POINTS_PER_NODE + 5_000) as usize;
		let points: Vec<(f64, f64, f64)> = (0..total)
			.map(|i| {
				let t = i as f64 / total as f64;
				(t, (t * 17.0) % 1.0, (t * 31.0) % 1.0)
			})
			.collect();

		let mut node = Node::new(
			"r".to_string(),
			Vector3::new(0.0, 0.0, 0.0),
			Vector3::new(1.0, 1.0, 1.0),
		);
		build_hierarchy(&indexer, &mut node, encode_points(&points), total as i64);

		assert!(!node.is_leaf());

		let mut stored = 0i64;
		node.traverse(&mut |n| stored += n.num_points);
		assert_eq!(stored, total as i64);

		// every stored point lies inside its node's box
		let attributes = position_attributes();
		node.traverse(&mut |n| {
			let buffer = n.points.as_deref().unwrap_or(&[]);
			for i in 0..n.num_points as usize {
				let p = crate::sampling::decode_position(
					buffer,
					i,
					12,
					&attributes.pos_scale,
					&attributes.pos_offset,
				);
				let eps = attributes.pos_scale.x;
				assert!(p.x >= n.min.x - eps && p.x <= n.max.x + eps);
				assert!(p.y >= n.min.y - eps && p.y <= n.max.y + eps);
				assert!(p.z >= n.min.z - eps && p.z <= n.max.z + eps);
			}
		});

		indexer.writer.close_and_wait();
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn test_build_hierarchy_drops_massed_duplicates() {
		let dir = scratch_dir("dups");
		let indexer = test_indexer(&dir);

		// twice the node budget, all at the same coordinate
		let total = (2 * MAX_POINTS_PER_NODE) as usize;
		let points: Vec<(f64, f64, f64)> = vec![(0.0, 0.0, 0.0); total];

		let mut node = Node::new(
			"r".to_string(),
			Vector3::new(0.0, 0.0, 0.0),
			Vector3::new(1.0, 1.0, 1.0),
		);
		build_hierarchy(&indexer, &mut node, encode_points(&points), total as i64);

		let mut stored = 0i64;
		node.traverse(&mut |n| stored += n.num_points);
		assert_eq!(stored, 1, "duplicates collapse to one distinct point");

		indexer.writer.close_and_wait();
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn test_chunk_root_batching_merges_small_subtrees() {
		let flushed = vec![
			FlushedChunkRoot {
				name: "r0".to_string(),
				offset: 0,
				size: 120,
				num_points: 10,
			},
			FlushedChunkRoot {
				name: "r1".to_string(),
				offset: 120,
				size: 120,
				num_points: 10,
			},
		];

		let tasks = process_chunk_roots(&flushed);

		assert_eq!(tasks.len(), 1);
		assert_eq!(tasks[0].name, "r");
		assert_eq!(tasks[0].fcrs.len(), 2);
	}

	#[test]
	fn test_chunk_root_batching_keeps_large_subtrees_apart() {
		let flushed = vec![
			FlushedChunkRoot {
				name: "r0".to_string(),
				offset: 0,
				size: 0,
				num_points: CHUNK_ROOT_BATCH_THRESHOLD,
			},
			FlushedChunkRoot {
				name: "r1".to_string(),
				offset: 0,
				size: 0,
				num_points: CHUNK_ROOT_BATCH_THRESHOLD,
			},
		];

		let tasks = process_chunk_roots(&flushed);

		let mut names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
		names.sort();
		assert_eq!(names, vec!["r0", "r1"]);
	}

	/// End-to-end over a synthetic chunk: one chunk file, poisson
	/// sampling, then a hierarchy that accounts for every point.
	#[test]
	fn test_indexing_single_chunk_end_to_end() {
		let dir = scratch_dir("e2e");
		let chunks_dir = dir.join("chunks");
		std::fs::create_dir_all(&chunks_dir).unwrap();

		let total = 10_000usize;
		let points: Vec<(f64, f64, f64)> = (0..total)
			.map(|i| {
				let t = i as f64 / total as f64;
				(t, (t * 7.0) % 1.0, (t * 13.0) % 1.0)
			})
			.collect();
		std::fs::write(chunks_dir.join("chunk_r.bin"), encode_points(&points)).unwrap();

		let attributes = position_attributes();
		let metadata = crate::model::metadata::ChunkingMetadata {
			min: [0.0, 0.0, 0.0],
			max: [1.0, 1.0, 1.0],
			offset: attributes.pos_offset.to_array(),
			scale: attributes.pos_scale.to_array(),
			attributes: attributes
				.list
				.iter()
				.map(crate::model::metadata::Attribute::from_attribute)
				.collect(),
		};
		serde_json::to_writer(
			File::create(chunks_dir.join("metadata.json")).unwrap(),
			&metadata,
		)
		.unwrap();

		let state = Arc::new(State::new());
		state.points_total.store(total as u64, Ordering::Relaxed);

		let options = Options {
			source: Vec::new(),
			outdir: dir.to_str().unwrap().to_string(),
			name: "e2e".to_string(),
			encoding: Encoding::DEFAULT,
			method: SamplingMethod::Poisson,
			chunk_method: ChunkMethod::Laszip,
			attributes: Vec::new(),
			projection: String::new(),
			generate_page: false,
			page_name: String::new(),
			page_title: String::new(),
			keep_chunks: false,
			no_chunking: false,
			no_indexing: false,
		};

		let sampler: Arc<dyn Sampler> = Arc::from(create_sampler(SamplingMethod::Poisson));
		do_indexing(&dir, state, &options, sampler).unwrap();

		let octree = std::fs::read(dir.join("octree.bin")).unwrap();
		assert_eq!(octree.len(), total * 12, "every point written exactly once");

		let hierarchy = std::fs::read(dir.join("hierarchy.bin")).unwrap();
		assert!(!hierarchy.is_empty());
		assert_eq!(hierarchy.len() % 22, 0);

		let metadata: serde_json::Value =
			serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json")).unwrap())
				.unwrap();
		assert_eq!(metadata["points"], total as u64);
		assert_eq!(metadata["version"], "2.0");

		std::fs::remove_dir_all(&dir).unwrap();
	}

	/// Two chunks in disjoint octants: the chunk roots are merged into a
	/// single batch, sampled up to the root, and every point lands in
	/// `octree.bin` exactly once.
	#[test]
	fn test_indexing_two_chunks_merges_up_to_root() {
		let dir = scratch_dir("twochunks");
		let chunks_dir = dir.join("chunks");
		std::fs::create_dir_all(&chunks_dir).unwrap();

		let per_chunk = 2_000usize;
		let mut total = 0usize;

		// octant 0 spans [0, 0.5)³, octant 7 spans [0.5, 1)³
		for (id, base) in [("r0", 0.0f64), ("r7", 0.5f64)] {
			let points: Vec<(f64, f64, f64)> = (0..per_chunk)
				.map(|i| {
					let t = i as f64 / per_chunk as f64;
					(
						base + t * 0.49,
						base + (t * 7.0) % 1.0 * 0.49,
						base + (t * 13.0) % 1.0 * 0.49,
					)
				})
				.collect();
			total += points.len();

			std::fs::write(
				chunks_dir.join(format!("chunk_{}.bin", id)),
				encode_points(&points),
			)
			.unwrap();
		}

		let attributes = position_attributes();
		let metadata = crate::model::metadata::ChunkingMetadata {
			min: [0.0, 0.0, 0.0],
			max: [1.0, 1.0, 1.0],
			offset: attributes.pos_offset.to_array(),
			scale: attributes.pos_scale.to_array(),
			attributes: attributes
				.list
				.iter()
				.map(crate::model::metadata::Attribute::from_attribute)
				.collect(),
		};
		serde_json::to_writer(
			File::create(chunks_dir.join("metadata.json")).unwrap(),
			&metadata,
		)
		.unwrap();

		let state = Arc::new(State::new());
		state.points_total.store(total as u64, Ordering::Relaxed);

		let options = Options {
			source: Vec::new(),
			outdir: dir.to_str().unwrap().to_string(),
			name: "twochunks".to_string(),
			encoding: Encoding::DEFAULT,
			method: SamplingMethod::Poisson,
			chunk_method: ChunkMethod::Laszip,
			attributes: Vec::new(),
			projection: String::new(),
			generate_page: false,
			page_name: String::new(),
			page_title: String::new(),
			keep_chunks: false,
			no_chunking: false,
			no_indexing: false,
		};

		let sampler: Arc<dyn Sampler> = Arc::from(create_sampler(SamplingMethod::Poisson));
		do_indexing(&dir, state, &options, sampler).unwrap();

		let octree = std::fs::read(dir.join("octree.bin")).unwrap();
		assert_eq!(octree.len(), total * 12);

		let metadata: serde_json::Value =
			serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json")).unwrap())
				.unwrap();
		assert_eq!(metadata["points"], total as u64);

		// the root record leads the first hierarchy batch; the root batch
		// was sampled, so it has representatives and both child octants
		let hierarchy = std::fs::read(dir.join("hierarchy.bin")).unwrap();
		let root_child_mask = hierarchy[1];
		let root_num_points = u32::from_le_bytes(hierarchy[2..6].try_into().unwrap());
		assert!(root_num_points > 0);
		assert_eq!(root_child_mask & 0b1000_0001, 0b1000_0001);

		std::fs::remove_dir_all(&dir).unwrap();
	}
}

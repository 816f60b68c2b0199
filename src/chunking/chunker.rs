//! Three-pass count-sort chunker: count points into a fine Morton grid,
//! collapse the grid into an octree-shaped chunk plan, then re-read all
//! inputs and distribute every point into its chunk file.

use crate::chunking::{GRID_SIZE, MAX_POINTS_PER_CHUNK};
use crate::model::attributes::{AttributeType, Attributes};
use crate::model::metadata::{Attribute as JsonAttribute, ChunkingMetadata};
use crate::model::vector3::Vector3;
use crate::model::State;
use crate::morton::morton_encode;
use crate::pyramid::{create_nodes, create_sum_pyramid, NodeCandidate};
use crate::source::{parse_extra_attributes, Source};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bytes a worker stages per chunk before taking that chunk's append lock.
const STAGING_FLUSH_BYTES: usize = 1024 * 1024;

pub fn do_chunking(
	sources: &[Source],
	target_dir: &Path,
	min: &Vector3,
	max: &Vector3,
	state: &State,
	output_attributes: &Attributes,
) -> Result<()> {
	let chunks_dir = target_dir.join("chunks");
	std::fs::create_dir_all(&chunks_dir)
		.with_context(|| format!("create chunk directory {}", chunks_dir.display()))?;

	state.begin_pass("COUNTING", 1);
	let grid = count_points(sources, min, max, state)?;

	let pyramid = create_sum_pyramid(grid, GRID_SIZE as usize);
	let candidates = create_nodes(&pyramid, MAX_POINTS_PER_CHUNK);

	for candidate in &candidates {
		if candidate.num_points > MAX_POINTS_PER_CHUNK {
			log::warn!(
				"chunk r{} holds {} points, more than the budget of {}. A single cell at the finest counter-grid level cannot be split further.",
				candidate.name,
				candidate.num_points,
				MAX_POINTS_PER_CHUNK
			);
		}
	}

	log::info!("chunk plan: {} chunks", candidates.len());
	if candidates.len() > 1000 {
		log::warn!("more than 1000 chunk files are kept open simultaneously");
	}

	state.begin_pass("CHUNKING", 2);
	let attributes =
		distribute_points(sources, &chunks_dir, min, max, state, output_attributes, &candidates)?;

	write_chunking_metadata(&chunks_dir, min, max, &attributes)?;

	Ok(())
}

/// Cell index of a world position in the fine counting grid, clamped to
/// the grid on all axes.
fn grid_index_of(point: &Vector3, min: &Vector3, size: &Vector3) -> usize {
	let gx = (GRID_SIZE as f64 * (point.x - min.x) / size.x) as i64;
	let gy = (GRID_SIZE as f64 * (point.y - min.y) / size.y) as i64;
	let gz = (GRID_SIZE as f64 * (point.z - min.z) / size.z) as i64;

	let gx = gx.clamp(0, GRID_SIZE - 1) as u64;
	let gy = gy.clamp(0, GRID_SIZE - 1) as u64;
	let gz = gz.clamp(0, GRID_SIZE - 1) as u64;

	morton_encode(gx, gy, gz) as usize
}

/// Pass A: one counter per grid cell, accumulated in parallel over the
/// input files with per-task grids merged by reduction.
fn count_points(
	sources: &[Source],
	min: &Vector3,
	max: &Vector3,
	state: &State,
) -> Result<Vec<i64>> {
	let cells = (GRID_SIZE * GRID_SIZE * GRID_SIZE) as usize;
	let size = max - min;

	sources
		.par_iter()
		.map(|source| -> Result<Vec<i64>> {
			let mut reader = las::Reader::from_path(&source.path)
				.with_context(|| format!("open LAS/LAZ file {}", source.path.display()))?;

			let mut grid = vec![0i64; cells];
			let mut processed = 0u64;

			for point in reader.points() {
				let point = match point {
					Ok(point) => point,
					Err(error) => {
						log::warn!(
							"skipping unreadable point in {}: {}",
							source.path.display(),
							error
						);
						continue;
					}
				};

				let position = Vector3::new(point.x, point.y, point.z);
				grid[grid_index_of(&position, min, &size)] += 1;

				processed += 1;
				if processed % 1_000_000 == 0 {
					state.points_processed.fetch_add(1_000_000, Ordering::Relaxed);
				}
			}
			state
				.points_processed
				.fetch_add(processed % 1_000_000, Ordering::Relaxed);

			Ok(grid)
		})
		.try_reduce(
			|| vec![0i64; cells],
			|mut merged, grid| {
				for (target, count) in merged.iter_mut().zip(grid) {
					*target += count;
				}
				Ok(merged)
			},
		)
}

/// Expands the chunk plan into a lookup table from finest-level grid cell
/// to chunk index.
fn build_cell_lookup(candidates: &[NodeCandidate]) -> Vec<u32> {
	let cells = (GRID_SIZE * GRID_SIZE * GRID_SIZE) as usize;
	let max_level = (GRID_SIZE as f64).log2() as i64;

	let mut lookup = vec![u32::MAX; cells];

	for (chunk_index, candidate) in candidates.iter().enumerate() {
		let level_code =
			morton_encode(candidate.x as u64, candidate.y as u64, candidate.z as u64);
		let shift = 3 * (max_level - candidate.level);
		let first = (level_code << shift) as usize;
		let count = 1usize << shift;

		lookup[first..first + count].fill(chunk_index as u32);
	}

	lookup
}

/// Per-source mapping from extra-bytes attribute name to its byte range
/// inside `las::Point::extra_bytes`.
fn extra_bytes_layout(header: &las::Header) -> HashMap<String, (usize, usize)> {
	let mut layout = HashMap::new();
	let mut offset = 0usize;

	for attribute in parse_extra_attributes(header) {
		layout.insert(attribute.name.clone(), (offset, attribute.size as usize));
		offset += attribute.size as usize;
	}

	layout
}

struct RecordEncoder<'a> {
	attributes: &'a Attributes,
	extra_layout: HashMap<String, (usize, usize)>,
	clamped: &'a AtomicU64,
}

impl RecordEncoder<'_> {
	fn quantize(&self, value: f64, scale: f64, offset: f64) -> i32 {
		let quantized = ((value - offset) / scale).round();

		if quantized < i32::MIN as f64 || quantized > i32::MAX as f64 {
			self.clamped.fetch_add(1, Ordering::Relaxed);
			quantized.clamp(i32::MIN as f64, i32::MAX as f64) as i32
		} else {
			quantized as i32
		}
	}

	/// Appends one point in the unified record layout.
	fn encode(&self, point: &las::Point, out: &mut Vec<u8>) {
		let scale = &self.attributes.pos_scale;
		let offset = &self.attributes.pos_offset;

		for attribute in &self.attributes.list {
			match attribute.name.as_str() {
				"position" => {
					out.write_i32::<LittleEndian>(self.quantize(point.x, scale.x, offset.x))
						.unwrap();
					out.write_i32::<LittleEndian>(self.quantize(point.y, scale.y, offset.y))
						.unwrap();
					out.write_i32::<LittleEndian>(self.quantize(point.z, scale.z, offset.z))
						.unwrap();
				}
				"intensity" => out.write_u16::<LittleEndian>(point.intensity).unwrap(),
				"return number" => out.push(point.return_number),
				"number of returns" => out.push(point.number_of_returns),
				"classification" => out.push(u8::from(point.classification)),
				"classification flags" => {
					let flags = (point.is_synthetic as u8)
						| (point.is_key_point as u8) << 1
						| (point.is_withheld as u8) << 2
						| (point.is_overlap as u8) << 3;
					out.push(flags);
				}
				"scan angle rank" => out.push(point.scan_angle as i8 as u8),
				"scan angle" => out
					.write_i16::<LittleEndian>((point.scan_angle / 0.006).round() as i16)
					.unwrap(),
				"user data" => out.push(point.user_data),
				"point source id" => {
					out.write_u16::<LittleEndian>(point.point_source_id).unwrap()
				}
				"gps-time" => out
					.write_f64::<LittleEndian>(point.gps_time.unwrap_or(0.0))
					.unwrap(),
				"rgb" => {
					let color = point.color.unwrap_or(las::Color::new(0, 0, 0));
					out.write_u16::<LittleEndian>(color.red).unwrap();
					out.write_u16::<LittleEndian>(color.green).unwrap();
					out.write_u16::<LittleEndian>(color.blue).unwrap();
				}
				"wave packet descriptor index" => {
					let waveform = point.waveform.clone().unwrap_or_default();
					out.push(waveform.wave_packet_descriptor_index);
				}
				"byte offset to waveform data" => {
					let waveform = point.waveform.clone().unwrap_or_default();
					out.write_u64::<LittleEndian>(waveform.byte_offset_to_waveform_data)
						.unwrap();
				}
				"waveform packet size" => {
					let waveform = point.waveform.clone().unwrap_or_default();
					out.write_u32::<LittleEndian>(waveform.waveform_packet_size_in_bytes)
						.unwrap();
				}
				"return point waveform location" => {
					let waveform = point.waveform.clone().unwrap_or_default();
					out.write_f32::<LittleEndian>(waveform.return_point_waveform_location)
						.unwrap();
				}
				"XYZ(t)" => {
					let waveform = point.waveform.clone().unwrap_or_default();
					out.write_f32::<LittleEndian>(waveform.x_t).unwrap();
					out.write_f32::<LittleEndian>(waveform.y_t).unwrap();
					out.write_f32::<LittleEndian>(waveform.z_t).unwrap();
				}
				name => {
					// extra-bytes attribute, copied from the source layout
					match self.extra_layout.get(name) {
						Some(&(source_offset, size))
							if point.extra_bytes.len() >= source_offset + size =>
						{
							out.extend_from_slice(
								&point.extra_bytes[source_offset..source_offset + size],
							);
						}
						_ => out.extend(std::iter::repeat(0u8).take(attribute.size as usize)),
					}
				}
			}
		}
	}
}

fn decode_element(bytes: &[u8], r#type: AttributeType) -> f64 {
	match r#type {
		AttributeType::INT8 => bytes[0] as i8 as f64,
		AttributeType::INT16 => i16::from_le_bytes(bytes[..2].try_into().unwrap()) as f64,
		AttributeType::INT32 => i32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
		AttributeType::INT64 => i64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
		AttributeType::UINT8 => bytes[0] as f64,
		AttributeType::UINT16 => u16::from_le_bytes(bytes[..2].try_into().unwrap()) as f64,
		AttributeType::UINT32 => u32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
		AttributeType::UINT64 => u64::from_le_bytes(bytes[..8].try_into().unwrap()) as f64,
		AttributeType::FLOAT => f32::from_le_bytes(bytes[..4].try_into().unwrap()) as f64,
		AttributeType::DOUBLE => f64::from_le_bytes(bytes[..8].try_into().unwrap()),
		AttributeType::UNDEFINED => 0.0,
	}
}

/// Running min/max (and histogram for 1-byte attributes) per output
/// attribute, accumulated while records are encoded.
struct AttributeStats {
	min: Vector3,
	max: Vector3,
	histogram: Vec<i64>,
}

impl AttributeStats {
	fn new() -> AttributeStats {
		AttributeStats {
			min: Vector3::infinity(),
			max: Vector3::infinity() * -1.0,
			histogram: vec![0; 256],
		}
	}

	fn update_component(&mut self, element: usize, value: f64) {
		match element {
			0 => {
				self.min.x = self.min.x.min(value);
				self.max.x = self.max.x.max(value);
			}
			1 => {
				self.min.y = self.min.y.min(value);
				self.max.y = self.max.y.max(value);
			}
			2 => {
				self.min.z = self.min.z.min(value);
				self.max.z = self.max.z.max(value);
			}
			_ => {}
		}
	}

	fn merge(&mut self, other: &AttributeStats) {
		self.min.x = self.min.x.min(other.min.x);
		self.min.y = self.min.y.min(other.min.y);
		self.min.z = self.min.z.min(other.min.z);
		self.max.x = self.max.x.max(other.max.x);
		self.max.y = self.max.y.max(other.max.y);
		self.max.z = self.max.z.max(other.max.z);

		for (target, count) in self.histogram.iter_mut().zip(&other.histogram) {
			*target += count;
		}
	}
}

fn update_stats(stats: &mut [AttributeStats], record: &[u8], attributes: &Attributes) {
	let mut offset = 0usize;

	for (attribute, stat) in attributes.list.iter().zip(stats.iter_mut()) {
		let size = attribute.size as usize;
		let bytes = &record[offset..offset + size];

		if attribute.name == "position" {
			// positions are tracked in world space
			for element in 0..3 {
				let quantized = decode_element(&bytes[element * 4..], AttributeType::INT32);
				let (scale, shift) = match element {
					0 => (attributes.pos_scale.x, attributes.pos_offset.x),
					1 => (attributes.pos_scale.y, attributes.pos_offset.y),
					_ => (attributes.pos_scale.z, attributes.pos_offset.z),
				};
				stat.update_component(element, quantized * scale + shift);
			}
		} else {
			let element_size = attribute.element_size as usize;
			for element in 0..attribute.num_elements.min(3) as usize {
				let value = decode_element(&bytes[element * element_size..], attribute.r#type);
				stat.update_component(element, value);
			}
		}

		if size == 1 {
			stat.histogram[bytes[0] as usize] += 1;
		}

		offset += size;
	}
}

/// Pass C: re-read every input and append each encoded point to its chunk
/// file, staging per worker and flushing under the chunk's append lock.
fn distribute_points(
	sources: &[Source],
	chunks_dir: &Path,
	min: &Vector3,
	max: &Vector3,
	state: &State,
	output_attributes: &Attributes,
	candidates: &[NodeCandidate],
) -> Result<Attributes> {
	let size = max - min;
	let lookup = build_cell_lookup(candidates);
	let clamped = AtomicU64::new(0);

	let writers: Vec<Mutex<BufWriter<File>>> = candidates
		.iter()
		.map(|candidate| {
			let path = chunks_dir.join(format!("chunk_r{}.bin", candidate.name));
			let file = File::create(&path)
				.with_context(|| format!("create chunk file {}", path.display()))?;
			Ok(Mutex::new(BufWriter::new(file)))
		})
		.collect::<Result<_>>()?;

	let global_stats: Mutex<Vec<AttributeStats>> = Mutex::new(
		output_attributes
			.list
			.iter()
			.map(|_| AttributeStats::new())
			.collect(),
	);

	sources.par_iter().try_for_each(|source| -> Result<()> {
		let mut reader = las::Reader::from_path(&source.path)
			.with_context(|| format!("open LAS/LAZ file {}", source.path.display()))?;

		let encoder = RecordEncoder {
			attributes: output_attributes,
			extra_layout: extra_bytes_layout(reader.header()),
			clamped: &clamped,
		};

		let mut staging: Vec<Vec<u8>> = candidates.iter().map(|_| Vec::new()).collect();
		let mut stats: Vec<AttributeStats> = output_attributes
			.list
			.iter()
			.map(|_| AttributeStats::new())
			.collect();
		let mut record = Vec::with_capacity(output_attributes.bytes as usize);
		let mut processed = 0u64;

		for point in reader.points() {
			let point = match point {
				Ok(point) => point,
				Err(error) => {
					log::warn!(
						"skipping unreadable point in {}: {}",
						source.path.display(),
						error
					);
					continue;
				}
			};

			let position = Vector3::new(point.x, point.y, point.z);
			let chunk_index = lookup[grid_index_of(&position, min, &size)];
			if chunk_index == u32::MAX {
				// the counting pass saw this cell, so the plan covers it;
				// a miss means the inputs changed mid-run
				log::warn!("point outside the chunk plan, skipped");
				continue;
			}

			record.clear();
			encoder.encode(&point, &mut record);
			update_stats(&mut stats, &record, output_attributes);

			let target = &mut staging[chunk_index as usize];
			target.extend_from_slice(&record);

			if target.len() >= STAGING_FLUSH_BYTES {
				let mut writer = writers[chunk_index as usize].lock().unwrap();
				writer.write_all(target).context("write chunk file")?;
				target.clear();
			}

			processed += 1;
			if processed % 1_000_000 == 0 {
				state.points_processed.fetch_add(1_000_000, Ordering::Relaxed);
			}
		}
		state
			.points_processed
			.fetch_add(processed % 1_000_000, Ordering::Relaxed);

		for (chunk_index, target) in staging.iter().enumerate() {
			if !target.is_empty() {
				let mut writer = writers[chunk_index].lock().unwrap();
				writer.write_all(target).context("write chunk file")?;
			}
		}

		let mut global = global_stats.lock().unwrap();
		for (target, local) in global.iter_mut().zip(&stats) {
			target.merge(local);
		}

		Ok(())
	})?;

	for writer in &writers {
		writer.lock().unwrap().flush().context("flush chunk file")?;
	}

	let clamped = clamped.load(Ordering::Relaxed);
	if clamped > 0 {
		log::warn!("{} coordinates were outside the 32 bit range and clamped", clamped);
	}

	// fold the accumulated statistics into the attribute descriptors
	let mut attributes = output_attributes.clone();
	let global = global_stats.into_inner().unwrap();
	for (attribute, stat) in attributes.list.iter_mut().zip(&global) {
		attribute.min = stat.min.clone();
		attribute.max = stat.max.clone();
		attribute.histogram = stat.histogram.clone();
	}

	Ok(attributes)
}

fn write_chunking_metadata(
	chunks_dir: &Path,
	min: &Vector3,
	max: &Vector3,
	attributes: &Attributes,
) -> Result<()> {
	let metadata = ChunkingMetadata {
		min: min.to_array(),
		max: max.to_array(),
		offset: attributes.pos_offset.to_array(),
		scale: attributes.pos_scale.to_array(),
		attributes: attributes
			.list
			.iter()
			.map(JsonAttribute::from_attribute)
			.collect(),
	};

	let path = chunks_dir.join("metadata.json");
	let file = File::create(&path)
		.with_context(|| format!("create chunk metadata {}", path.display()))?;
	serde_json::to_writer_pretty(file, &metadata).context("write chunk metadata")?;

	Ok(())
}

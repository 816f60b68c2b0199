//! Per-node payload encoding for the BROTLI output mode: point records are
//! transposed into one buffer per attribute, reordered along a Morton
//! curve and compressed in one shot.

use crate::model::attributes::Attributes;
use crate::morton::{morton_encode, morton_encode_128};
use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

struct MortonCode {
	upper: u64,
	lower: u64,
	index: usize,
}

struct SoA {
	buffers: HashMap<String, Vec<u8>>,
	codes: Vec<MortonCode>,
}

fn to_struct_of_arrays(points: &[u8], num_points: usize, attributes: &Attributes) -> SoA {
	let stride = attributes.bytes as usize;

	let mut buffers: HashMap<String, Vec<u8>> = HashMap::new();
	let mut codes: Vec<MortonCode> = Vec::new();

	for attribute in &attributes.list {
		let attribute_offset = attributes.get_offset(&attribute.name).unwrap() as usize;
		let size = attribute.size as usize;

		if attribute.name == "rgb" {
			let mut buffer_mc = Vec::with_capacity(8 * num_points);

			for i in 0..num_points {
				let offset = i * stride + attribute_offset;
				let r = u16::from_le_bytes(points[offset..offset + 2].try_into().unwrap());
				let g = u16::from_le_bytes(points[offset + 2..offset + 4].try_into().unwrap());
				let b = u16::from_le_bytes(points[offset + 4..offset + 6].try_into().unwrap());

				let mc = morton_encode(r as u64, g as u64, b as u64);
				buffer_mc.write_u64::<LittleEndian>(mc).unwrap();
			}

			buffers.insert("rgb_morton".to_string(), buffer_mc);
		} else if attribute.name == "position" {
			let mut positions = Vec::with_capacity(num_points);
			let mut min = (i32::MAX, i32::MAX, i32::MAX);

			for i in 0..num_points {
				let offset = i * stride + attribute_offset;
				let x = i32::from_le_bytes(points[offset..offset + 4].try_into().unwrap());
				let y = i32::from_le_bytes(points[offset + 4..offset + 8].try_into().unwrap());
				let z = i32::from_le_bytes(points[offset + 8..offset + 12].try_into().unwrap());

				min.0 = min.0.min(x);
				min.1 = min.1.min(y);
				min.2 = min.2.min(z);

				positions.push((x, y, z));
			}

			let mut buffer_mc = Vec::with_capacity(16 * num_points);
			for (index, (x, y, z)) in positions.iter().enumerate() {
				let mx = (x - min.0) as u32;
				let my = (y - min.1) as u32;
				let mz = (z - min.2) as u32;

				let (upper, lower) = morton_encode_128(mx, my, mz);

				buffer_mc.write_u64::<LittleEndian>(upper).unwrap();
				buffer_mc.write_u64::<LittleEndian>(lower).unwrap();

				codes.push(MortonCode {
					upper,
					lower,
					index,
				});
			}

			buffers.insert("position_morton".to_string(), buffer_mc);
		}

		let mut buffer = Vec::with_capacity(size * num_points);
		for i in 0..num_points {
			let offset = i * stride + attribute_offset;
			buffer.extend_from_slice(&points[offset..offset + size]);
		}

		buffers.insert(attribute.name.clone(), buffer);
	}

	SoA { buffers, codes }
}

fn mapped_name(name: &str) -> &str {
	match name {
		"position" => "position_morton",
		"rgb" => "rgb_morton",
		other => other,
	}
}

/// Encodes the node payload for the BROTLI output mode: per-attribute
/// buffers in schema order, every attribute reordered by the position
/// Morton curve, compressed at quality 6 with the default window.
pub fn compress(points: &[u8], num_points: i64, attributes: &Attributes) -> Result<Vec<u8>> {
	let num_points = num_points as usize;
	let mut soa = to_struct_of_arrays(points, num_points, attributes);

	soa.codes.sort_by(|a, b| {
		if a.upper == b.upper {
			a.lower.cmp(&b.lower)
		} else {
			a.upper.cmp(&b.upper)
		}
	});

	let mut merged_size = 0;
	for attribute in &attributes.list {
		merged_size += soa.buffers[mapped_name(&attribute.name)].len();
	}

	let mut merged = Vec::with_capacity(merged_size);
	for attribute in &attributes.list {
		let buffer = &soa.buffers[mapped_name(&attribute.name)];
		let element_size = buffer.len() / num_points;

		for code in &soa.codes {
			let offset = code.index * element_size;
			merged.extend_from_slice(&buffer[offset..offset + element_size]);
		}
	}

	let params = brotli::enc::BrotliEncoderParams {
		quality: 6,
		..Default::default()
	};

	let mut compressed = Vec::new();
	brotli::BrotliCompress(&mut Cursor::new(&merged), &mut compressed, &params)
		.context("brotli compression failed")?;

	Ok(compressed)
}

//! Source curation and output attribute planning: expands the input paths,
//! loads LAS/LAZ headers, derives the global bounding box and the unified
//! output attribute layout.

use crate::model::attributes::{Attribute, AttributeType, Attributes};
use crate::model::bounds::BoundingBox;
use crate::model::vector3::Vector3;
use anyhow::{bail, Context, Result};
use ord_subset::OrdSubsetIterExt;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Source {
	pub path: PathBuf,
	pub min: Vector3,
	pub max: Vector3,
	pub num_points: u64,
	pub filesize: u64,
}

pub struct Curated {
	pub name: String,
	pub files: Vec<Source>,
}

fn has_las_extension(path: &Path) -> bool {
	path.extension()
		.and_then(|ext| ext.to_str())
		.map(|ext| ext.eq_ignore_ascii_case("las") || ext.eq_ignore_ascii_case("laz"))
		.unwrap_or(false)
}

/// Expands files and directories (one level deep) into the list of LAS/LAZ
/// sources, loading all headers in parallel. The dataset name is derived
/// from the first path's stem.
pub fn curate_sources(paths: &[String]) -> Result<Curated> {
	let mut expanded: Vec<PathBuf> = Vec::new();
	let mut name = String::new();

	for path in paths {
		let path = PathBuf::from(path);

		if path.is_dir() {
			for entry in std::fs::read_dir(&path)
				.with_context(|| format!("read source directory {}", path.display()))?
			{
				let entry_path = entry?.path();
				if entry_path.is_file() && has_las_extension(&entry_path) {
					expanded.push(entry_path);
				}
			}
		} else if path.is_file() && has_las_extension(&path) {
			expanded.push(path.clone());
		} else if !path.exists() {
			bail!("file does not exist: {}", path.display());
		}

		if name.is_empty() {
			if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
				name = stem.to_string();
			}
		}
	}

	let files = expanded
		.par_iter()
		.map(|path| {
			let reader = las::Reader::from_path(path)
				.with_context(|| format!("open LAS/LAZ file {}", path.display()))?;
			let header = reader.header();
			let bounds = header.bounds();

			Ok(Source {
				path: path.clone(),
				min: Vector3::new(bounds.min.x, bounds.min.y, bounds.min.z),
				max: Vector3::new(bounds.max.x, bounds.max.y, bounds.max.z),
				num_points: header.number_of_points(),
				filesize: std::fs::metadata(path)?.len(),
			})
		})
		.collect::<Result<Vec<Source>>>()?;

	Ok(Curated { name, files })
}

pub struct Stats {
	pub min: Vector3,
	pub max: Vector3,
	pub total_bytes: u64,
	pub total_points: u64,
}

/// Unions the per-source boxes and cubes the result so octree subdivision
/// stays regular. A zero-size axis cannot be subdivided and is fatal.
pub fn compute_stats(sources: &[Source]) -> Result<Stats> {
	let bounds = BoundingBox::new(
		Vector3 {
			x: sources.iter().map(|s| s.min.x).ord_subset_min().unwrap_or(f64::INFINITY),
			y: sources.iter().map(|s| s.min.y).ord_subset_min().unwrap_or(f64::INFINITY),
			z: sources.iter().map(|s| s.min.z).ord_subset_min().unwrap_or(f64::INFINITY),
		},
		Vector3 {
			x: sources.iter().map(|s| s.max.x).ord_subset_max().unwrap_or(f64::NEG_INFINITY),
			y: sources.iter().map(|s| s.max.y).ord_subset_max().unwrap_or(f64::NEG_INFINITY),
			z: sources.iter().map(|s| s.max.z).ord_subset_max().unwrap_or(f64::NEG_INFINITY),
		},
	);

	let size = bounds.size();
	if size.x == 0.0 || size.y == 0.0 || size.z == 0.0 {
		bail!("invalid bounding box. at least one axis has a size of zero.");
	}

	let cubed = bounds.cubic();

	Ok(Stats {
		min: cubed.min,
		max: cubed.max,
		total_bytes: sources.iter().map(|s| s.filesize).sum(),
		total_points: sources.iter().map(|s| s.num_points).sum(),
	})
}

pub struct ScaleOffset {
	pub scale: Vector3,
	pub offset: Vector3,
}

/// Quantization covering the union box in a 30 bit grid per axis. 30
/// rather than 31 bits because a widespread viewer release reads the
/// coordinate field as unsigned, so the origin sits at the box minimum and
/// one bit stays unused.
pub fn compute_scale_offset(min: &Vector3, max: &Vector3, target_scale: &Vector3) -> ScaleOffset {
	const INTERVAL_30_BITS: f64 = (1u64 << 30) as f64;

	let size = max - min;

	ScaleOffset {
		scale: Vector3 {
			x: target_scale.x.max(size.x / INTERVAL_30_BITS),
			y: target_scale.y.max(size.y / INTERVAL_30_BITS),
			z: target_scale.z.max(size.z / INTERVAL_30_BITS),
		},
		offset: min.clone(),
	}
}

fn las_type_info(type_code: u8) -> Option<(AttributeType, i32)> {
	if !(1..=30).contains(&type_code) {
		return None;
	}

	let base = match (type_code - 1) % 10 {
		0 => AttributeType::UINT8,
		1 => AttributeType::INT8,
		2 => AttributeType::UINT16,
		3 => AttributeType::INT16,
		4 => AttributeType::UINT32,
		5 => AttributeType::INT32,
		6 => AttributeType::UINT64,
		7 => AttributeType::INT64,
		8 => AttributeType::FLOAT,
		_ => AttributeType::DOUBLE,
	};
	let num_elements = ((type_code - 1) / 10 + 1) as i32;

	Some((base, num_elements))
}

fn read_cstring(bytes: &[u8]) -> String {
	let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
	String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn read_f64_triple(bytes: &[u8]) -> Vector3 {
	let f = |i: usize| f64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
	Vector3::new(f(0), f(1), f(2))
}

/// Extra-bytes VLR (record id 4): a sequence of 192-byte field
/// descriptors appended verbatim to every point record.
pub fn parse_extra_attributes(header: &las::Header) -> Vec<Attribute> {
	const RECORD_SIZE: usize = 192;

	let mut attributes = Vec::new();

	for vlr in header.vlrs() {
		if vlr.record_id != 4 {
			continue;
		}

		let data = &vlr.data;
		let num_extra = data.len() / RECORD_SIZE;

		for i in 0..num_extra {
			let record = &data[i * RECORD_SIZE..(i + 1) * RECORD_SIZE];

			let type_code = record[2];
			let options = record[3];
			let name = read_cstring(&record[4..36]);
			let description = read_cstring(&record[160..192]);

			let Some((r#type, num_elements)) = las_type_info(type_code) else {
				log::warn!(
					"skipping extra-bytes attribute '{}' with unsupported type code {}",
					name,
					type_code
				);
				continue;
			};

			let element_size = r#type.size();
			let mut attribute = Attribute::new(
				&name,
				num_elements * element_size,
				num_elements,
				element_size,
				r#type,
			);
			attribute.description = description;

			if options & 0b0_1000 != 0 {
				attribute.scale = read_f64_triple(&record[112..136]);
			}
			if options & 0b1_0000 != 0 {
				attribute.offset = read_f64_triple(&record[136..160]);
			}

			attributes.push(attribute);
		}
	}

	attributes
}

/// Attribute fan-out of each LAS point data record format, in record
/// order. Unsupported formats abort the conversion.
pub fn format_attributes(header: &las::Header) -> Result<Vec<Attribute>> {
	let xyz = || Attribute::new("position", 12, 3, 4, AttributeType::INT32);
	let intensity = || Attribute::new("intensity", 2, 1, 2, AttributeType::UINT16);
	let return_number = || Attribute::new("return number", 1, 1, 1, AttributeType::UINT8);
	let number_of_returns = || Attribute::new("number of returns", 1, 1, 1, AttributeType::UINT8);
	let classification = || Attribute::new("classification", 1, 1, 1, AttributeType::UINT8);
	let scan_angle_rank = || Attribute::new("scan angle rank", 1, 1, 1, AttributeType::UINT8);
	let user_data = || Attribute::new("user data", 1, 1, 1, AttributeType::UINT8);
	let point_source_id = || Attribute::new("point source id", 2, 1, 2, AttributeType::UINT16);
	let gps_time = || Attribute::new("gps-time", 8, 1, 8, AttributeType::DOUBLE);
	let rgb = || Attribute::new("rgb", 6, 3, 2, AttributeType::UINT16);
	let classification_flags =
		|| Attribute::new("classification flags", 1, 1, 1, AttributeType::UINT8);
	let scan_angle = || Attribute::new("scan angle", 2, 1, 2, AttributeType::INT16);

	let wave_packet_descriptor_index =
		|| Attribute::new("wave packet descriptor index", 1, 1, 1, AttributeType::UINT8);
	let byte_offset_to_waveform_data =
		|| Attribute::new("byte offset to waveform data", 8, 1, 8, AttributeType::UINT64);
	let waveform_packet_size =
		|| Attribute::new("waveform packet size", 4, 1, 4, AttributeType::UINT32);
	let return_point_waveform_location =
		|| Attribute::new("return point waveform location", 4, 1, 4, AttributeType::FLOAT);
	let xyz_t = || Attribute::new("XYZ(t)", 12, 3, 4, AttributeType::FLOAT);

	let format = header.point_format();
	let format_id = format.to_u8().context("unsupported LAS point format")?;

	let mut list = match format_id {
		0..=5 => vec![
			xyz(),
			intensity(),
			return_number(),
			number_of_returns(),
			classification(),
			scan_angle_rank(),
			user_data(),
			point_source_id(),
		],
		6 | 7 => vec![
			xyz(),
			intensity(),
			return_number(),
			number_of_returns(),
			classification_flags(),
			classification(),
			user_data(),
			scan_angle(),
			point_source_id(),
			gps_time(),
		],
		other => bail!("currently unsupported LAS format: {}", other),
	};

	// formats 1, 3, 4 and 5 carry gps time; 2, 3, 5 and 7 carry rgb;
	// 4 and 5 carry wave packets
	if format.has_gps_time && format_id < 6 {
		list.push(gps_time());
	}
	if format.has_color {
		list.push(rgb());
	}
	if format.has_waveform {
		list.push(wave_packet_descriptor_index());
		list.push(byte_offset_to_waveform_data());
		list.push(waveform_packet_size());
		list.push(return_point_waveform_location());
		list.push(xyz_t());
	}

	list.extend(parse_extra_attributes(header));

	Ok(list)
}

/// Unifies the per-source schemas, fixes the output scale/offset and
/// applies the user's attribute whitelist.
pub fn compute_output_attributes(
	sources: &[Source],
	requested_attributes: &[String],
) -> Result<Attributes> {
	let per_source = sources
		.par_iter()
		.map(|source| {
			let reader = las::Reader::from_path(&source.path)
				.with_context(|| format!("open LAS/LAZ file {}", source.path.display()))?;
			let header = reader.header();

			let attributes = format_attributes(header)?;
			let transforms = header.transforms();
			let scale = Vector3::new(
				transforms.x.scale,
				transforms.y.scale,
				transforms.z.scale,
			);

			Ok((attributes, scale))
		})
		.collect::<Result<Vec<_>>>()?;

	let mut scale_min = Vector3::infinity();
	let mut min = Vector3::infinity();
	let mut max = Vector3::infinity() * -1.0;

	let mut full_list: Vec<Attribute> = Vec::new();

	for (source, (attributes, scale)) in sources.iter().zip(&per_source) {
		for attribute in attributes {
			if !full_list.iter().any(|a| a.name == attribute.name) {
				full_list.push(attribute.clone());
			}
		}

		scale_min.x = scale_min.x.min(scale.x);
		scale_min.y = scale_min.y.min(scale.y);
		scale_min.z = scale_min.z.min(scale.z);

		min.x = min.x.min(source.min.x);
		min.y = min.y.min(source.min.y);
		min.z = min.z.min(source.min.z);

		max.x = max.x.max(source.max.x);
		max.y = max.y.max(source.max.y);
		max.z = max.z.max(source.max.z);
	}

	let scale_offset = compute_scale_offset(&min, &max, &scale_min);

	if scale_offset.scale != scale_min {
		log::warn!(
			"scale was adjusted to cover the union bounding box. new scale: [{}, {}, {}]",
			scale_offset.scale.x,
			scale_offset.scale.y,
			scale_offset.scale.z
		);
	}

	// filter down to optionally specified attributes, position always first
	let filtered_list = if requested_attributes.is_empty() {
		full_list
	} else {
		let mut should: Vec<String> = vec!["position".to_string()];
		for name in requested_attributes {
			if !should.contains(name) {
				should.push(name.clone());
			}
		}

		should
			.iter()
			.filter_map(|name| full_list.iter().find(|a| &a.name == name).cloned())
			.collect()
	};

	let mut attributes = Attributes::from_attributes(filtered_list);
	attributes.pos_scale = scale_offset.scale;
	attributes.pos_offset = scale_offset.offset;

	Ok(attributes)
}

pub fn describe_attributes(attributes: &Attributes) -> String {
	let mut out = String::from("output attributes:\n");

	let mut offset = 0;
	for attribute in &attributes.list {
		out.push_str(&format!(
			"{:<30}{:>10}{:>8}\n",
			attribute.name, offset, attribute.size
		));
		offset += attribute.size;
	}
	out.push_str(&format!("bytes per point: {}\n", attributes.bytes));

	out
}

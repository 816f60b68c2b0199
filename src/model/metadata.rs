use crate::model::attributes::{Attribute as InternalAttribute, AttributeType, Attributes};
use crate::model::options::{Encoding, Options};
use crate::model::vector3::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hierarchy {
	pub first_chunk_size: u64,
	pub step_size: u8,
	pub depth: u8,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
	pub name: String,
	pub description: String,
	pub size: i32,
	pub num_elements: i32,
	pub element_size: i32,
	pub r#type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub histogram: Option<Vec<i64>>,
	pub min: Vec<f64>,
	pub max: Vec<f64>,
	pub scale: Vec<f64>,
	pub offset: Vec<f64>,
}

impl Attribute {
	pub fn from_attribute(attribute: &InternalAttribute) -> Attribute {
		let truncate = |v: &Vector3| match attribute.num_elements {
			1 => vec![v.x],
			2 => vec![v.x, v.y],
			_ => vec![v.x, v.y, v.z],
		};

		// histograms are only meaningful for 1-byte types, and an
		// all-zero histogram just means nothing was accumulated
		let histogram = if attribute.size == 1 && attribute.histogram.iter().any(|&count| count != 0)
		{
			Some(attribute.histogram.clone())
		} else {
			None
		};

		Attribute {
			name: attribute.name.clone(),
			description: attribute.description.clone(),
			size: attribute.size,
			num_elements: attribute.num_elements,
			element_size: attribute.element_size,
			r#type: attribute.r#type.type_name().to_string(),
			histogram,
			min: truncate(&attribute.min),
			max: truncate(&attribute.max),
			scale: truncate(&attribute.scale),
			offset: truncate(&attribute.offset),
		}
	}

	pub fn to_attribute(&self) -> InternalAttribute {
		let r#type =
			AttributeType::from_type_name(&self.r#type).unwrap_or(AttributeType::UNDEFINED);

		let mut attribute = InternalAttribute::new(
			&self.name,
			self.size,
			self.num_elements,
			self.element_size,
			r#type,
		);
		attribute.description = self.description.clone();

		if let Some(histogram) = &self.histogram {
			attribute.histogram = histogram.clone();
		}

		let assign = |target: &mut Vector3, values: &[f64]| {
			if let Some(&v) = values.first() {
				target.x = v;
			}
			if let Some(&v) = values.get(1) {
				target.y = v;
			}
			if let Some(&v) = values.get(2) {
				target.z = v;
			}
		};

		assign(&mut attribute.min, &self.min);
		assign(&mut attribute.max, &self.max);
		assign(&mut attribute.scale, &self.scale);
		assign(&mut attribute.offset, &self.offset);

		attribute
	}
}

#[derive(Serialize, Deserialize)]
pub struct BoundingBoxJson {
	pub min: [f64; 3],
	pub max: [f64; 3],
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
	pub version: String,
	pub name: String,
	pub description: String,
	pub points: u64,
	pub projection: String,
	pub hierarchy: Hierarchy,
	pub offset: [f64; 3],
	pub scale: [f64; 3],
	pub spacing: f64,
	pub bounding_box: BoundingBoxJson,
	pub encoding: Encoding,
	pub attributes: Vec<Attribute>,
}

impl Metadata {
	pub fn create(
		min: &Vector3,
		max: &Vector3,
		attributes: &Attributes,
		options: &Options,
		points_total: u64,
		hierarchy: Hierarchy,
		spacing: f64,
	) -> Metadata {
		Metadata {
			version: "2.0".to_string(),
			name: options.name.clone(),
			description: String::new(),
			points: points_total,
			projection: options.projection.clone(),
			hierarchy,
			offset: attributes.pos_offset.to_array(),
			scale: attributes.pos_scale.to_array(),
			spacing,
			bounding_box: BoundingBoxJson {
				min: min.to_array(),
				max: max.to_array(),
			},
			encoding: options.encoding,
			attributes: attributes
				.list
				.iter()
				.map(Attribute::from_attribute)
				.collect(),
		}
	}
}

/// Intermediate descriptor stored next to the chunk files so the indexer
/// can run without re-reading the sources.
#[derive(Serialize, Deserialize)]
pub struct ChunkingMetadata {
	pub min: [f64; 3],
	pub max: [f64; 3],
	pub offset: [f64; 3],
	pub scale: [f64; 3],
	pub attributes: Vec<Attribute>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::attributes::{Attribute as InternalAttribute, AttributeType};

	#[test]
	fn test_attribute_json_round_trip() {
		let mut attribute = InternalAttribute::new("intensity", 2, 1, 2, AttributeType::UINT16);
		attribute.min = Vector3::new(3.0, 0.0, 0.0);
		attribute.max = Vector3::new(4077.0, 0.0, 0.0);

		let json = Attribute::from_attribute(&attribute);
		assert_eq!(json.r#type, "uint16");
		assert_eq!(json.min, vec![3.0]);
		assert!(json.histogram.is_none());

		let back = json.to_attribute();
		assert_eq!(back.r#type, AttributeType::UINT16);
		assert_eq!(back.min.x, 3.0);
		assert_eq!(back.max.x, 4077.0);
	}

	#[test]
	fn test_histogram_emitted_for_single_byte_types() {
		let mut attribute = InternalAttribute::new("classification", 1, 1, 1, AttributeType::UINT8);
		attribute.histogram[2] = 17;

		let json = Attribute::from_attribute(&attribute);
		let histogram = json.histogram.expect("histogram for 1-byte attribute");
		assert_eq!(histogram.len(), 256);
		assert_eq!(histogram[2], 17);
	}

	#[test]
	fn test_metadata_serializes_with_camel_case_keys() {
		let metadata = Metadata {
			version: "2.0".to_string(),
			name: "test".to_string(),
			description: String::new(),
			points: 1234,
			projection: String::new(),
			hierarchy: Hierarchy {
				first_chunk_size: 110,
				step_size: 4,
				depth: 3,
			},
			offset: [0.0; 3],
			scale: [0.001; 3],
			spacing: 1.5,
			bounding_box: BoundingBoxJson {
				min: [0.0; 3],
				max: [1.0; 3],
			},
			encoding: Encoding::DEFAULT,
			attributes: Vec::new(),
		};

		let json = serde_json::to_string(&metadata).unwrap();
		assert!(json.contains("\"firstChunkSize\":110"));
		assert!(json.contains("\"boundingBox\""));
		assert!(json.contains("\"encoding\":\"DEFAULT\""));
	}
}

use crate::model::vector3::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttributeType {
	INT8 = 0,
	INT16 = 1,
	INT32 = 2,
	INT64 = 3,

	UINT8 = 10,
	UINT16 = 11,
	UINT32 = 12,
	UINT64 = 13,

	FLOAT = 20,
	DOUBLE = 21,

	UNDEFINED = 123456,
}

impl AttributeType {
	pub fn size(&self) -> i32 {
		match self {
			AttributeType::INT8 => 1,
			AttributeType::INT16 => 2,
			AttributeType::INT32 => 4,
			AttributeType::INT64 => 8,
			AttributeType::UINT8 => 1,
			AttributeType::UINT16 => 2,
			AttributeType::UINT32 => 4,
			AttributeType::UINT64 => 8,
			AttributeType::FLOAT => 4,
			AttributeType::DOUBLE => 8,
			AttributeType::UNDEFINED => 0,
		}
	}

	pub fn type_name(&self) -> &'static str {
		match self {
			AttributeType::INT8 => "int8",
			AttributeType::INT16 => "int16",
			AttributeType::INT32 => "int32",
			AttributeType::INT64 => "int64",
			AttributeType::UINT8 => "uint8",
			AttributeType::UINT16 => "uint16",
			AttributeType::UINT32 => "uint32",
			AttributeType::UINT64 => "uint64",
			AttributeType::FLOAT => "float",
			AttributeType::DOUBLE => "double",
			AttributeType::UNDEFINED => "undefined",
		}
	}

	pub fn from_type_name(name: &str) -> Option<AttributeType> {
		match name {
			"int8" => Some(AttributeType::INT8),
			"int16" => Some(AttributeType::INT16),
			"int32" => Some(AttributeType::INT32),
			"int64" => Some(AttributeType::INT64),
			"uint8" => Some(AttributeType::UINT8),
			"uint16" => Some(AttributeType::UINT16),
			"uint32" => Some(AttributeType::UINT32),
			"uint64" => Some(AttributeType::UINT64),
			"float" => Some(AttributeType::FLOAT),
			"double" => Some(AttributeType::DOUBLE),
			"undefined" => Some(AttributeType::UNDEFINED),
			_ => None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct Attribute {
	pub name: String,
	pub description: String,
	pub size: i32,
	pub num_elements: i32,
	pub element_size: i32,
	pub r#type: AttributeType,

	pub min: Vector3,
	pub max: Vector3,

	pub scale: Vector3,
	pub offset: Vector3,

	// occurrence counts per value, 1-byte types only
	pub histogram: Vec<i64>,
}

impl Attribute {
	pub fn new(
		name: &str,
		size: i32,
		num_elements: i32,
		element_size: i32,
		r#type: AttributeType,
	) -> Attribute {
		Attribute {
			name: name.to_string(),
			description: String::new(),
			size,
			num_elements,
			element_size,
			r#type,
			min: Vector3::infinity(),
			max: Vector3::infinity() * -1.0,
			scale: Vector3::new(1.0, 1.0, 1.0),
			offset: Vector3::empty(),
			histogram: vec![0; 256],
		}
	}
}

#[derive(Clone, Debug)]
pub struct Attributes {
	pub list: Vec<Attribute>,
	pub bytes: i32,

	pub pos_scale: Vector3,
	pub pos_offset: Vector3,
}

impl Attributes {
	pub fn from_attributes(attributes: Vec<Attribute>) -> Attributes {
		let bytes = attributes.iter().map(|a| a.size).sum();

		Attributes {
			bytes,
			pos_scale: Vector3::new(1.0, 1.0, 1.0),
			pos_offset: Vector3::empty(),
			list: attributes,
		}
	}

	pub fn get_offset(&self, name: &str) -> Option<i32> {
		let mut offset = 0;

		for attribute in &self.list {
			if attribute.name == name {
				return Some(offset);
			}

			offset += attribute.size;
		}

		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_record_stride_and_offsets() {
		let attributes = Attributes::from_attributes(vec![
			Attribute::new("position", 12, 3, 4, AttributeType::INT32),
			Attribute::new("intensity", 2, 1, 2, AttributeType::UINT16),
			Attribute::new("rgb", 6, 3, 2, AttributeType::UINT16),
		]);

		assert_eq!(attributes.bytes, 20);
		assert_eq!(attributes.get_offset("position"), Some(0));
		assert_eq!(attributes.get_offset("intensity"), Some(12));
		assert_eq!(attributes.get_offset("rgb"), Some(14));
		assert_eq!(attributes.get_offset("gps-time"), None);
	}

	#[test]
	fn test_type_name_round_trip() {
		let types = [
			AttributeType::INT8,
			AttributeType::UINT16,
			AttributeType::UINT64,
			AttributeType::FLOAT,
			AttributeType::DOUBLE,
		];

		for t in types {
			assert_eq!(AttributeType::from_type_name(t.type_name()), Some(t));
		}
	}
}

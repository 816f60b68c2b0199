use crate::model::vector3::Vector3;

#[derive(Clone, Debug)]
pub struct BoundingBox {
	pub min: Vector3,
	pub max: Vector3,
}

impl BoundingBox {
	pub fn new(min: Vector3, max: Vector3) -> BoundingBox {
		BoundingBox { min, max }
	}

	pub fn empty() -> BoundingBox {
		BoundingBox {
			min: Vector3::infinity(),
			max: Vector3::infinity() * -1.0,
		}
	}

	pub fn size(&self) -> Vector3 {
		&self.max - &self.min
	}

	/// Expands max so the box becomes a cube anchored at min. Child
	/// subdivision stays regular that way.
	pub fn cubic(&self) -> BoundingBox {
		let cube_size = self.size().max_component();

		BoundingBox {
			min: self.min.clone(),
			max: self.min.clone() + cube_size,
		}
	}
}

// child index bits: 0b100 = x, 0b010 = y, 0b001 = z
pub fn child_bounding_box_of(min: &Vector3, max: &Vector3, index: usize) -> BoundingBox {
	let mut bbox = BoundingBox::empty();
	let size = max - min;
	let center = min + &(size * 0.5);

	if (index & 0b100) == 0 {
		bbox.min.x = min.x;
		bbox.max.x = center.x;
	} else {
		bbox.min.x = center.x;
		bbox.max.x = max.x;
	}

	if (index & 0b010) == 0 {
		bbox.min.y = min.y;
		bbox.max.y = center.y;
	} else {
		bbox.min.y = center.y;
		bbox.max.y = max.y;
	}

	if (index & 0b001) == 0 {
		bbox.min.z = min.z;
		bbox.max.z = center.z;
	} else {
		bbox.min.z = center.z;
		bbox.max.z = max.z;
	}

	bbox
}

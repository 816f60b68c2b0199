//! Viewer page generation: copies the bundled page template next to the
//! converted point cloud and points it at the metadata.

use anyhow::{Context, Result};
use std::path::Path;

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
	std::fs::create_dir_all(to)?;

	for entry in std::fs::read_dir(from)? {
		let entry = entry?;
		let source = entry.path();
		let target = to.join(entry.file_name());

		if source.is_dir() {
			copy_dir_recursive(&source, &target)?;
		} else {
			std::fs::copy(&source, &target)?;
		}
	}

	Ok(())
}

pub fn generate_page(exe_dir: &Path, page_dir: &Path, page_name: &str, page_title: &str) -> Result<()> {
	let template_dir = exe_dir.join("resources/page_template");
	let template_source = template_dir.join("viewer_template.html");

	copy_dir_recursive(&template_dir, page_dir)
		.with_context(|| format!("copy page template from {}", template_dir.display()))?;

	let template = std::fs::read_to_string(&template_source)
		.with_context(|| format!("read page template {}", template_source.display()))?;

	std::fs::remove_file(page_dir.join("viewer_template.html")).ok();

	let pointcloud_template = r#"
	Potree.loadPointCloud("<!-- URL -->", "<!-- NAME -->", e => {
		let scene = viewer.scene;
		let pointcloud = e.pointcloud;

		let material = pointcloud.material;
		material.size = 1;
		material.pointSizeType = Potree.PointSizeType.ADAPTIVE;
		material.shape = Potree.PointShape.SQUARE;
		material.activeAttributeName = "rgba";

		scene.addPointCloud(pointcloud);

		viewer.fitToScreen();
	});
"#;

	let url = format!("./pointclouds/{}/metadata.json", page_name);

	let pointcloud = pointcloud_template
		.replace("<!-- URL -->", &url)
		.replace("<!-- NAME -->", page_name);
	let mut page = template.replace("<!-- INCLUDE POINTCLOUD -->", &pointcloud);

	if !page_title.is_empty() {
		page = page.replace("<!-- TITLE -->", page_title);
	}

	let page_path = page_dir.join(format!("{}.html", page_name));
	std::fs::write(&page_path, page)
		.with_context(|| format!("write page {}", page_path.display()))?;

	Ok(())
}

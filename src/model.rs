use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub mod attributes;
pub mod bounds;
pub mod metadata;
pub mod options;
pub mod vector3;

/// Shared conversion progress, read by the monitor thread and the final
/// report while the pipeline updates it.
pub struct State {
	pub name: Mutex<String>,
	pub current_pass: AtomicU64,
	pub num_passes: u64,

	pub points_total: AtomicU64,
	pub points_processed: AtomicU64,
	pub bytes_in_memory: AtomicU64,

	pub started: Instant,
}

impl State {
	pub fn new() -> State {
		State {
			name: Mutex::new(String::new()),
			current_pass: AtomicU64::new(0),
			num_passes: 3,
			points_total: AtomicU64::new(0),
			points_processed: AtomicU64::new(0),
			bytes_in_memory: AtomicU64::new(0),
			started: Instant::now(),
		}
	}

	pub fn begin_pass(&self, name: &str, pass: u64) {
		*self.name.lock().unwrap() = name.to_string();
		self.current_pass.store(pass, Ordering::Relaxed);
		self.points_processed.store(0, Ordering::Relaxed);
	}

	pub fn progress(&self) -> f64 {
		let total = self.points_total.load(Ordering::Relaxed);
		if total == 0 {
			return 0.0;
		}

		self.points_processed.load(Ordering::Relaxed) as f64 / total as f64
	}
}

//! Background thread printing a progress line once per second.

use crate::model::State;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Monitor {
	stop_requested: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl Monitor {
	pub fn start(state: Arc<State>) -> Monitor {
		let stop_requested = Arc::new(AtomicBool::new(false));
		let stop = Arc::clone(&stop_requested);

		let handle = std::thread::spawn(move || {
			std::thread::sleep(Duration::from_secs(1));

			while !stop.load(Ordering::Relaxed) {
				print_line(&state);
				std::thread::sleep(Duration::from_secs(1));
			}
		});

		Monitor {
			stop_requested,
			handle: Some(handle),
		}
	}

	pub fn stop(mut self) {
		self.stop_requested.store(true, Ordering::Relaxed);
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

fn print_line(state: &State) {
	const GB: f64 = 1024.0 * 1024.0 * 1024.0;

	let duration = state.started.elapsed().as_secs_f64();
	let processed = state.points_processed.load(Ordering::Relaxed);
	let throughput = (processed as f64 / duration.max(1e-9)) / 1_000_000.0;

	let pass_progress = 100.0 * state.progress();
	let current_pass = state.current_pass.load(Ordering::Relaxed);
	let total_progress =
		(100.0 * current_pass.saturating_sub(1) as f64 + pass_progress) / state.num_passes as f64;

	let name = state.name.lock().unwrap().clone();
	let in_memory = state.bytes_in_memory.load(Ordering::Relaxed) as f64 / GB;

	println!(
		"[{:5.1}%, {:.0}s], [{}: {:5.1}%, throughput: {:.1}MPs][buffers: {:.1}GB]",
		total_progress, duration, name, pass_progress, throughput, in_memory
	);
}

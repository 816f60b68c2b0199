//! Append-only writer for `octree.bin`. Producers reserve a byte range
//! with an atomic fetch-add, copy their encoded node into the active
//! buffer and move on; a detached thread drains full buffers to disk.
//! `backlog_size_mb` is the producers' backpressure signal.

use crate::indexing::compression::compress;
use crate::indexing::model::Node;
use crate::logger;
use crate::model::attributes::Attributes;
use crate::model::options::Encoding;
use crate::model::State;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const INITIAL_CAPACITY: usize = 16 * 1024 * 1024;

struct Buffers {
	active: Vec<u8>,
	capacity: usize,
	backlog: VecDeque<Vec<u8>>,
	close_requested: bool,
	closed: bool,
}

struct Shared {
	buffers: Mutex<Buffers>,
	drained: Condvar,
	byte_offset: AtomicI64,
}

pub struct Writer {
	shared: Arc<Shared>,
}

impl Writer {
	pub fn new(octree_path: &Path, state: Arc<State>) -> Writer {
		let file = match File::create(octree_path) {
			Ok(file) => file,
			Err(error) => logger::fatal(&format!(
				"failed to create {}: {}",
				octree_path.display(),
				error
			)),
		};

		let shared = Arc::new(Shared {
			buffers: Mutex::new(Buffers {
				active: Vec::with_capacity(INITIAL_CAPACITY),
				capacity: INITIAL_CAPACITY,
				backlog: VecDeque::new(),
				close_requested: false,
				closed: false,
			}),
			drained: Condvar::new(),
			byte_offset: AtomicI64::new(0),
		});

		launch_writer_thread(Arc::clone(&shared), file, state);

		Writer { shared }
	}

	pub fn backlog_size_mb(&self) -> i64 {
		let buffers = self.shared.buffers.lock().unwrap();
		let backlog_bytes = buffers.backlog.len() * buffers.capacity;

		(backlog_bytes / (1024 * 1024)) as i64
	}

	/// Encodes the node's points, reserves a byte range in `octree.bin`
	/// and drops the point buffer.
	pub fn write_and_unload(&self, node: &mut Node, attributes: &Attributes, encoding: Encoding) {
		if node.num_points == 0 {
			node.points = None;
			return;
		}

		let source = match encoding {
			Encoding::BROTLI => {
				let points = node.points.as_deref().unwrap_or(&[]);
				match compress(points, node.num_points, attributes) {
					Ok(compressed) => compressed,
					Err(error) => logger::fatal(&format!(
						"failed to compress node {}. aborting conversion. {}",
						node.name, error
					)),
				}
			}
			Encoding::DEFAULT => node.points.take().unwrap_or_default(),
		};

		let byte_size = source.len();
		node.byte_size = byte_size as i64;
		node.byte_offset = self
			.shared
			.byte_offset
			.fetch_add(byte_size as i64, Ordering::SeqCst);

		{
			let mut buffers = self.shared.buffers.lock().unwrap();

			if buffers.active.len() + byte_size > buffers.capacity {
				let capacity = buffers.capacity.max(byte_size);
				let full = std::mem::replace(&mut buffers.active, Vec::with_capacity(capacity));
				buffers.capacity = capacity;
				buffers.backlog.push_back(full);
			}

			buffers.active.extend_from_slice(&source);
		}

		node.points = None;
	}

	/// Flushes the active buffer and blocks until the writer thread has
	/// drained the backlog and quit.
	pub fn close_and_wait(&self) {
		let mut buffers = self.shared.buffers.lock().unwrap();
		if buffers.closed {
			return;
		}

		if !buffers.active.is_empty() {
			let remaining = std::mem::take(&mut buffers.active);
			buffers.backlog.push_back(remaining);
		}
		buffers.close_requested = true;

		while !buffers.closed {
			buffers = self.shared.drained.wait(buffers).unwrap();
		}
	}
}

fn launch_writer_thread(shared: Arc<Shared>, mut file: File, state: Arc<State>) {
	std::thread::spawn(move || loop {
		let buffer = {
			let mut buffers = shared.buffers.lock().unwrap();

			match buffers.backlog.pop_front() {
				Some(buffer) => Some(buffer),
				None if buffers.close_requested => {
					buffers.closed = true;
					shared.drained.notify_all();
					return;
				}
				None => None,
			}
		};

		match buffer {
			Some(buffer) => {
				if let Err(error) = file.write_all(&buffer) {
					logger::fatal(&format!("failed to write octree.bin: {}", error));
				}

				let written = buffer.len() as u64;
				let in_memory = &state.bytes_in_memory;
				let _ = in_memory.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
					Some(v.saturating_sub(written))
				});
			}
			None => std::thread::sleep(Duration::from_millis(10)),
		}
	});
}

//! Fixed-size worker pool for the per-chunk indexing tasks. Workers block
//! on a shared queue; `close` waits until every queued task has finished.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct Shared<T> {
	queue: Mutex<TaskQueue<T>>,
	work_available: Condvar,
}

struct TaskQueue<T> {
	tasks: VecDeque<T>,
	closed: bool,
}

pub struct TaskPool<T> {
	shared: Arc<Shared<T>>,
	workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> TaskPool<T> {
	pub fn new<F>(num_threads: usize, handler: F) -> TaskPool<T>
	where
		F: Fn(T) + Send + Sync + 'static,
	{
		let shared = Arc::new(Shared {
			queue: Mutex::new(TaskQueue {
				tasks: VecDeque::new(),
				closed: false,
			}),
			work_available: Condvar::new(),
		});

		let handler = Arc::new(handler);

		let workers = (0..num_threads.max(1))
			.map(|_| {
				let shared = Arc::clone(&shared);
				let handler = Arc::clone(&handler);

				std::thread::spawn(move || loop {
					let task = {
						let mut queue = shared.queue.lock().unwrap();

						loop {
							if let Some(task) = queue.tasks.pop_front() {
								break task;
							}
							if queue.closed {
								return;
							}

							queue = shared.work_available.wait(queue).unwrap();
						}
					};

					handler(task);
				})
			})
			.collect();

		TaskPool { shared, workers }
	}

	pub fn add_task(&self, task: T) {
		let mut queue = self.shared.queue.lock().unwrap();
		queue.tasks.push_back(task);
		self.shared.work_available.notify_one();
	}

	/// Closes the queue and blocks until all workers have drained it.
	pub fn close(self) {
		{
			let mut queue = self.shared.queue.lock().unwrap();
			queue.closed = true;
		}
		self.shared.work_available.notify_all();

		for worker in self.workers {
			// a panicking task already poisoned the run; surface it
			worker.join().expect("indexing worker panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU64, Ordering};

	#[test]
	fn test_all_tasks_run_before_close_returns() {
		let sum = Arc::new(AtomicU64::new(0));

		let pool = {
			let sum = Arc::clone(&sum);
			TaskPool::new(4, move |value: u64| {
				sum.fetch_add(value, Ordering::Relaxed);
			})
		};

		for i in 1..=100 {
			pool.add_task(i);
		}
		pool.close();

		assert_eq!(sum.load(Ordering::Relaxed), 5050);
	}
}

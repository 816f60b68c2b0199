//! Log sink behind the `log` facade: every record goes to stderr, and to
//! `<outdir>/log.txt` once the output directory is known.

use anyhow::{Context, Result};
use log::{LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
static STARTED: Mutex<Option<Instant>> = Mutex::new(None);

struct ConverterLogger;

static LOGGER: ConverterLogger = ConverterLogger;

impl log::Log for ConverterLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let elapsed = STARTED
			.lock()
			.unwrap()
			.map(|started| started.elapsed().as_secs_f64())
			.unwrap_or(0.0);

		let line = format!("[{:9.3}s][{}] {}", elapsed, record.level(), record.args());

		eprintln!("{}", line);

		if let Some(file) = LOG_FILE.lock().unwrap().as_mut() {
			// a broken log file must not take down the conversion
			let _ = writeln!(file, "{}", line);
		}
	}

	fn flush(&self) {
		if let Some(file) = LOG_FILE.lock().unwrap().as_mut() {
			let _ = file.flush();
		}
	}
}

pub fn init() {
	*STARTED.lock().unwrap() = Some(Instant::now());

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(LevelFilter::Info);
	}
}

/// Logs an unrecoverable error and terminates with the conversion's
/// failure exit code.
pub fn fatal(message: &str) -> ! {
	log::error!("{}", message);
	log::logger().flush();
	std::process::exit(123);
}

pub fn add_output_file(path: &Path) -> Result<()> {
	let file = OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.with_context(|| format!("open log file {}", path.display()))?;

	*LOG_FILE.lock().unwrap() = Some(file);

	Ok(())
}

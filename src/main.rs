mod chunking;
mod indexing;
mod logger;
mod model;
mod monitor;
mod morton;
mod page;
mod pool;
mod pyramid;
mod sampling;
mod source;

use crate::model::options::{ChunkMethod, Encoding, Options, SamplingMethod};
use crate::model::State;
use crate::monitor::Monitor;
use crate::source::{compute_output_attributes, compute_stats, curate_sources, describe_attributes};
use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
	name = "rusty-octree-converter",
	about = "Converts LAS/LAZ point clouds into a streamable multi-resolution octree"
)]
struct Args {
	/// Input files or directories
	#[arg(short = 'i', long = "source", num_args = 1..)]
	source: Vec<String>,

	/// Output directory
	#[arg(short = 'o', long)]
	outdir: Option<String>,

	/// Per-node encoding: "BROTLI" or "DEFAULT" (uncompressed)
	#[arg(long, default_value = "DEFAULT")]
	encoding: String,

	/// Point sampling method: "poisson", "poisson_average", "random"
	#[arg(short = 'm', long, default_value = "poisson")]
	method: String,

	/// Chunking method: "LASZIP", "LAS_CUSTOM", "SKIP"
	#[arg(long = "chunkMethod", default_value = "LASZIP")]
	chunk_method: String,

	/// Skip deleting the chunks/ directory after indexing
	#[arg(long = "keep-chunks")]
	keep_chunks: bool,

	/// Disable the chunking phase
	#[arg(long = "no-chunking")]
	no_chunking: bool,

	/// Disable the indexing phase
	#[arg(long = "no-indexing")]
	no_indexing: bool,

	/// Attributes to keep in the output (position is always included)
	#[arg(long, num_args = 0..)]
	attributes: Vec<String>,

	/// Projection string, stored verbatim in the metadata
	#[arg(long, default_value = "")]
	projection: String,

	/// Generate a ready to use web page with the given name
	#[arg(short = 'p', long = "generate-page")]
	generate_page: Option<String>,

	/// Page title used when generating a web page
	#[arg(long, default_value = "")]
	title: String,
}

fn derive_outdir(source: &str) -> String {
	let path = Path::new(source);

	if !path.exists() {
		logger::fatal(&format!("file does not exist: {}", source));
	}

	let stem = path
		.file_stem()
		.and_then(|s| s.to_str())
		.unwrap_or("pointcloud");
	let suggested = format!("{}_converted", stem);

	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	let mut outdir = parent.join(&suggested);

	let mut i = 1;
	while outdir.exists() {
		outdir = parent.join(format!("{}_{}", suggested, i));

		if i > 100 {
			logger::fatal(&format!(
				"unsuccessfully tried to find an empty output directory. stopped at 100 iterations: {}",
				outdir.display()
			));
		}

		i += 1;
	}

	outdir.to_str().unwrap_or(source).to_string()
}

fn parse_options(args: Args) -> Options {
	if args.source.is_empty() {
		eprintln!("rusty-octree-converter <source> -o <outdir>");
		eprintln!();
		eprintln!("For a list of options, use --help or -h");
		std::process::exit(1);
	}

	let encoding = match args.encoding.as_str() {
		"BROTLI" => Encoding::BROTLI,
		"DEFAULT" | "UNCOMPRESSED" => Encoding::DEFAULT,
		other => logger::fatal(&format!("unknown encoding: {}", other)),
	};

	let method = match args.method.as_str() {
		"poisson" => SamplingMethod::Poisson,
		"poisson_average" => SamplingMethod::PoissonAverage,
		"random" => SamplingMethod::Random,
		other => logger::fatal(&format!("unknown sampling method: {}", other)),
	};

	let chunk_method = match args.chunk_method.as_str() {
		"LASZIP" => ChunkMethod::Laszip,
		"LAS_CUSTOM" => ChunkMethod::LasCustom,
		"SKIP" => ChunkMethod::Skip,
		other => logger::fatal(&format!("unknown chunk method: {}", other)),
	};

	let outdir = match args.outdir {
		Some(outdir) => outdir,
		None => derive_outdir(&args.source[0]),
	};

	Options {
		source: args.source,
		outdir,
		name: String::new(),
		encoding,
		method,
		chunk_method,
		attributes: args.attributes,
		projection: args.projection,
		generate_page: args.generate_page.is_some(),
		page_name: args.generate_page.unwrap_or_default(),
		page_title: args.title,
		keep_chunks: args.keep_chunks,
		no_chunking: args.no_chunking,
		no_indexing: args.no_indexing,
	}
}

fn create_report(
	options: &Options,
	num_sources: usize,
	total_points: u64,
	total_bytes: u64,
	target_dir: &Path,
	started: Instant,
) {
	let duration = started.elapsed().as_secs_f64();
	let throughput_mb = (total_bytes as f64 / duration) / (1024.0 * 1024.0);
	let throughput_points = (total_points as f64 / duration) / 1_000_000.0;

	println!();
	println!("=======================================");
	println!("=== STATS                              ");
	println!("=======================================");
	println!("#points:               {}", total_points);
	println!("#input files:          {}", num_sources);
	println!("sampling method:       {:?}", options.method);
	println!("duration:              {:.3}s", duration);
	println!("throughput (MB/s):     {:.1}MB", throughput_mb);
	println!("throughput (points/s): {:.1}M", throughput_points);
	println!("output location:       {}", target_dir.display());
}

fn run(mut options: Options) -> Result<()> {
	let started = Instant::now();

	let curated = curate_sources(&options.source)?;
	if options.name.is_empty() {
		options.name = curated.name.clone();
	}

	if curated.files.is_empty() {
		logger::fatal("no LAS/LAZ input files found");
	}

	let output_attributes = compute_output_attributes(&curated.files, &options.attributes)?;
	log::info!("{}", describe_attributes(&output_attributes));

	let stats = match compute_stats(&curated.files) {
		Ok(stats) => stats,
		Err(error) => logger::fatal(&error.to_string()),
	};

	let mut target_dir = PathBuf::from(&options.outdir);
	if options.generate_page {
		let exe_dir = std::env::current_exe()
			.ok()
			.and_then(|p| p.parent().map(|p| p.to_path_buf()))
			.unwrap_or_else(|| PathBuf::from("."));

		if let Err(error) =
			page::generate_page(&exe_dir, &target_dir, &options.page_name, &options.page_title)
		{
			log::error!("{:#}", error);
		}

		target_dir = target_dir.join("pointclouds").join(&options.page_name);
	}

	log::info!("target directory: '{}'", target_dir.display());
	std::fs::create_dir_all(&target_dir)?;
	logger::add_output_file(&target_dir.join("log.txt"))?;

	let state = Arc::new(State::new());
	state
		.points_total
		.store(stats.total_points, Ordering::Relaxed);

	let monitor = Monitor::start(Arc::clone(&state));

	if !options.no_chunking {
		match options.chunk_method {
			ChunkMethod::Laszip | ChunkMethod::LasCustom => {
				chunking::chunker::do_chunking(
					&curated.files,
					&target_dir,
					&stats.min,
					&stats.max,
					&state,
					&output_attributes,
				)?;
			}
			ChunkMethod::Skip => {}
		}
	}

	if !options.no_indexing {
		let sampler: Arc<dyn sampling::Sampler> = Arc::from(sampling::create_sampler(options.method));
		indexing::indexing::do_indexing(&target_dir, Arc::clone(&state), &options, sampler)?;
	}

	monitor.stop();

	create_report(
		&options,
		curated.files.len(),
		stats.total_points,
		stats.total_bytes,
		&target_dir,
		started,
	);

	Ok(())
}

fn main() {
	logger::init();

	let args = Args::parse();
	let options = parse_options(args);

	if let Err(error) = run(options) {
		logger::fatal(&format!("{:#}", error));
	}
}

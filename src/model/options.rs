use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
pub enum Encoding {
	DEFAULT,
	BROTLI,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SamplingMethod {
	Poisson,
	PoissonAverage,
	Random,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChunkMethod {
	Laszip,
	LasCustom,
	Skip,
}

#[derive(Clone, Debug)]
pub struct Options {
	pub source: Vec<String>,
	pub outdir: String,
	pub name: String,
	pub encoding: Encoding,
	pub method: SamplingMethod,
	pub chunk_method: ChunkMethod,
	pub attributes: Vec<String>,
	pub projection: String,

	pub generate_page: bool,
	pub page_name: String,
	pub page_title: String,

	pub keep_chunks: bool,
	pub no_chunking: bool,
	pub no_indexing: bool,
}

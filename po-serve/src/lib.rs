//! po-serve: the advisor's two transports over one session store, and the driver that picks one.
//!
//! - duplex loop: a single implicit session over a pipe pair or a child's stdio
//! - remote call: `get_advice` over TCP/UDS, one session per connection

pub mod advisor;
pub mod channel;
pub mod client;
pub mod driver;
pub mod duplex;
pub mod error;
pub mod remote;
pub mod server;

pub use advisor::Advisor;
pub use channel::{open_pipes, pipe_paths, Channel, CompilerProcess};
pub use client::AdviceClient;
pub use driver::{manifest_path, InferenceDriver, EXPORT_SAMPLE_SEED};
pub use duplex::{DuplexLoop, LoopEnd, LoopSummary, DUPLEX_SESSION};
pub use error::ServeError;
pub use remote::AdviceService;
pub use server::{AdviceServer, Stream};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Test support for code built on this crate.
//!
//! - **Fixtures**: generated event and profile records of a chosen size
//! - **Probes**: [`MemoryProbe`](crate::backpressure::MemoryProbe)
//!   implementations with fixed or scripted readings, to drive the throttle
//!   deterministically
//! - **Mock I/O**: temporary directories and writers for every input format
//!
//! # Quick Start
//!
//! ```no_run
//! use bulkflow::testing::*;
//! use bulkflow::{Pipeline, RunConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let dir = TempDirPath::new()?;
//! let path = write_jsonl(&dir.file_path("events.jsonl"), &events(250))?;
//!
//! let config = RunConfig { dry_run: true, ..RunConfig::default() };
//! let summary = Pipeline::new(config).run(path).await?;
//! assert_eq!(summary.counters.success, 250);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod mock_io;
pub mod probes;

pub use fixtures::*;
pub use mock_io::*;
pub use probes::*;

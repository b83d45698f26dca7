//! Speaker-embedding table export.
//!
//! Converts a serialized speaker table (`spk2info.pt`, a mapping from
//! speaker id to an embedding or to a record holding one) into the JSON
//! file that the TTS runtime reads:
//!
//! ```json
//! {
//!   "<speaker_id>": { "embedding": [0.1, 0.2] }
//! }
//! ```
//!
//! The pipeline is [`load_entries`] → [`resolve`] → [`write_table`], wrapped
//! by [`export`]. PyTorch checkpoints are decoded without executing any
//! pickle code; see [`loader`] for the trust boundary.
//!
//! # Features
//!
//! - `torch` (default): read PyTorch zip and legacy checkpoints. Without it,
//!   those inputs fail with [`ExportError::MissingDependency`] while JSON and
//!   plain pickle inputs still work.

mod error;
mod export;
pub mod loader;
pub mod normalize;
pub mod pickle;
pub mod reader;
pub mod table;
#[cfg(feature = "torch")]
pub mod torch;
pub mod value;
pub mod writer;

pub use error::ExportError;
pub use export::{ExportOptions, ExportSummary, export};
pub use loader::{InputFormat, LoadedTable, SourceFormat, load_entries};
pub use normalize::normalize;
pub use pickle::PickleError;
pub use reader::read_table;
pub use table::{ErrorPolicy, SpeakerInfo, SpeakerTable, resolve, speaker_id};
pub use value::{DType, Tensor, Value};
pub use writer::write_table;

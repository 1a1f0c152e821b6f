//! # SST Derivation Pipeline
//!
//! The deterministic, vision-only pipeline that turns raw captured frames
//! into derived screen-state records:
//!
//! 1. normalize the frame (dimensions, SHA-256, DCT perceptual hash)
//! 2. temporal segmentation against the previous frame
//! 3. always persist a `derived.sst.frame` trace
//! 4. on a state boundary, run the heavy pass: tiling, OCR aggregation,
//!    layout, tables/spreadsheets/code/charts, the UI element graph,
//!    stable-ID matching, delta and action inference, compliance redaction
//! 5. persist the state bundle with full provenance envelopes
//!
//! Every sort breaks ties on stable IDs; given identical inputs and
//! identical provider outputs, the pipeline produces bit-identical derived
//! records.

mod action;
mod compliance;
mod config;
mod delta;
mod elements;
mod error;
mod extract;
mod frame;
mod layout;
mod matching;
mod ocr;
mod persist;
mod pipeline;
mod pool;
mod providers;
mod segment;
mod state;
mod types;
mod util;

pub use action::infer_action;
pub use compliance::{redact_artifacts, RedactionMetrics};
pub use config::{config_hash, SstConfig};
pub use delta::build_delta;
pub use elements::{parse_ui_elements, track_cursor};
pub use error::SstError;
pub use extract::{extract_charts, extract_code_blocks, extract_spreadsheets, extract_tables};
pub use frame::{normalize_image, perceptual_hash, tile_image, NormalizedImage, Patch};
pub use layout::assemble_layout;
pub use matching::match_ids;
pub use ocr::{run_ocr_tokens, vlm_tokens};
pub use persist::{IndexTextFn, PersistStats, SstPersistence};
pub use pipeline::{SstPipeline, SstPipelineResult};
pub use pool::{DerivationJob, DerivationPool};
pub use providers::{ExtractorRegistry, RawToken, RunLimits, TextExtractor};
pub use segment::{decide_boundary, SegmentDecision};
pub use state::build_state;
pub use types::*;

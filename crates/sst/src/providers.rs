//! Text-extraction capability seam.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::SstError;
use crate::util::BBox;

/// Provider output token, in patch-local coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken {
    pub text: String,
    pub bbox: Option<BBox>,
    pub confidence_bp: i64,
}

/// OCR / vision model seam. Implementations wrap real engines; the
/// pipeline never talks to model runtimes directly.
///
/// Providers that cannot localize tokens implement only [`extract_text`];
/// the aggregator approximates per-word boxes from the patch geometry.
///
/// [`extract_text`]: TextExtractor::extract_text
pub trait TextExtractor: Send + Sync {
    /// Localized tokens for a patch. The default signals "unsupported" by
    /// returning an empty list.
    fn extract_tokens(&self, _image_png: &[u8]) -> Result<Vec<RawToken>, SstError> {
        Ok(Vec::new())
    }

    /// Plain text for a patch.
    fn extract_text(&self, image_png: &[u8]) -> Result<String, SstError>;
}

/// Providers keyed by id; iteration order is the sorted id order, which is
/// part of the determinism contract.
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    providers: BTreeMap<String, Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider_id: impl Into<String>, provider: Arc<dyn TextExtractor>) {
        self.providers.insert(provider_id.into(), provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn TextExtractor>)> {
        self.providers.iter().map(|(id, p)| (id.as_str(), p))
    }
}

/// Cooperative cancellation: an abort predicate plus an optional deadline,
/// checked between pipeline stages and before every provider call.
#[derive(Clone, Default)]
pub struct RunLimits {
    pub should_abort: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    pub deadline: Option<Instant>,
}

impl RunLimits {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aborted(&self) -> bool {
        self.should_abort.as_ref().is_some_and(|f| f())
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err` with the matching variant when the run should stop.
    pub fn check(&self) -> Result<(), SstError> {
        if self.aborted() {
            return Err(SstError::Aborted);
        }
        if self.past_deadline() {
            return Err(SstError::DeadlineExceeded);
        }
        Ok(())
    }
}

//! Bounded worker pool for derivation.
//!
//! Jobs are grouped by run: frames of one run are processed in capture
//! order by a single worker (temporal segmentation depends on the previous
//! frame), while different runs proceed in parallel up to the CPU cap.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::pipeline::{SstPipeline, SstPipelineResult};
use crate::providers::RunLimits;

/// One frame to derive.
pub struct DerivationJob {
    pub record_id: String,
    pub record: Value,
    pub frame_bytes: Vec<u8>,
    pub allow_ocr: bool,
    pub allow_vlm: bool,
}

/// Bounded pool over an [`SstPipeline`].
pub struct DerivationPool {
    pipeline: Arc<SstPipeline>,
    cpu_workers: usize,
}

impl DerivationPool {
    pub fn new(pipeline: Arc<SstPipeline>, cpu_workers: usize) -> Self {
        Self {
            pipeline,
            cpu_workers: cpu_workers.max(1),
        }
    }

    /// Process a batch of jobs. Returns results in job order. Honors the
    /// shared abort/deadline between jobs; already-finished work is kept.
    pub fn process_batch(
        &self,
        jobs: Vec<DerivationJob>,
        limits: &RunLimits,
    ) -> Vec<Option<SstPipelineResult>> {
        let total = jobs.len();
        // Group job indices by run, preserving capture order within a run.
        let mut by_run: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, job) in jobs.iter().enumerate() {
            let run = job
                .record_id
                .split('/')
                .next()
                .unwrap_or(&job.record_id)
                .to_string();
            by_run.entry(run).or_default().push(idx);
        }
        let queue: Mutex<Vec<Vec<usize>>> = Mutex::new(by_run.into_values().collect());
        let jobs = Arc::new(jobs);
        let results: Mutex<Vec<Option<SstPipelineResult>>> = Mutex::new((0..total).map(|_| None).collect());

        let workers = self.cpu_workers.min(total.max(1));
        std::thread::scope(|scope| {
            for worker in 0..workers {
                let pipeline = self.pipeline.clone();
                let jobs = jobs.clone();
                let queue = &queue;
                let results = &results;
                let limits = limits.clone();
                scope.spawn(move || loop {
                    if limits.aborted() || limits.past_deadline() {
                        debug!(worker, "derivation worker stopping early");
                        return;
                    }
                    let group = {
                        let mut queue = queue.lock().expect("pool queue");
                        queue.pop()
                    };
                    let Some(group) = group else {
                        return;
                    };
                    for idx in group {
                        if limits.aborted() || limits.past_deadline() {
                            return;
                        }
                        let job = &jobs[idx];
                        let result = pipeline.process_record(
                            &job.record_id,
                            &job.record,
                            &job.frame_bytes,
                            job.allow_ocr,
                            job.allow_vlm,
                            &limits,
                        );
                        results.lock().expect("pool results")[idx] = Some(result);
                    }
                });
            }
        });
        results.into_inner().expect("pool results")
    }
}

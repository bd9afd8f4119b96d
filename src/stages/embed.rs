//! `embed`: chunk text into vectors.
//!
//! Batches go to the provider as whole requests of at most
//! `embedding.batch_size` texts. A failed request fails every unit it
//! carried; those units stay out of the ledger and are retried next run.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{HashingError, ProcessingError, Result};
use crate::hashing::ensure_finite;
use crate::models::{ChunkRecord, EmbeddingRecord};
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::{CHUNK, EMBED};

pub struct EmbedStage {
    provider: Arc<dyn EmbeddingProvider>,
    request_size: usize,
}

impl EmbedStage {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, request_size: usize) -> Self {
        Self {
            provider,
            request_size: request_size.max(1),
        }
    }

    fn record(&self, unit: &Unit<ChunkRecord>, vector: Vec<f32>) -> UnitResult<EmbeddingRecord> {
        ensure_finite(&vector).map_err(|e| ProcessingError::new(&unit.hash, e))?;
        Ok(vec![EmbeddingRecord {
            chunk_hash: unit.content.chunk_hash.clone(),
            model: self.provider.model_name().to_string(),
            vector,
        }])
    }
}

#[async_trait]
impl AppendStage for EmbedStage {
    type Input = ChunkRecord;
    type Output = EmbeddingRecord;

    fn name(&self) -> &'static str {
        EMBED
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<ChunkRecord>> {
        ctx.read_committed_records(CHUNK)
    }

    /// Chunk hashes already cover chat, position and text.
    fn identity(&self, chunk: &ChunkRecord) -> std::result::Result<String, HashingError> {
        Ok(chunk.chunk_hash.clone())
    }

    async fn process(
        &self,
        _ctx: &StageContext,
        unit: &Unit<ChunkRecord>,
    ) -> UnitResult<EmbeddingRecord> {
        let vector = embed_one(self.provider.as_ref(), &unit.content.text)
            .await
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        self.record(unit, vector)
    }

    async fn process_batch(
        &self,
        _ctx: &StageContext,
        units: &[Unit<ChunkRecord>],
    ) -> Result<Vec<UnitResult<EmbeddingRecord>>> {
        let mut results = Vec::with_capacity(units.len());
        for request in units.chunks(self.request_size) {
            let texts: Vec<String> = request.iter().map(|u| u.content.text.clone()).collect();
            match self.provider.embed(&texts).await {
                Ok(vectors) if vectors.len() == request.len() => {
                    for (unit, vector) in request.iter().zip(vectors) {
                        results.push(self.record(unit, vector));
                    }
                }
                Ok(vectors) => {
                    warn!(
                        expected = request.len(),
                        got = vectors.len(),
                        "Embedding response size mismatch"
                    );
                    results.extend(request.iter().map(|u| {
                        Err(ProcessingError::new(
                            &u.hash,
                            format!(
                                "provider returned {} vectors for {} texts",
                                vectors.len(),
                                request.len()
                            ),
                        ))
                    }));
                }
                Err(e) => {
                    results.extend(
                        request
                            .iter()
                            .map(|u| Err(ProcessingError::new(&u.hash, &e))),
                    );
                }
            }
        }
        Ok(results)
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    fn output_key(&self, record: &EmbeddingRecord) -> Option<String> {
        Some(format!("{}:{}", record.model, record.chunk_hash))
    }
}

//! `tag`: topical tags per chunk.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{HashingError, ProcessingError, Result};
use crate::llm::Annotator;
use crate::models::{ChunkRecord, TagRecord};
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::{CHUNK, TAG};

pub struct TagStage {
    annotator: Arc<dyn Annotator>,
    max_tags: usize,
}

impl TagStage {
    pub fn new(annotator: Arc<dyn Annotator>, max_tags: usize) -> Self {
        Self {
            annotator,
            max_tags,
        }
    }
}

#[async_trait]
impl AppendStage for TagStage {
    type Input = ChunkRecord;
    type Output = TagRecord;

    fn name(&self) -> &'static str {
        TAG
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<ChunkRecord>> {
        ctx.read_committed_records(CHUNK)
    }

    fn identity(&self, chunk: &ChunkRecord) -> std::result::Result<String, HashingError> {
        Ok(chunk.chunk_hash.clone())
    }

    async fn process(&self, _ctx: &StageContext, unit: &Unit<ChunkRecord>) -> UnitResult<TagRecord> {
        let tags = self
            .annotator
            .tags(&unit.content.text, self.max_tags)
            .await
            .map_err(|e| ProcessingError::new(&unit.hash, e))?;
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TagRecord {
            chunk_hash: unit.content.chunk_hash.clone(),
            tags,
        }])
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    fn output_key(&self, record: &TagRecord) -> Option<String> {
        Some(record.chunk_hash.clone())
    }
}

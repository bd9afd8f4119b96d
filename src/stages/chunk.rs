//! `chunk`: chats into message chunks.

use async_trait::async_trait;

use crate::chunk::chunk_chat;
use crate::error::{HashingError, ProcessingError, Result};
use crate::hashing::identity_hash;
use crate::models::{Chat, ChunkRecord};
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::{CHUNK, INGEST};

pub struct ChunkStage {
    max_tokens: usize,
    min_chars: usize,
}

impl ChunkStage {
    pub fn new(max_tokens: usize, min_chars: usize) -> Self {
        Self {
            max_tokens,
            min_chars,
        }
    }
}

#[async_trait]
impl AppendStage for ChunkStage {
    type Input = Chat;
    type Output = ChunkRecord;

    fn name(&self) -> &'static str {
        CHUNK
    }

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<Chat>> {
        ctx.read_committed_records(INGEST)
    }

    fn identity(&self, chat: &Chat) -> std::result::Result<String, HashingError> {
        identity_hash(&chat.messages)
    }

    async fn process(&self, _ctx: &StageContext, unit: &Unit<Chat>) -> UnitResult<ChunkRecord> {
        chunk_chat(&unit.content, self.max_tokens, self.min_chars)
            .map_err(|e| ProcessingError::new(&unit.hash, e))
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    fn output_key(&self, chunk: &ChunkRecord) -> Option<String> {
        Some(chunk.chunk_hash.clone())
    }
}

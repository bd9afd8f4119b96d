//! `ingest`: raw export files into normalized chats.

use async_trait::async_trait;

use crate::config::IngestConfig;
use crate::error::{HashingError, Result};
use crate::hashing::hash_value;
use crate::import::{parse_export, scan_exports, ExportFile};
use crate::models::Chat;
use crate::stage::{AppendStage, StageContext, Unit, UnitResult};

use super::INGEST;

pub struct IngestStage {
    config: IngestConfig,
}

impl IngestStage {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AppendStage for IngestStage {
    type Input = ExportFile;
    type Output = Chat;

    fn name(&self) -> &'static str {
        INGEST
    }

    fn load_inputs(&self, _ctx: &StageContext) -> Result<Vec<ExportFile>> {
        scan_exports(&self.config)
    }

    /// The parsed file content only; moving or renaming a file does not
    /// make it new. A file that could not be parsed has no identity and is
    /// counted as a hash error on every run until it is fixed.
    fn identity(&self, input: &ExportFile) -> std::result::Result<String, HashingError> {
        if let Some(reason) = &input.error {
            return Err(HashingError::Unreadable(format!(
                "{}: {}",
                input.source_file, reason
            )));
        }
        Ok(hash_value(&input.content))
    }

    async fn process(&self, _ctx: &StageContext, unit: &Unit<ExportFile>) -> UnitResult<Chat> {
        parse_export(&unit.content)
    }

    fn keyed_outputs(&self) -> bool {
        true
    }

    /// A conversation present in several exports is kept once.
    fn output_key(&self, chat: &Chat) -> Option<String> {
        Some(chat.chat_hash.clone())
    }
}

//! The ChatMind stage graph.
//!
//! | stage | policy | depends on |
//! |-------|--------|-----------|
//! | `ingest` | append | - |
//! | `chunk` | append | ingest |
//! | `embed` | append | chunk |
//! | `cluster` | recompute | embed, chunk |
//! | `tag` | append | chunk |
//! | `summarize-chats` | append | ingest |
//! | `summarize-clusters` | append | cluster, chunk |
//! | `position` | recompute | summarize-chats, summarize-clusters, cluster |
//! | `similarity` | recompute | summarize-chats, position |
//! | `load` | append | every other stage |

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::llm::{create_annotator, Annotator};
use crate::orchestrator::Pipeline;
use crate::projection::{PcaProjector, Projector};
use crate::sink::{GraphSink, LazySqliteSink};
use crate::stage::{AppendOnly, FullRecompute};

pub mod chunk;
pub mod cluster;
pub mod embed;
pub mod ingest;
pub mod load;
pub mod position;
pub mod similarity;
pub mod summarize;
pub mod tag;

pub const INGEST: &str = "ingest";
pub const CHUNK: &str = "chunk";
pub const EMBED: &str = "embed";
pub const CLUSTER: &str = "cluster";
pub const TAG: &str = "tag";
pub const SUMMARIZE_CHATS: &str = "summarize-chats";
pub const SUMMARIZE_CLUSTERS: &str = "summarize-clusters";
pub const POSITION: &str = "position";
pub const SIMILARITY: &str = "similarity";
pub const LOAD: &str = "load";

/// Every stage name, in declared order.
pub const STAGE_NAMES: [&str; 10] = [
    INGEST,
    CHUNK,
    EMBED,
    CLUSTER,
    TAG,
    SUMMARIZE_CHATS,
    SUMMARIZE_CLUSTERS,
    POSITION,
    SIMILARITY,
    LOAD,
];

/// External collaborators the stages call.
#[derive(Clone)]
pub struct Services {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub annotator: Arc<dyn Annotator>,
    pub projector: Arc<dyn Projector>,
    pub sink: Arc<dyn GraphSink>,
}

impl Services {
    /// Providers and sink as named by the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            embedder: Arc::from(create_provider(&config.embedding)?),
            annotator: Arc::from(create_annotator(&config.llm)?),
            projector: Arc::new(PcaProjector::default()),
            sink: Arc::new(LazySqliteSink::new(config.sqlite_path())),
        })
    }
}

/// Build the full ChatMind pipeline.
pub fn build_pipeline(config: &Config, services: &Services) -> crate::error::Result<Pipeline> {
    Pipeline::new()
        .stage(
            AppendOnly(ingest::IngestStage::new(config.ingest.clone())),
            &[],
        )?
        .stage(
            AppendOnly(chunk::ChunkStage::new(
                config.chunking.max_tokens,
                config.chunking.min_chars,
            )),
            &[INGEST],
        )?
        .stage(
            AppendOnly(embed::EmbedStage::new(
                services.embedder.clone(),
                config.embedding.batch_size,
            )),
            &[CHUNK],
        )?
        .stage(
            FullRecompute(cluster::ClusterStage::new(config.clustering.clone())),
            &[EMBED, CHUNK],
        )?
        .stage(
            AppendOnly(tag::TagStage::new(
                services.annotator.clone(),
                config.llm.max_tags,
            )),
            &[CHUNK],
        )?
        .stage(
            AppendOnly(summarize::ChatSummaryStage::new(services.annotator.clone())),
            &[INGEST],
        )?
        .stage(
            AppendOnly(summarize::ClusterSummaryStage::new(
                services.annotator.clone(),
            )),
            &[CLUSTER, CHUNK],
        )?
        .stage(
            FullRecompute(position::PositionStage::new(
                services.embedder.clone(),
                services.projector.clone(),
            )),
            &[SUMMARIZE_CHATS, SUMMARIZE_CLUSTERS, CLUSTER],
        )?
        .stage(
            FullRecompute(similarity::SimilarityStage::new(
                services.embedder.clone(),
                config.similarity.clone(),
            )),
            &[SUMMARIZE_CHATS, POSITION],
        )?
        .stage(
            AppendOnly(load::LoadStage::new(services.sink.clone())),
            &[
                INGEST,
                CHUNK,
                EMBED,
                CLUSTER,
                TAG,
                SUMMARIZE_CHATS,
                SUMMARIZE_CLUSTERS,
                POSITION,
                SIMILARITY,
            ],
        )
}

/// Describe the pipeline without constructing any provider.
pub fn stage_specs() -> Vec<crate::orchestrator::StageSpec> {
    use crate::orchestrator::StageSpec;
    use crate::stage::RecomputePolicy::{AppendOnly as A, FullRecomputeOnDelta as R};
    let spec = |name, depends_on: &[&'static str], policy| StageSpec {
        name,
        depends_on: depends_on.to_vec(),
        policy,
    };
    vec![
        spec(INGEST, &[], A),
        spec(CHUNK, &[INGEST], A),
        spec(EMBED, &[CHUNK], A),
        spec(CLUSTER, &[EMBED, CHUNK], R),
        spec(TAG, &[CHUNK], A),
        spec(SUMMARIZE_CHATS, &[INGEST], A),
        spec(SUMMARIZE_CLUSTERS, &[CLUSTER, CHUNK], A),
        spec(POSITION, &[SUMMARIZE_CHATS, SUMMARIZE_CLUSTERS, CLUSTER], R),
        spec(SIMILARITY, &[SUMMARIZE_CHATS, POSITION], R),
        spec(
            LOAD,
            &[
                INGEST,
                CHUNK,
                EMBED,
                CLUSTER,
                TAG,
                SUMMARIZE_CHATS,
                SUMMARIZE_CLUSTERS,
                POSITION,
                SIMILARITY,
            ],
            A,
        ),
    ]
}

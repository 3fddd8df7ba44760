//! Service layer: the backend boundary and the stats queries.

pub mod backend;
pub mod stats;
pub mod upstream;

// Re-export commonly used types
pub use backend::{BackendReply, ChatMessage, EventStream, GenerationBackend, GenerationRequest};
pub use stats::{LogPage, LogQuery, OverviewStats, RankDimension, RankItem, RealtimeStats, StatsService};
pub use upstream::UpstreamBackend;

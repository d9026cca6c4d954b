pub mod admin;
pub mod cluster;
pub mod config;
pub mod digest;
pub mod error;
pub mod jobs;
pub mod native;
pub mod pipeline;
pub mod relationships;
pub mod repository;
pub mod result;
pub mod scheduler;
pub mod service;
pub mod similarity;
pub mod storage;
pub mod tagging;
pub mod types;

pub use admin::AdminActions;
pub use cluster::{Cluster, ClusterRepository, ClusterSnapshot, PropertyStat};
pub use config::Config;
pub use digest::{CrashSimilarity, DumpMiniInfo};
pub use pipeline::{AnalysisService, AnalyzerJob, AnalyzerPipeline, AnalyzerState};
pub use relationships::{RelationshipRepository, SIMILARITY_THRESHOLD};
pub use repository::DumpRepository;
pub use result::{AnalysisResult, Tag};
pub use scheduler::{JobScheduler, QueueStats};
pub use service::DumpLens;
pub use similarity::SimilarityService;
pub use tagging::DynamicAnalysis;
pub use types::*;

pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod error;
pub mod inference;
pub mod lock;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod scheduler;
pub mod schema;
pub mod state;
pub mod strategies;
pub mod workspace;

pub use catalog::{Catalog, RepoCatalog, RepositoryDescriptor};
pub use config::OrchestratorConfig;
pub use error::PipelineError;
pub use pipeline::{MachineSettings, RunOutcome, RunResult, Stage, StageMachine, StageRecord};
pub use state::{PipelineState, StageStatus};
pub use workspace::{GitFetcher, SourceFetcher, WorkspaceLayout};

// Workflow orchestration - scene state machine, stage execution, assembly
pub mod assembly;
pub mod checkpoint;
pub mod executor;
pub mod retry;
pub mod scene_pipeline;
pub mod state;

pub use assembly::AssemblyCoordinator;
pub use checkpoint::{RunCheckpointer, RunPhase, RunSnapshot};
pub use executor::StageExecutor;
pub use retry::{run_with_retry, Attempt};
pub use scene_pipeline::ScenePipelineController;
pub use state::{Scene, SceneStatus, SceneSummary};

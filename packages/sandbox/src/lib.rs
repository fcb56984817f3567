// ABOUTME: Per-project sandbox orchestration: provisioning, file sync, app restarts and status streaming
// ABOUTME: Backends plug in through ClusterBackend; Docker is the real one, memory backs tests and dry runs

pub mod backend;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod files;
pub mod manager;
pub mod resources;
pub mod restart;
pub mod settings;
pub mod startup;
pub mod status;
pub mod sync;

pub use backend::{ClusterBackend, DockerBackend, MemoryBackend, SandboxPhase};
pub use endpoint::{DeploymentProfile, EndpointAllocator};
pub use error::{BackendError, Result, SandboxError};
pub use executor::RemoteExecutor;
pub use files::{DirectoryFileStore, FileRecord, FileStore, FileStoreError, MemoryFileStore};
pub use manager::{SandboxManager, StartResponse, StatusResponse};
pub use resources::{CleanupReport, ResourceController, SandboxObservation};
pub use restart::{AppRestartController, RestartOutcome};
pub use settings::{ConfigError, SandboxSettings};
pub use startup::Runtime;
pub use status::{
    Clock, ContainerStatus, ManualClock, ProjectStatus, StatusEvent, StatusRegistry,
    StatusSweeper, Subscription, SystemClock,
};
pub use sync::{FileSynchronizer, SyncReport};

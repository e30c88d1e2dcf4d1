pub mod backend;
pub mod bridge;
pub mod env;
pub mod in_process;
pub mod limits;
pub mod loader;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod worker;

#[cfg(test)]
mod test_plugins;

pub use backend::{INIT_ENV_VAR, InitData, IsolationBackend, LaunchSpec, UnitEvent, UnitHandle};
pub use bridge::serve_permission_requests;
pub use in_process::{InProcessBackend, PluginContext, PluginResult};
pub use limits::HeapLimits;
pub use loader::{DiscoveredPlugin, PluginLoader};
pub use pool::{HealthReport, PluginWorkerPool, PoolEvent};
pub use process::ProcessBackend;
pub use protocol::{MessageKind, WorkerMessage};
pub use worker::{
    PluginWorker, PluginWorkerStats, WorkerConfig, WorkerEvent, WorkerFailure, WorkerSettings,
    WorkerState,
};

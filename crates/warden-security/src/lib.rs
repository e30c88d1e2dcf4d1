pub mod approval;
pub mod capability;
pub mod guard;
pub mod integrity;
pub mod manifest;
pub mod registry;

pub use approval::{
    ApprovalBroker, ApprovalResponder, PendingApproval, PermissionRequest, UnsupervisedPolicy,
};
pub use capability::{Capability, CapabilityCategory};
pub use guard::PermissionGuard;
pub use integrity::verify_integrity;
pub use manifest::{
    FilesystemMode, IntegrityMetadata, IsolationConfig, IsolationLevel, ManifestPermissions,
    NetworkMode, PluginManifest, ResourceLimits, ValidationResult, validate_manifest,
};
pub use registry::PermissionRegistry;

pub mod capability;
pub mod composer;
pub mod protocol;
pub mod registry;
pub mod request_id;
pub mod server;

pub use capability::{CapabilityDescriptor, CapabilityKind, DiscoveredCapabilities};
pub use composer::{Composer, CompositionSummary, ReloadReport};
pub use registry::{CapabilityRegistry, ConflictRecord, RegistrationReport};
pub use request_id::RequestIdGenerator;
pub use server::{ManagedServer, ServerState, ServerStatus};

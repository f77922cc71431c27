//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "06-adapters"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Concrete provisioning backends and state readers."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
pub mod azure;
pub mod memory;
pub mod terraform;
#[cfg(test)]
pub(crate) mod test_server;
pub mod token;

pub use azure::ArmStateReader;
pub use memory::{ApplyFailure, FaultPlan, MemoryBackend, MemoryCloud, MemoryStateReader};
pub use terraform::TerraformBackend;
pub use token::{token_provider, StaticToken, TokenProvider};

//! Authentication: credential storage, proof generation, and the session
//! lifecycle.

pub mod credentials;
pub mod proof;
pub mod session;

pub use credentials::{CredentialSet, CredentialStore};
pub use proof::ProofGenerator;
pub use session::{AuthSession, DeviceFlowSession, DeviceFlowState};

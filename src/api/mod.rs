//! API request plumbing: errors, transport, and the authenticated executor.

pub mod error;
pub mod executor;
pub mod transport;

pub use error::{ApiError, DeviceFlowError};
pub use executor::RequestExecutor;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, RequestBody, ReqwestTransport};

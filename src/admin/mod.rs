pub mod csr_api;

pub use csr_api::{ApiResponse, CsrApi, HealthResponse, CSR_CONTENT_TYPE};

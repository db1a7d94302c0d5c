//! HTTP admission layer.

mod middleware;
mod server;

pub use middleware::{
    admission_middleware, subject_from_headers, AdmissionState, DEFAULT_TIER, DENIED_MESSAGE,
    UNAVAILABLE_MESSAGE,
};
pub use server::{router, HttpServer, WELCOME_MESSAGE};

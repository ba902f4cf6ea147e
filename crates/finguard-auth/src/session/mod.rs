//! Server-side sessions bound to a client fingerprint.

mod record;
mod registry;

pub use record::{NewSession, SessionRecord, SessionRejection, SessionValidation};
pub use registry::{SessionRegistry, generate_session_id};

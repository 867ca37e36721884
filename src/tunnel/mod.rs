//! Tunnel core: admission of the single agent connection, the request
//! correlation table, and the session that ties them together.

pub mod admission;
pub mod pending;
pub mod session;

pub use admission::{Admission, AdmissionGuard, LivenessProbe};
pub use pending::{AbortGuard, Outcome, PendingTable, RequestStatus, Resolution};
pub use session::{AgentConnection, TunnelSession};

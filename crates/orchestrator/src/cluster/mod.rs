//! Multi-node coordination.
//!
//! Nodes sharing one job store never coordinate to fire a job: the
//! store's atomic claim already guarantees a single winner. The
//! [`ClusterCoordinator`] routes claims through the store under this
//! node's identity, and runs broadcast administrative tasks (such as
//! [`ResourceBundle`] refreshes) on every member, reporting every
//! member's failure rather than the first one.

mod coordinator;
mod error;
mod member;
mod resources;

pub use coordinator::{BroadcastReport, ClusterCoordinator};
pub use error::{ClusterError, ClusterResult, MemberFailure};
pub use member::{ClusterMember, ClusterTransport, LocalMember, MemberId, StaticMembership, TaskStatus};
pub use resources::{ResourceBundle, ResourceCache};

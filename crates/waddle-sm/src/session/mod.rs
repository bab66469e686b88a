//! Session state: per-connection data, per-account common data and the
//! authorization state machine.
//!
//! ```text
//! UNAUTHENTICATED --authorize--> AUTHENTICATED --bind--> RESOURCE_BOUND
//!        ^                                                     |
//!        +--------------------------logout---------------------+
//! ```
//!
//! Account-scoped ("common") data lives in the [`UserSession`] shared by all
//! connections of one bare JID and is only reachable through the
//! synchronized accessors on [`ResourceConnection`].

mod connection;
mod data;
mod registry;
mod user;

pub use connection::{AuthState, ResourceConnection};
pub use data::{DataKey, TypedMap};
pub use registry::SessionRegistry;
pub use user::UserSession;

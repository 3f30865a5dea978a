//! Identity collaborator seam
//!
//! The relay never validates credentials. An upstream service resolves the
//! connecting principal and the relay consumes the result here.

pub mod identity;

// Re-export main components
pub use identity::{
    resolver_for, ConnectionRequest, HeaderIdentityResolver, Identity, IdentityResolver,
    QueryIdentityResolver, SharedIdentityResolver,
};

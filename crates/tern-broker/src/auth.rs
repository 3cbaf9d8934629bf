//! Connection authorization hook.

use tern_core::packet::Connect;

/// Policy hook consulted before a CONNECT is accepted.
///
/// Returning `false` makes the broker answer with CONNACK `NotAuthorized`
/// and close the connection.
pub trait Authorizer: Send {
    fn authorize_connection(&self, connect: &Connect) -> bool;
}

/// Default policy: every connection is accepted.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize_connection(&self, _connect: &Connect) -> bool {
        true
    }
}

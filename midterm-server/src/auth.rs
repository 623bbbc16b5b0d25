//! `AuthGate` (§6 external collaborator): the only contact point between
//! the core and whatever password/session/cert scheme the surrounding
//! product uses. Password storage, login flows, and certificates are all
//! out of scope (§1 Non-goals); the core only ever calls `allow`.

use axum::http::HeaderMap;

pub trait AuthGate: Send + Sync + 'static {
    /// Consulted once per WS accept, before the upgrade completes.
    fn allow(&self, headers: &HeaderMap) -> bool;
}

/// Default gate: admits every request. Stands in until a real product
/// wires its own `AuthGate` into `AppState`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthGate for AllowAll {
    fn allow(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_admits_empty_headers() {
        assert!(AllowAll.allow(&HeaderMap::new()));
    }
}

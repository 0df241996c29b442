use std::collections::HashMap;

use tracing::trace;

use crate::shared::ConnectionId;

/// Internal identifier for a session currently tracked by the dispatcher
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionHandle(pub usize);

impl From<SessionHandle> for usize {
    fn from(x: SessionHandle) -> usize {
        x.0
    }
}

/// Routing table from connection ID to session handle
///
/// Several IDs may route to the same session. If an ID is present here, no
/// buffered list and no time-wait entry exists for it.
#[derive(Default)]
pub struct SessionIdMap {
    ids: HashMap<ConnectionId, SessionHandle>,
}

impl SessionIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `cid` to `handle`; reports whether the ID was previously unmapped
    pub fn insert(&mut self, cid: ConnectionId, handle: SessionHandle) -> bool {
        self.ids.insert(cid, handle).is_none()
    }

    pub fn find(&self, cid: &ConnectionId) -> Option<SessionHandle> {
        self.ids.get(cid).copied()
    }

    pub fn erase(&mut self, cid: &ConnectionId) -> Option<SessionHandle> {
        self.ids.remove(cid)
    }

    /// Route `new_cid` to the session that owns `existing_cid`
    ///
    /// Fails if `existing_cid` is unknown or `new_cid` is already taken.
    pub fn try_add_new_connection_id(
        &mut self,
        existing_cid: &ConnectionId,
        new_cid: ConnectionId,
    ) -> Option<SessionHandle> {
        let handle = self.find(existing_cid)?;
        if self.ids.contains_key(&new_cid) {
            trace!(connection = %new_cid, "connection ID already routed");
            return None;
        }
        self.ids.insert(new_cid, handle);
        Some(handle)
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.ids.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(x: u8) -> ConnectionId {
        ConnectionId::new(&[x; 8])
    }

    #[test]
    fn multiple_ids_share_a_session() {
        let mut map = SessionIdMap::new();
        assert!(map.insert(cid(1), SessionHandle(0)));
        assert_eq!(
            map.try_add_new_connection_id(&cid(1), cid(2)),
            Some(SessionHandle(0))
        );
        assert_eq!(map.find(&cid(2)), Some(SessionHandle(0)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn unknown_existing_id_is_rejected() {
        let mut map = SessionIdMap::new();
        assert_eq!(map.try_add_new_connection_id(&cid(9), cid(2)), None);
        assert!(map.is_empty());
    }

    #[test]
    fn insert_reports_collisions() {
        let mut map = SessionIdMap::new();
        assert!(map.insert(cid(1), SessionHandle(0)));
        assert!(!map.insert(cid(1), SessionHandle(1)));
    }
}

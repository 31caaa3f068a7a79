//! Server reported session parameters.
//!
//! The server sends a `ParameterStatus` message for every `GUC_REPORT`
//! parameter at startup and again whenever one of them changes, including the
//! implicit change back when a transactional `SET` is rolled back. The engine
//! applies every report it sees, so the view here always reflects the last
//! state the server announced before the most recent `ReadyForQuery`.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Writable handle, owned by the connection.
///
/// Only the protocol engine mutates this, while driving a reply stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionParams {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionParams {
    pub(crate) fn update(&self, name: &str, value: &str) {
        let mut map = self.inner.write().expect("session map poisoned");
        match map.get_mut(name) {
            Some(slot) => {
                slot.clear();
                slot.push_str(value);
            }
            None => {
                map.insert(name.to_owned(), value.to_owned());
            }
        }
    }

    pub(crate) fn view(&self) -> ParameterView {
        ParameterView { inner: Arc::clone(&self.inner) }
    }
}

/// Read-only view of the server reported session parameters.
///
/// The view is live: it reflects updates applied by later executions, and it
/// exposes no way to mutate the underlying map. Reads never block a running
/// query; they take a short read lock on a map that is only written between
/// protocol messages.
#[derive(Debug, Clone)]
pub struct ParameterView {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ParameterView {
    /// Current value of a single `GUC_REPORT` parameter.
    ///
    /// Returns `None` for parameters the server does not report.
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner.read().expect("session map poisoned").get(name).cloned()
    }

    /// Snapshot of every reported parameter, sorted by name.
    pub fn entries(&self) -> Vec<(String, String)> {
        let map = self.inner.read().expect("session map poisoned");
        let mut out: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn view_reflects_later_updates() {
        let params = SessionParams::default();
        let view = params.view();

        params.update("client_encoding", "UTF8");
        assert_eq!(view.get("client_encoding").as_deref(), Some("UTF8"));

        params.update("application_name", "app1");
        params.update("application_name", "app2");
        assert_eq!(view.get("application_name").as_deref(), Some("app2"));

        assert_eq!(view.get("nonexistent"), None);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn rollback_reported_value_wins() {
        // the server re-reports the pre-transaction value on rollback, the
        // map just applies whatever was reported last
        let params = SessionParams::default();
        let view = params.view();

        params.update("application_name", "before");
        params.update("application_name", "inside-txn");
        params.update("application_name", "before");
        assert_eq!(view.get("application_name").as_deref(), Some("before"));
    }
}

use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::{PageDocument, PartialPageDocument, RootNode};

/// Name of the shared map holding the page.
pub const PAGE_MAP: &str = "page";
pub const KEY_CONTENT: &str = "content";
pub const KEY_ROOT: &str = "root";
pub const KEY_ZONES: &str = "zones";

pub const DEFAULT_UNDO_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to (de)serialize page data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One key written by a local edit.
#[derive(Debug, Clone)]
struct KeyChange {
    key: &'static str,
    before: Option<String>,
    after: Option<String>,
}

/// Replica of a shared page document.
///
/// The page lives in one yrs map with the top-level keys `content`, `root`
/// and `zones`, each written whole as a JSON string. Concurrent writes to
/// the same key resolve last-writer-wins at key granularity; writes to
/// different keys merge.
pub struct CollaborationEngine {
    doc: Doc,
    page: MapRef,
    undo_stack: VecDeque<Vec<KeyChange>>,
    redo_stack: Vec<Vec<KeyChange>>,
    undo_limit: usize,
}

impl Default for CollaborationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CollaborationEngine {
    pub fn new() -> Self {
        Self::with_undo_limit(DEFAULT_UNDO_LIMIT)
    }

    pub fn with_undo_limit(undo_limit: usize) -> Self {
        let doc = Doc::new();
        let page = doc.get_or_insert_map(PAGE_MAP);
        Self {
            doc,
            page,
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            undo_limit,
        }
    }

    /// Yrs client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ---------------------------------------------------------------
    // Local edits
    // ---------------------------------------------------------------

    /// Replaces the whole document. Returns the update to broadcast, or
    /// `None` when the replica already holds exactly this document.
    pub fn set_data(&mut self, data: &PageDocument) -> Result<Option<Vec<u8>>, CollabError> {
        let writes = vec![
            (KEY_CONTENT, Some(serde_json::to_string(&data.content)?)),
            (KEY_ROOT, Some(serde_json::to_string(&data.root)?)),
            (KEY_ZONES, Some(serde_json::to_string(&data.zones)?)),
        ];
        Ok(self.write_local(writes))
    }

    /// Writes only the keys present in `partial`.
    pub fn update_data(&mut self, partial: &PartialPageDocument) -> Result<Option<Vec<u8>>, CollabError> {
        let mut writes = Vec::with_capacity(3);
        if let Some(content) = &partial.content {
            writes.push((KEY_CONTENT, Some(serde_json::to_string(content)?)));
        }
        if let Some(root) = &partial.root {
            writes.push((KEY_ROOT, Some(serde_json::to_string(root)?)));
        }
        if let Some(zones) = &partial.zones {
            writes.push((KEY_ZONES, Some(serde_json::to_string(zones)?)));
        }
        Ok(self.write_local(writes))
    }

    /// Current document, or `None` while neither `content` nor `root` has
    /// been written by anyone.
    pub fn get_data(&self) -> Result<Option<PageDocument>, CollabError> {
        let txn = self.doc.transact();
        let content = self.read_key(&txn, KEY_CONTENT);
        let root = self.read_key(&txn, KEY_ROOT);
        if content.is_none() && root.is_none() {
            return Ok(None);
        }
        let zones = self.read_key(&txn, KEY_ZONES);

        Ok(Some(PageDocument {
            root: parse_or_default::<RootNode>(root.as_deref())?,
            content: parse_or_default(content.as_deref())?,
            zones: parse_or_default(zones.as_deref())?,
        }))
    }

    pub fn has_data(&self) -> bool {
        let txn = self.doc.transact();
        self.page.contains_key(&txn, KEY_CONTENT) || self.page.contains_key(&txn, KEY_ROOT)
    }

    fn write_local(&mut self, writes: Vec<(&'static str, Option<String>)>) -> Option<Vec<u8>> {
        let changes: Vec<KeyChange> = {
            let txn = self.doc.transact();
            writes
                .into_iter()
                .filter_map(|(key, after)| {
                    let before = self.read_key(&txn, key);
                    (before != after).then_some(KeyChange { key, before, after })
                })
                .collect()
        };
        if changes.is_empty() {
            return None;
        }

        let update = self.apply_changes(changes.iter().map(|c| (c.key, c.after.as_deref())));
        self.undo_stack.push_back(changes);
        while self.undo_stack.len() > self.undo_limit {
            self.undo_stack.pop_front();
        }
        self.redo_stack.clear();
        Some(update)
    }

    fn apply_changes<'a>(&self, writes: impl Iterator<Item = (&'static str, Option<&'a str>)>) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        for (key, value) in writes {
            match value {
                Some(json) => {
                    self.page.insert(&mut txn, key, json.to_string());
                }
                None => {
                    self.page.remove(&mut txn, key);
                }
            }
        }
        txn.encode_update_v1()
    }

    fn read_key<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<String> {
        match self.page.get(txn, key) {
            Some(Out::Any(Any::String(json))) => Some(json.to_string()),
            _ => None,
        }
    }

    // ---------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------

    /// Merges an update produced by another replica. Remote changes are
    /// never recorded for undo.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update).map_err(|e| CollabError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Apply(e.to_string()))?;
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| CollabError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ---------------------------------------------------------------
    // Undo / redo
    // ---------------------------------------------------------------

    /// Whether `undo` would change anything. Entries whose keys were all
    /// overwritten by collaborators do not count.
    pub fn can_undo(&self) -> bool {
        let txn = self.doc.transact();
        self.undo_stack
            .iter()
            .any(|changes| changes.iter().any(|c| self.read_key(&txn, c.key) == c.after))
    }

    pub fn can_redo(&self) -> bool {
        let txn = self.doc.transact();
        self.redo_stack
            .iter()
            .any(|changes| changes.iter().any(|c| self.read_key(&txn, c.key) == c.before))
    }

    /// Reverts the most recent local edit that can still be reverted.
    ///
    /// A key is only restored while it still holds what this replica wrote;
    /// keys a collaborator has since overwritten keep the collaborator's
    /// value. Edits with nothing left to revert are discarded.
    pub fn undo(&mut self) -> Option<Vec<u8>> {
        while let Some(changes) = self.undo_stack.pop_back() {
            let applicable: Vec<KeyChange> = {
                let txn = self.doc.transact();
                changes
                    .into_iter()
                    .filter(|c| self.read_key(&txn, c.key) == c.after)
                    .collect()
            };
            if applicable.is_empty() {
                log::debug!("dropping undo entry overwritten by remote edits");
                continue;
            }
            let update = self.apply_changes(applicable.iter().map(|c| (c.key, c.before.as_deref())));
            self.redo_stack.push(applicable);
            return Some(update);
        }
        None
    }

    /// Re-applies the most recently undone edit, under the same rule as
    /// `undo`: only keys still holding the undone value are touched.
    pub fn redo(&mut self) -> Option<Vec<u8>> {
        while let Some(changes) = self.redo_stack.pop() {
            let applicable: Vec<KeyChange> = {
                let txn = self.doc.transact();
                changes
                    .into_iter()
                    .filter(|c| self.read_key(&txn, c.key) == c.before)
                    .collect()
            };
            if applicable.is_empty() {
                continue;
            }
            let update = self.apply_changes(applicable.iter().map(|c| (c.key, c.after.as_deref())));
            self.undo_stack.push_back(applicable);
            return Some(update);
        }
        None
    }
}

fn parse_or_default<T: DeserializeOwned + Default>(json: Option<&str>) -> Result<T, CollabError> {
    match json {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ComponentNode;
    use serde_json::json;

    fn page(texts: &[&str]) -> PageDocument {
        PageDocument::with_content(
            texts
                .iter()
                .map(|t| ComponentNode::from_value("Text", json!({"id": t, "text": t})))
                .collect(),
        )
    }

    fn sync(from: &CollaborationEngine, to: &mut CollaborationEngine) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_remote_update(&diff).unwrap();
    }

    #[test]
    fn test_get_data_is_none_before_first_write() {
        let engine = CollaborationEngine::new();
        assert!(engine.get_data().unwrap().is_none());
        assert!(!engine.has_data());
    }

    #[test]
    fn test_empty_page_is_distinct_from_no_data() {
        let mut engine = CollaborationEngine::new();
        engine.set_data(&PageDocument::new()).unwrap();
        assert_eq!(engine.get_data().unwrap(), Some(PageDocument::new()));
    }

    #[test]
    fn test_set_data_round_trips_and_is_idempotent() {
        let mut engine = CollaborationEngine::new();
        let doc = page(&["a", "b"]);

        let first = engine.set_data(&doc).unwrap();
        assert!(first.is_some());
        assert_eq!(engine.get_data().unwrap(), Some(doc.clone()));

        let state = engine.encode_state();
        assert!(engine.set_data(&doc).unwrap().is_none());
        assert_eq!(engine.encode_state(), state);
        assert_eq!(engine.get_data().unwrap(), Some(doc));
    }

    #[test]
    fn test_update_data_touches_only_given_keys() {
        let mut engine = CollaborationEngine::new();
        engine.set_data(&page(&["a"])).unwrap();

        let mut root = RootNode::default();
        root.props.title = Some("Landing".into());
        engine.update_data(&PartialPageDocument::root(root)).unwrap();

        let data = engine.get_data().unwrap().unwrap();
        assert_eq!(data.root.props.title.as_deref(), Some("Landing"));
        assert_eq!(data.content, page(&["a"]).content);
    }

    #[test]
    fn test_remote_update_converges() {
        let mut a = CollaborationEngine::new();
        let mut b = CollaborationEngine::new();

        let update = a.set_data(&page(&["x"])).unwrap().unwrap();
        b.apply_remote_update(&update).unwrap();

        assert_eq!(b.get_data().unwrap(), a.get_data().unwrap());
    }

    #[test]
    fn test_disjoint_keys_merge_in_any_order() {
        let mut a = CollaborationEngine::new();
        let mut b = CollaborationEngine::new();

        let mut root = RootNode::default();
        root.props.slug = Some("home".into());
        let from_a = a.update_data(&PartialPageDocument::content(page(&["a"]).content)).unwrap().unwrap();
        let from_b = b.update_data(&PartialPageDocument::root(root.clone())).unwrap().unwrap();

        a.apply_remote_update(&from_b).unwrap();
        b.apply_remote_update(&from_a).unwrap();

        let merged_a = a.get_data().unwrap().unwrap();
        let merged_b = b.get_data().unwrap().unwrap();
        assert_eq!(merged_a, merged_b);
        assert_eq!(merged_a.content, page(&["a"]).content);
        assert_eq!(merged_a.root, root);
    }

    #[test]
    fn test_same_key_concurrent_writes_converge() {
        let mut a = CollaborationEngine::new();
        let mut b = CollaborationEngine::new();
        a.set_data(&page(&["from-a"])).unwrap();
        b.set_data(&page(&["from-b"])).unwrap();

        sync(&a, &mut b);
        sync(&b, &mut a);

        assert_eq!(a.get_data().unwrap(), b.get_data().unwrap());
    }

    #[test]
    fn test_malformed_update_is_an_error() {
        let mut engine = CollaborationEngine::new();
        assert!(matches!(
            engine.apply_remote_update(&[0xff, 0xff, 0xff]),
            Err(CollabError::Decode(_))
        ));
    }

    #[test]
    fn test_undo_redo_local_edits() {
        let mut engine = CollaborationEngine::new();
        engine.set_data(&page(&["one"])).unwrap();
        engine.set_data(&page(&["one", "two"])).unwrap();
        assert!(engine.can_undo());
        assert!(!engine.can_redo());

        assert!(engine.undo().is_some());
        assert_eq!(engine.get_data().unwrap(), Some(page(&["one"])));
        assert!(engine.can_redo());

        assert!(engine.redo().is_some());
        assert_eq!(engine.get_data().unwrap(), Some(page(&["one", "two"])));

        engine.undo();
        engine.undo();
        assert!(engine.get_data().unwrap().is_none());
        assert!(engine.undo().is_none());
    }

    #[test]
    fn test_undo_never_reverts_remote_edits() {
        let mut a = CollaborationEngine::new();
        let mut b = CollaborationEngine::new();

        let update = a
            .update_data(&PartialPageDocument::content(page(&["mine"]).content))
            .unwrap()
            .unwrap();
        b.apply_remote_update(&update).unwrap();
        let update = b.set_data(&page(&["theirs"])).unwrap().unwrap();
        a.apply_remote_update(&update).unwrap();

        assert!(!a.can_undo(), "nothing left that undo could revert");
        assert!(a.undo().is_none());
        assert_eq!(a.get_data().unwrap(), Some(page(&["theirs"])));
        assert!(!a.can_undo());
    }

    #[test]
    fn test_can_undo_skips_stale_entries_but_sees_older_ones() {
        let mut a = CollaborationEngine::new();
        let mut b = CollaborationEngine::new();

        let mut root = RootNode::default();
        root.props.title = Some("Mine".into());
        let first = a.update_data(&PartialPageDocument::root(root)).unwrap().unwrap();
        let second = a
            .update_data(&PartialPageDocument::content(page(&["mine"]).content))
            .unwrap()
            .unwrap();
        b.apply_remote_update(&first).unwrap();
        b.apply_remote_update(&second).unwrap();
        let overwrite = b
            .update_data(&PartialPageDocument::content(page(&["theirs"]).content))
            .unwrap()
            .unwrap();
        a.apply_remote_update(&overwrite).unwrap();

        assert!(a.can_undo(), "the root edit is still revertible");
        assert!(a.undo().is_some());
        assert_eq!(a.get_data().unwrap().unwrap().root, RootNode::default());
        assert_eq!(a.get_data().unwrap().unwrap().content, page(&["theirs"]).content);
        assert!(!a.can_undo());
        assert!(a.can_redo());

        let retitle = {
            let mut root = RootNode::default();
            root.props.title = Some("Theirs".into());
            b.apply_remote_update(&a.encode_state()).unwrap();
            b.update_data(&PartialPageDocument::root(root)).unwrap().unwrap()
        };
        a.apply_remote_update(&retitle).unwrap();
        assert!(!a.can_redo(), "redo would clobber the collaborator's title");
        assert!(a.redo().is_none());
    }

    #[test]
    fn test_new_edit_clears_redo_and_limit_applies() {
        let mut engine = CollaborationEngine::with_undo_limit(2);
        for n in 1..=4 {
            let names: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            engine.set_data(&page(&names)).unwrap();
        }
        assert!(engine.undo().is_some());
        assert!(engine.undo().is_some());
        assert!(engine.undo().is_none());

        engine.redo();
        engine.set_data(&page(&["fresh"])).unwrap();
        assert!(!engine.can_redo());
    }
}

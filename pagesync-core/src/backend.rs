//! Contracts for the external document database and object storage, plus
//! the helpers that sit on top of them: image upload/resolution and
//! dynamic data resolution for collection-backed components.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{source_key, DataCache};
use crate::query::{build_query, validate_query_config, QueryConfig, QueryError};
use crate::{ComponentNode, ImageData};

/// A stored document as returned by the database.
pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentDatabase: Send + Sync {
    /// Lists documents matching `queries`, each rendered by
    /// `QueryClause::to_backend_string`.
    async fn list(&self, collection: &str, queries: &[String]) -> Result<Vec<Row>, BackendError>;
    async fn get(&self, collection: &str, id: &str) -> Result<Row, BackendError>;
    async fn create(&self, collection: &str, data: Row) -> Result<Row, BackendError>;
    async fn update(&self, collection: &str, id: &str, data: Row) -> Result<Row, BackendError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bucket: &str, file: UploadFile) -> Result<StoredObject, BackendError>;
    async fn get_url(&self, bucket: &str, id: &str) -> Result<String, BackendError>;
    async fn delete(&self, bucket: &str, id: &str) -> Result<(), BackendError>;
}

/// Displayable URL for an image. Uploaded files are looked up in storage
/// so a moved or re-signed object still resolves.
pub async fn resolve_image(
    storage: &dyn ObjectStorage,
    bucket: &str,
    image: &ImageData,
) -> Result<String, BackendError> {
    match image {
        ImageData::Url { url, .. } => Ok(url.clone()),
        ImageData::Upload { file_id, .. } => storage.get_url(bucket, file_id).await,
    }
}

pub async fn upload_image(
    storage: &dyn ObjectStorage,
    bucket: &str,
    file: UploadFile,
    alt: &str,
) -> Result<ImageData, BackendError> {
    let stored = storage.upload(bucket, file).await?;
    log::debug!("uploaded image {} to bucket {bucket}", stored.id);
    Ok(ImageData::Upload {
        file_id: stored.id,
        url: stored.url,
        alt: alt.to_string(),
    })
}

/// Uploads `file` and swaps it into `image`. `image` is only written once
/// the upload succeeded. A previously uploaded file is then deleted; failing
/// to delete it is logged and otherwise ignored.
pub async fn replace_image(
    storage: &dyn ObjectStorage,
    bucket: &str,
    image: &mut ImageData,
    file: UploadFile,
) -> Result<(), BackendError> {
    let next = upload_image(storage, bucket, file, image.alt()).await?;
    let previous = std::mem::replace(image, next);
    if let Some(old_id) = previous.file_id() {
        if let Err(e) = storage.delete(bucket, old_id).await {
            log::warn!("failed to delete replaced image {old_id}: {e}");
        }
    }
    Ok(())
}

/// Resolves the rows a data-bound component should render.
pub struct DynamicDataResolver {
    db: Arc<dyn DocumentDatabase>,
    cache: Arc<DataCache>,
}

impl DynamicDataResolver {
    pub fn new(db: Arc<dyn DocumentDatabase>, cache: Arc<DataCache>) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    /// Manual components yield their static `items`. Database-backed ones
    /// run their query (through the cache) and have `fieldMapping` applied.
    pub async fn resolve(&self, node: &ComponentNode) -> Result<Vec<Value>, BackendError> {
        let props = &node.props;
        if props.get("dataSource").and_then(Value::as_str) != Some("database") {
            return Ok(props
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default());
        }

        let collection = props
            .get("collection")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BackendError::InvalidQuery("no collection bound".to_string()))?;
        let config: QueryConfig = match props.get("query") {
            Some(query) => serde_json::from_value(query.clone())?,
            None => QueryConfig::default(),
        };
        let validation = validate_query_config(&config);
        if !validation.valid {
            return Err(BackendError::InvalidQuery(validation.errors.join("; ")));
        }
        let queries: Vec<String> = build_query(&config)?
            .iter()
            .map(|clause| clause.to_backend_string())
            .collect();
        let mapping: BTreeMap<String, String> = match props.get("fieldMapping") {
            Some(mapping) => serde_json::from_value(mapping.clone())?,
            None => BTreeMap::new(),
        };

        // Cached rows are unmapped: components sharing a query may map
        // the same rows differently.
        let key = source_key(collection, &queries);
        let rows = match self.cache.get(&key) {
            Some(rows) => rows,
            None => {
                let rows: Vec<Value> = self
                    .db
                    .list(collection, &queries)
                    .await?
                    .into_iter()
                    .map(Value::Object)
                    .collect();
                log::debug!("fetched {} rows from {collection}", rows.len());
                self.cache.insert(key, rows.clone());
                rows
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| match row {
                Value::Object(row) => Value::Object(apply_field_mapping(row, &mapping)),
                other => other,
            })
            .collect())
    }

    /// Forgets cached results for `collection`, e.g. after a write to it.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        self.cache.invalidate(&format!("{collection}?"))
    }
}

/// Copies each mapped source field onto its display name. Source fields
/// stay in place.
pub fn apply_field_mapping(mut row: Row, mapping: &BTreeMap<String, String>) -> Row {
    for (display, source) in mapping {
        if let Some(value) = row.get(source).cloned() {
            row.insert(display.clone(), value);
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryDatabase {
        rows: Mutex<HashMap<String, Vec<Row>>>,
        list_calls: AtomicUsize,
        seen_queries: Mutex<Vec<String>>,
    }

    impl MemoryDatabase {
        fn with_rows(collection: &str, rows: Vec<Value>) -> Self {
            let db = Self::default();
            let rows = rows
                .into_iter()
                .filter_map(|r| r.as_object().cloned())
                .collect();
            db.rows.lock().unwrap().insert(collection.to_string(), rows);
            db
        }
    }

    #[async_trait]
    impl DocumentDatabase for MemoryDatabase {
        async fn list(&self, collection: &str, queries: &[String]) -> Result<Vec<Row>, BackendError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_queries.lock().unwrap().extend(queries.iter().cloned());
            Ok(self.rows.lock().unwrap().get(collection).cloned().unwrap_or_default())
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Row, BackendError> {
            self.rows
                .lock()
                .unwrap()
                .get(collection)
                .and_then(|rows| rows.iter().find(|r| r.get("$id") == Some(&json!(id))).cloned())
                .ok_or_else(|| BackendError::NotFound {
                    collection: collection.into(),
                    id: id.into(),
                })
        }

        async fn create(&self, collection: &str, data: Row) -> Result<Row, BackendError> {
            self.rows
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .push(data.clone());
            Ok(data)
        }

        async fn update(&self, collection: &str, id: &str, data: Row) -> Result<Row, BackendError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(collection)
                .and_then(|rows| rows.iter_mut().find(|r| r.get("$id") == Some(&json!(id))))
                .ok_or_else(|| BackendError::NotFound {
                    collection: collection.into(),
                    id: id.into(),
                })?;
            row.extend(data);
            Ok(row.clone())
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
            if let Some(rows) = self.rows.lock().unwrap().get_mut(collection) {
                rows.retain(|r| r.get("$id") != Some(&json!(id)));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryStorage {
        fail_uploads: bool,
        deleted: Mutex<Vec<String>>,
        next_id: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn upload(&self, bucket: &str, file: UploadFile) -> Result<StoredObject, BackendError> {
            if self.fail_uploads {
                return Err(BackendError::Transport("storage unavailable".into()));
            }
            let id = format!("file-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            Ok(StoredObject {
                url: format!("https://storage.test/{bucket}/{id}/{}", file.name),
                id,
            })
        }

        async fn get_url(&self, bucket: &str, id: &str) -> Result<String, BackendError> {
            Ok(format!("https://storage.test/{bucket}/{id}/view"))
        }

        async fn delete(&self, _bucket: &str, id: &str) -> Result<(), BackendError> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn png(name: &str) -> UploadFile {
        UploadFile {
            name: name.into(),
            content_type: "image/png".into(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    fn bound_list(query: Value) -> ComponentNode {
        ComponentNode::from_value("DynamicList", json!({
            "dataSource": "database",
            "collection": "events",
            "query": query,
            "fieldMapping": {"title": "name"}
        }))
    }

    #[tokio::test]
    async fn test_manual_component_returns_items() {
        let resolver = DynamicDataResolver::new(Arc::new(MemoryDatabase::default()), Arc::new(DataCache::default()));
        let node = ComponentNode::from_value("DynamicList", json!({"dataSource": "manual", "items": [{"title": "x"}]}));

        assert_eq!(resolver.resolve(&node).await.unwrap(), vec![json!({"title": "x"})]);
    }

    #[tokio::test]
    async fn test_database_component_maps_and_caches() {
        let db = Arc::new(MemoryDatabase::with_rows("events", vec![json!({"$id": "1", "name": "Launch"})]));
        let resolver = DynamicDataResolver::new(db.clone(), Arc::new(DataCache::default()));
        let node = bound_list(json!({
            "conditions": [{"field": "status", "operator": "equal", "value": "live"}],
            "limit": 10
        }));

        let rows = resolver.resolve(&node).await.unwrap();
        assert_eq!(rows, vec![json!({"$id": "1", "name": "Launch", "title": "Launch"})]);

        let again = resolver.resolve(&node).await.unwrap();
        assert_eq!(again, rows);
        assert_eq!(db.list_calls.load(Ordering::SeqCst), 1);

        let queries = db.seen_queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].contains("\"method\":\"equal\""));

        assert_eq!(resolver.invalidate_collection("events"), 1);
        resolver.resolve(&node).await.unwrap();
        assert_eq!(db.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shared_query_keeps_each_field_mapping() {
        let db = Arc::new(MemoryDatabase::with_rows(
            "events",
            vec![json!({"$id": "1", "name": "Launch", "venue": "Hall"})],
        ));
        let resolver = DynamicDataResolver::new(db.clone(), Arc::new(DataCache::default()));
        let by_name = bound_list(json!({"conditions": [], "limit": 10}));
        let mut by_venue = by_name.clone();
        by_venue.props.insert("fieldMapping".into(), json!({"title": "venue"}));

        let names = resolver.resolve(&by_name).await.unwrap();
        let venues = resolver.resolve(&by_venue).await.unwrap();

        assert_eq!(names[0]["title"], json!("Launch"));
        assert_eq!(venues[0]["title"], json!("Hall"));
        assert_eq!(db.list_calls.load(Ordering::SeqCst), 1, "one fetch serves both mappings");
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected_before_fetch() {
        let db = Arc::new(MemoryDatabase::default());
        let resolver = DynamicDataResolver::new(db.clone(), Arc::new(DataCache::default()));
        let node = bound_list(json!({"conditions": [], "limit": 9000}));

        let err = resolver.resolve(&node).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidQuery(ref msg) if msg.contains("limit")));
        assert_eq!(db.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_database_crud_contract() {
        let db = MemoryDatabase::default();
        let mut row = Row::new();
        row.insert("$id".into(), json!("a"));
        row.insert("name".into(), json!("first"));
        db.create("events", row).await.unwrap();

        let mut patch = Row::new();
        patch.insert("name".into(), json!("renamed"));
        let updated = db.update("events", "a", patch).await.unwrap();
        assert_eq!(updated["name"], json!("renamed"));

        db.delete("events", "a").await.unwrap();
        assert!(matches!(db.get("events", "a").await, Err(BackendError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_resolve_image() {
        let storage = MemoryStorage::default();
        let url = ImageData::Url { url: "https://a/b.png".into(), alt: String::new() };
        assert_eq!(resolve_image(&storage, "media", &url).await.unwrap(), "https://a/b.png");

        let upload = ImageData::Upload { file_id: "f9".into(), url: "stale".into(), alt: String::new() };
        assert_eq!(
            resolve_image(&storage, "media", &upload).await.unwrap(),
            "https://storage.test/media/f9/view"
        );
    }

    #[tokio::test]
    async fn test_upload_image() {
        let storage = MemoryStorage::default();
        let image = upload_image(&storage, "media", png("hero.png"), "Hero").await.unwrap();
        assert_eq!(image.file_id(), Some("file-0"));
        assert_eq!(image.alt(), "Hero");
        assert!(image.url().ends_with("hero.png"));
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_image_untouched() {
        let storage = MemoryStorage { fail_uploads: true, ..MemoryStorage::default() };
        let mut image = ImageData::Url { url: "https://a/b.png".into(), alt: "b".into() };
        let before = image.clone();

        let result = replace_image(&storage, "media", &mut image, png("new.png")).await;
        assert!(matches!(result, Err(BackendError::Transport(_))));
        assert_eq!(image, before);
    }

    #[tokio::test]
    async fn test_replace_image_deletes_previous_upload() {
        let storage = MemoryStorage::default();
        let mut image = ImageData::Upload { file_id: "old".into(), url: "u".into(), alt: "logo".into() };

        replace_image(&storage, "media", &mut image, png("logo.png")).await.unwrap();
        assert_eq!(image.file_id(), Some("file-0"));
        assert_eq!(image.alt(), "logo");
        assert_eq!(*storage.deleted.lock().unwrap(), vec!["old".to_string()]);
    }
}

//! The document store under test.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ErrorCode;

/// A document as stored in the store under test.
pub type Document = serde_json::Value;

//////////////////////////////////////////// StoreError ////////////////////////////////////////////

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Unreachable(String),
    /// The collection does not exist.
    #[error("no such collection: {0}")]
    NoSuchCollection(String),
    /// The collection already exists.
    #[error("collection already exists: {0}")]
    CollectionExists(String),
    /// The store rejected a request.
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Unreachable(_) => ErrorCode::Unavailable,
            StoreError::NoSuchCollection(_) => ErrorCode::NotFound,
            StoreError::CollectionExists(_) => ErrorCode::InvalidArgument,
            StoreError::Rejected { .. } => ErrorCode::Internal,
        }
    }
}

/////////////////////////////////////////// DocumentStore //////////////////////////////////////////

/// The operations the benchmark needs from a document store.  Nothing beyond last-write-wins per
/// key is assumed.
#[async_trait::async_trait]
pub trait DocumentStore: std::fmt::Debug + Send + Sync {
    /// Create an empty collection.  Fails with [StoreError::CollectionExists] if it exists.
    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Delete a collection and every document in it.
    async fn delete_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Write `doc` under `key`, replacing whatever was there.
    async fn put(&self, collection: &str, key: &str, doc: &Document) -> Result<(), StoreError>;

    /// Read the document under `key`, or `None` when there is no such document.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;
}

/// Delete `name` if it exists and create it empty.  Safe to call whether or not the collection
/// already exists; afterwards the collection is always empty.
pub async fn reset_collection(store: &dyn DocumentStore, name: &str) -> Result<(), StoreError> {
    match store.create_collection(name).await {
        Ok(()) => Ok(()),
        Err(StoreError::CollectionExists(_)) => {
            tracing::info!(collection = name, "collection exists; recreating it");
            store.delete_collection(name).await?;
            store.create_collection(name).await
        }
        Err(err) => Err(err),
    }
}

//////////////////////////////////////////// MemoryStore ///////////////////////////////////////////

/// An in-process store.  Used by tests and by the `memory` backend to measure the harness itself.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, HashMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The names of the collections that currently exist, sorted.
    pub fn collections(&self) -> Vec<String> {
        // SAFETY: Mutex poisoning.
        let collections = self.collections.lock().unwrap();
        let mut names = collections.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// The number of documents in `collection`, or `None` if it does not exist.
    pub fn len(&self, collection: &str) -> Option<usize> {
        // SAFETY: Mutex poisoning.
        let collections = self.collections.lock().unwrap();
        collections.get(collection).map(|c| c.len())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        // SAFETY: Mutex poisoning.
        let mut collections = self.collections.lock().unwrap();
        if collections.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        collections.insert(name.to_string(), HashMap::new());
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        // SAFETY: Mutex poisoning.
        let mut collections = self.collections.lock().unwrap();
        collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchCollection(name.to_string()))
    }

    async fn put(&self, collection: &str, key: &str, doc: &Document) -> Result<(), StoreError> {
        // SAFETY: Mutex poisoning.
        let mut collections = self.collections.lock().unwrap();
        let Some(documents) = collections.get_mut(collection) else {
            return Err(StoreError::NoSuchCollection(collection.to_string()));
        };
        documents.insert(key.to_string(), doc.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        // SAFETY: Mutex poisoning.
        let collections = self.collections.lock().unwrap();
        let Some(documents) = collections.get(collection) else {
            return Err(StoreError::NoSuchCollection(collection.to_string()));
        };
        Ok(documents.get(key).cloned())
    }
}

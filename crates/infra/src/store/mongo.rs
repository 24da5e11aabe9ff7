//! MongoDB job backend (`mongodb` feature).
//!
//! Documents use the camelCase shape of [`Job`]. Indexes: `(status, createdAt)`,
//! `(type, status)` and a unique `jobId`.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::Deserialize;
use tracing::{debug, info};

use jobqueue_core::{Job, JobFilter, JobId, JobPatch, JobStatus, StatusTypeCount};

use super::{JobBackend, Page, StoreError};

const DUPLICATE_KEY_CODE: i32 = 11000;

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<bson::ser::Error> for StoreError {
    fn from(err: bson::ser::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for StoreError {
    fn from(err: bson::de::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY_CODE
    )
}

/// Translate a [`JobFilter`] into a query document.
pub fn filter_document(filter: &JobFilter) -> Document {
    let mut query = Document::new();
    if let Some(job_id) = &filter.job_id {
        query.insert("jobId", job_id.as_str());
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<Bson> = filter
            .statuses
            .iter()
            .map(|s| Bson::String(s.as_str().to_string()))
            .collect();
        query.insert("status", doc! { "$in": statuses });
    }
    if let Some(job_type) = &filter.job_type {
        query.insert("type", job_type.as_str());
    }
    if let Some(cutoff) = filter.created_before {
        query.insert("createdAt", doc! { "$lt": bson::DateTime::from_chrono(cutoff) });
    }
    query
}

#[derive(Debug, Deserialize)]
struct GroupKey {
    status: JobStatus,
    #[serde(rename = "type")]
    job_type: String,
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    #[serde(rename = "_id")]
    key: GroupKey,
    count: i64,
}

/// MongoDB-backed [`JobBackend`].
#[derive(Debug, Clone)]
pub struct MongoJobBackend {
    database: Database,
    collection: Collection<Job>,
}

impl MongoJobBackend {
    /// Parse the URI and bind to `database.collection`. A database named in the
    /// URI wins over `database`.
    ///
    /// Does not open a connection; reachability is established by
    /// [`JobBackend::ping`].
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let options = ClientOptions::parse(uri).await?;
        let database = options
            .default_database
            .clone()
            .unwrap_or_else(|| database.to_string());
        let client = Client::with_options(options)?;
        Ok(Self::from_client(&client, &database, collection))
    }

    pub fn from_client(client: &Client, database: &str, collection: &str) -> Self {
        let database = client.database(database);
        let collection = database.collection(collection);
        Self {
            database,
            collection,
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "status": 1, "createdAt": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "type": 1, "status": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "jobId": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        ];
        self.collection.create_indexes(indexes, None).await?;
        info!(collection = %self.collection.name(), "job indexes ensured");
        Ok(())
    }
}

#[async_trait]
impl JobBackend for MongoJobBackend {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        match self.collection.insert_one(job, None).await {
            Ok(_) => {
                debug!(job_id = %job.job_id, "job document inserted");
                Ok(())
            }
            Err(err) if is_duplicate_key(&err) => Err(StoreError::DuplicateKey(job.job_id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> Result<bool, StoreError> {
        // Only move forward: documents written before versioning count as 0.
        let filter = doc! {
            "jobId": job_id.as_str(),
            "$or": [
                { "version": { "$lt": patch.version as i64 } },
                { "version": { "$exists": false } },
            ],
        };
        let update = doc! { "$set": bson::to_document(patch)? };
        let result = self.collection.update_one(filter, update, None).await?;
        Ok(result.modified_count > 0)
    }

    async fn find_one(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .collection
            .find_one(doc! { "jobId": job_id.as_str() }, None)
            .await?)
    }

    async fn find(&self, filter: &JobFilter, page: Page) -> Result<Vec<Job>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "createdAt": -1, "jobId": 1 })
            .skip(Some(page.offset as u64))
            .limit(page.limit.map(|l| l as i64))
            .build();
        let cursor = self.collection.find(filter_document(filter), options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn aggregate_stats(&self) -> Result<Vec<StatusTypeCount>, StoreError> {
        let pipeline = vec![doc! {
            "$group": {
                "_id": { "status": "$status", "type": "$type" },
                "count": { "$sum": 1 },
            }
        }];
        let rows: Vec<Document> = self
            .collection
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;

        rows.into_iter()
            .map(|row| {
                let row: GroupRow = bson::from_document(row)?;
                Ok(StatusTypeCount {
                    status: row.key.status,
                    job_type: row.key.job_type,
                    count: row.count.max(0) as u64,
                })
            })
            .collect()
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let result = self
            .collection
            .delete_many(filter_document(filter), None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.database.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The driver disconnects when the last client handle is dropped.
        Ok(())
    }
}

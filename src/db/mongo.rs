// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! MongoDB client wrapper with typed prediction operations.
//!
//! The database is optional at runtime. When the server cannot be reached
//! at startup the wrapper stays offline and every operation returns
//! [`AppError::Database`], so prediction keeps working without storage.

use crate::config::MongoSettings;
use crate::db::collections;
use crate::error::AppError;
use crate::models::{Emotion, EmotionGroup, PredictionRecord, PredictionStats};
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc, oid::ObjectId, Document};
use mongodb::options::{ClientOptions, Tls, TlsOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use std::time::Duration;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// MongoDB database handle.
#[derive(Clone)]
pub struct MongoDb {
    database: Option<Database>,
}

impl MongoDb {
    /// Connect, verify the server answers and ensure indexes exist.
    ///
    /// Any failure is logged and yields an offline handle.
    pub async fn connect(settings: &MongoSettings) -> Self {
        match Self::try_connect(settings).await {
            Ok(database) => {
                tracing::info!(
                    database = %settings.database,
                    tls = settings.require_tls,
                    "Connected to MongoDB"
                );
                Self {
                    database: Some(database),
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "MongoDB not available, predictions will not be persisted"
                );
                Self::new_offline()
            }
        }
    }

    async fn try_connect(settings: &MongoSettings) -> Result<Database, mongodb::error::Error> {
        let mut options = ClientOptions::parse(&settings.url).await?;
        if settings.require_tls && !matches!(options.tls, Some(Tls::Enabled(_))) {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        options
            .server_selection_timeout
            .get_or_insert(SERVER_SELECTION_TIMEOUT);
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());

        let client = Client::with_options(options)?;
        let database = client.database(&settings.database);
        database.run_command(doc! { "ping": 1 }).await?;

        let predictions = database.collection::<Document>(collections::PREDICTIONS);
        predictions
            .create_indexes([
                IndexModel::builder().keys(doc! { "created_at": -1 }).build(),
                IndexModel::builder().keys(doc! { "emotion": 1 }).build(),
                IndexModel::builder().keys(doc! { "model_type": 1 }).build(),
            ])
            .await?;

        Ok(database)
    }

    /// Offline handle for testing or when MongoDB is unreachable.
    ///
    /// All database operations will return an error if called.
    pub fn new_offline() -> Self {
        Self { database: None }
    }

    pub fn is_connected(&self) -> bool {
        self.database.is_some()
    }

    fn predictions(&self) -> Result<Collection<PredictionRecord>, AppError> {
        self.database
            .as_ref()
            .map(|db| db.collection(collections::PREDICTIONS))
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    /// Store a prediction and return its new id.
    pub async fn insert_prediction(&self, record: &PredictionRecord) -> Result<ObjectId, AppError> {
        let result = self
            .predictions()?
            .insert_one(record)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        result.inserted_id.as_object_id().ok_or_else(|| {
            AppError::Database(format!(
                "Unexpected inserted id type: {:?}",
                result.inserted_id
            ))
        })
    }

    /// Get a prediction by id.
    pub async fn get_prediction(&self, id: &ObjectId) -> Result<Option<PredictionRecord>, AppError> {
        self.predictions()?
            .find_one(doc! { "_id": *id })
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// List predictions newest first, optionally restricted to one emotion.
    pub async fn list_predictions(
        &self,
        emotion: Option<Emotion>,
        skip: u64,
        limit: i64,
    ) -> Result<Vec<PredictionRecord>, AppError> {
        let filter = match emotion {
            Some(emotion) => doc! { "emotion": emotion.as_str() },
            None => doc! {},
        };

        self.predictions()?
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .skip(skip)
            .limit(limit)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Aggregate statistics over every stored prediction.
    pub async fn prediction_stats(&self) -> Result<PredictionStats, AppError> {
        let pipeline = [doc! {
            "$group": {
                "_id": "$emotion",
                "count": { "$sum": 1 },
                "confidence_sum": { "$sum": "$confidence" },
                "processing_time_sum": { "$sum": "$processing_time" },
                "last_prediction": { "$max": "$created_at" },
            }
        }];

        let documents: Vec<Document> = self
            .predictions()?
            .aggregate(pipeline)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut groups = Vec::with_capacity(documents.len());
        for document in documents {
            match bson::from_document::<EmotionGroup>(document) {
                Ok(group) => groups.push(group),
                // Documents written by other tools may carry unknown labels
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable emotion group"),
            }
        }

        Ok(PredictionStats::from_groups(&groups))
    }
}

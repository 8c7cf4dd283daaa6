//! Storage collaborator for the reconciler: the `LifecycleStore` contract, a
//! Postgres implementation and an in-memory one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use lifecycle_core::{
    Campaign, CampaignId, CampaignStatus, InfluencerId, Participation, ParticipationStatus,
    RowKey, StoredInstant, StoredStatus,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "lifecycle-storage";

pub const CAMPAIGNS_TABLE: &str = "campaigns";
pub const PARTICIPATIONS_TABLE: &str = "influencer_campaigns";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    RowNotFound(RowKey),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A row that was read but could not be decoded. `key` is absent when the
/// key columns themselves are unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableRow {
    pub table: &'static str,
    pub key: Option<RowKey>,
    pub column: &'static str,
    pub message: String,
}

impl fmt::Display for UndecodableRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{key}"),
            None => write!(f, "{} row", self.table),
        }?;
        write!(f, ": cannot decode {}: {}", self.column, self.message)
    }
}

/// Result of listing one table: decoded rows plus the rows that were not.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub rows: Vec<T>,
    pub undecodable: Vec<UndecodableRow>,
}

impl<T> Listing<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows,
            undecodable: Vec::new(),
        }
    }
}

/// Everything the reconciler needs from persistence. Row-level update
/// atomicity is the only isolation assumed.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn list_campaigns(&self) -> Result<Listing<Campaign>, StorageError>;

    async fn list_participations(&self) -> Result<Listing<Participation>, StorageError>;

    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StorageError>;

    async fn update_participation_status(
        &self,
        influencer_id: InfluencerId,
        campaign_id: CampaignId,
        status: ParticipationStatus,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgLifecycleStore {
    pool: PgPool,
}

impl PgLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LifecycleStore for PgLifecycleStore {
    #[tracing::instrument(skip(self))]
    async fn list_campaigns(&self) -> Result<Listing<Campaign>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT campaign_id::bigint AS campaign_id,
                   start_date,
                   end_date,
                   COALESCE(status::text, '') AS status
              FROM campaigns
             ORDER BY campaign_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut listing = Listing::new(Vec::with_capacity(rows.len()));
        for row in rows {
            match decode_campaign(&row) {
                Ok(campaign) => listing.rows.push(campaign),
                Err(err) => {
                    let key = row
                        .try_get::<CampaignId, _>("campaign_id")
                        .ok()
                        .map(|campaign_id| RowKey::Campaign { campaign_id });
                    listing.undecodable.push(err.into_row(CAMPAIGNS_TABLE, key));
                }
            }
        }
        debug!(
            rows = listing.rows.len(),
            undecodable = listing.undecodable.len(),
            "loaded campaigns"
        );
        Ok(listing)
    }

    #[tracing::instrument(skip(self))]
    async fn list_participations(&self) -> Result<Listing<Participation>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT influencer_id::bigint AS influencer_id,
                   campaign_id::bigint AS campaign_id,
                   start_date,
                   deadline,
                   submission_url,
                   COALESCE(campaign_status::text, '') AS campaign_status
              FROM influencer_campaigns
             ORDER BY campaign_id, influencer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut listing = Listing::new(Vec::with_capacity(rows.len()));
        for row in rows {
            match decode_participation(&row) {
                Ok(participation) => listing.rows.push(participation),
                Err(err) => {
                    let key = match (
                        row.try_get::<InfluencerId, _>("influencer_id"),
                        row.try_get::<CampaignId, _>("campaign_id"),
                    ) {
                        (Ok(influencer_id), Ok(campaign_id)) => Some(RowKey::Participation {
                            influencer_id,
                            campaign_id,
                        }),
                        _ => None,
                    };
                    listing
                        .undecodable
                        .push(err.into_row(PARTICIPATIONS_TABLE, key));
                }
            }
        }
        debug!(
            rows = listing.rows.len(),
            undecodable = listing.undecodable.len(),
            "loaded participations"
        );
        Ok(listing)
    }

    #[tracing::instrument(skip(self))]
    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE campaigns SET status = $1 WHERE campaign_id = $2")
            .bind(status.as_str())
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RowNotFound(RowKey::Campaign { campaign_id }));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_participation_status(
        &self,
        influencer_id: InfluencerId,
        campaign_id: CampaignId,
        status: ParticipationStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE influencer_campaigns
               SET campaign_status = $1
             WHERE influencer_id = $2
               AND campaign_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(influencer_id)
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RowNotFound(RowKey::Participation {
                influencer_id,
                campaign_id,
            }));
        }
        Ok(())
    }
}

struct ColumnError {
    column: &'static str,
    message: String,
}

impl ColumnError {
    fn into_row(self, table: &'static str, key: Option<RowKey>) -> UndecodableRow {
        UndecodableRow {
            table,
            key,
            column: self.column,
            message: self.message,
        }
    }
}

fn column<'r, T>(row: &'r PgRow, column: &'static str) -> Result<T, ColumnError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|err| ColumnError {
        column,
        message: err.to_string(),
    })
}

fn decode_campaign(row: &PgRow) -> Result<Campaign, ColumnError> {
    let status: String = column(row, "status")?;
    Ok(Campaign {
        campaign_id: column(row, "campaign_id")?,
        start_date: decode_instant(row, "start_date")?,
        end_date: decode_instant(row, "end_date")?,
        status: StoredStatus::parse(&status),
    })
}

fn decode_participation(row: &PgRow) -> Result<Participation, ColumnError> {
    let status: String = column(row, "campaign_status")?;
    Ok(Participation {
        influencer_id: column(row, "influencer_id")?,
        campaign_id: column(row, "campaign_id")?,
        start_date: decode_instant(row, "start_date")?,
        deadline: decode_instant(row, "deadline")?,
        submission_url: column(row, "submission_url")?,
        campaign_status: StoredStatus::parse(&status),
    })
}

/// Read a nullable `TIMESTAMP`, `TIMESTAMPTZ` or `DATE` column.
fn decode_instant(row: &PgRow, name: &'static str) -> Result<Option<StoredInstant>, ColumnError> {
    if let Ok(value) = row.try_get::<Option<NaiveDateTime>, _>(name) {
        return Ok(value.map(StoredInstant::Naive));
    }
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(name) {
        return Ok(value.map(StoredInstant::from));
    }
    let date: Option<NaiveDate> = column(row, name)?;
    Ok(date.map(|date| StoredInstant::Naive(date.and_time(NaiveTime::MIN))))
}

/// In-process store used by tests. Failures can be injected per row, for
/// whole listings, or as rows that fail to decode.
#[derive(Debug, Clone, Default)]
pub struct MemoryLifecycleStore {
    state: Arc<Mutex<MemoryState>>,
    fail_listing: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    campaigns: BTreeMap<CampaignId, Campaign>,
    participations: BTreeMap<(InfluencerId, CampaignId), Participation>,
    failing: HashSet<RowKey>,
    undecodable: Vec<UndecodableRow>,
}

impl MemoryState {
    fn undecodable_in(&self, table: &str) -> Vec<UndecodableRow> {
        self.undecodable
            .iter()
            .filter(|row| row.table == table)
            .cloned()
            .collect()
    }
}

impl MemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        let mut state = self.state.lock().await;
        state.campaigns.insert(campaign.campaign_id, campaign);
    }

    pub async fn insert_participation(&self, participation: Participation) {
        let mut state = self.state.lock().await;
        state.participations.insert(
            (participation.influencer_id, participation.campaign_id),
            participation,
        );
    }

    pub async fn campaign(&self, campaign_id: CampaignId) -> Option<Campaign> {
        self.state.lock().await.campaigns.get(&campaign_id).cloned()
    }

    pub async fn participation(
        &self,
        influencer_id: InfluencerId,
        campaign_id: CampaignId,
    ) -> Option<Participation> {
        self.state
            .lock()
            .await
            .participations
            .get(&(influencer_id, campaign_id))
            .cloned()
    }

    /// Report a row of `row.table` as undecodable on every listing.
    pub async fn insert_undecodable(&self, row: UndecodableRow) {
        self.state.lock().await.undecodable.push(row);
    }

    /// Make every update of `key` fail until cleared.
    pub async fn fail_updates_for(&self, key: RowKey) {
        self.state.lock().await.failing.insert(key);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
        self.fail_listing.store(false, Ordering::SeqCst);
    }

    /// Make both list calls fail, as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_listing.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful status writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    async fn list_campaigns(&self) -> Result<Listing<Campaign>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(Listing {
            rows: state.campaigns.values().cloned().collect(),
            undecodable: state.undecodable_in(CAMPAIGNS_TABLE),
        })
    }

    async fn list_participations(&self) -> Result<Listing<Participation>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(Listing {
            rows: state.participations.values().cloned().collect(),
            undecodable: state.undecodable_in(PARTICIPATIONS_TABLE),
        })
    }

    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StorageError> {
        let key = RowKey::Campaign { campaign_id };
        let mut state = self.state.lock().await;
        if state.failing.contains(&key) {
            return Err(StorageError::Unavailable(format!("injected failure for {key}")));
        }
        let campaign = state
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(StorageError::RowNotFound(key))?;
        campaign.status = StoredStatus::Known(status);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_participation_status(
        &self,
        influencer_id: InfluencerId,
        campaign_id: CampaignId,
        status: ParticipationStatus,
    ) -> Result<(), StorageError> {
        let key = RowKey::Participation {
            influencer_id,
            campaign_id,
        };
        let mut state = self.state.lock().await;
        if state.failing.contains(&key) {
            return Err(StorageError::Unavailable(format!("injected failure for {key}")));
        }
        let participation = state
            .participations
            .get_mut(&(influencer_id, campaign_id))
            .ok_or(StorageError::RowNotFound(key))?;
        participation.campaign_status = StoredStatus::Known(status);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

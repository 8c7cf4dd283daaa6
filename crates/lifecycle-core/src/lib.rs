//! Core domain model, time normalization and status resolution for campaign lifecycles.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lifecycle-core";

pub type CampaignId = i64;
pub type InfluencerId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid reference offset {0:?}, expected +HH:MM or -HH:MM")]
    InvalidOffset(String),
    #[error("window starts at {start} after it ends at {end}")]
    InvertedWindow {
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    },
    #[error("missing {0}")]
    MissingTimestamp(&'static str),
    #[error("timestamp {0} cannot be placed in the reference zone")]
    OutOfRange(NaiveDateTime),
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
}

/// Status of a top-level campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Upcoming,
    Active,
    Expired,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Upcoming => "upcoming",
            CampaignStatus::Active => "active",
            CampaignStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // exact match only; anything else is rewritten by the next pass
        match s {
            "upcoming" => Ok(CampaignStatus::Upcoming),
            "active" => Ok(CampaignStatus::Active),
            "expired" => Ok(CampaignStatus::Expired),
            _ => Err(LifecycleError::UnknownStatus(s.to_string())),
        }
    }
}

/// Status of one influencer's participation in a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipationStatus {
    SubmissionDue,
    Live,
    Rejected,
    Past,
    Expired,
}

impl ParticipationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipationStatus::SubmissionDue => "submissiondue",
            ParticipationStatus::Live => "live",
            ParticipationStatus::Rejected => "rejected",
            ParticipationStatus::Past => "past",
            ParticipationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ParticipationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipationStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submissiondue" => Ok(ParticipationStatus::SubmissionDue),
            "live" => Ok(ParticipationStatus::Live),
            "rejected" => Ok(ParticipationStatus::Rejected),
            "past" => Ok(ParticipationStatus::Past),
            "expired" => Ok(ParticipationStatus::Expired),
            _ => Err(LifecycleError::UnknownStatus(s.to_string())),
        }
    }
}

/// Status value as read from storage. Values written by other parts of the
/// system that this crate does not recognise are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredStatus<S> {
    Known(S),
    Unknown(String),
}

impl<S: FromStr> StoredStatus<S> {
    pub fn parse(raw: &str) -> Self {
        match raw.parse() {
            Ok(status) => StoredStatus::Known(status),
            Err(_) => StoredStatus::Unknown(raw.to_string()),
        }
    }
}

impl<S: PartialEq> StoredStatus<S> {
    pub fn is(&self, status: &S) -> bool {
        matches!(self, StoredStatus::Known(stored) if stored == status)
    }
}

impl<S: fmt::Display> fmt::Display for StoredStatus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredStatus::Known(status) => write!(f, "{status}"),
            StoredStatus::Unknown(raw) => write!(f, "{raw:?}"),
        }
    }
}

impl<S> From<S> for StoredStatus<S> {
    fn from(status: S) -> Self {
        StoredStatus::Known(status)
    }
}

/// A timestamp as it was persisted: either wall-clock time with no zone
/// attached, or an instant carrying its own offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredInstant {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
}

impl From<NaiveDateTime> for StoredInstant {
    fn from(value: NaiveDateTime) -> Self {
        StoredInstant::Naive(value)
    }
}

impl From<DateTime<FixedOffset>> for StoredInstant {
    fn from(value: DateTime<FixedOffset>) -> Self {
        StoredInstant::Aware(value)
    }
}

impl From<DateTime<Utc>> for StoredInstant {
    fn from(value: DateTime<Utc>) -> Self {
        StoredInstant::Aware(value.fixed_offset())
    }
}

/// The single civil zone every comparison happens in.
///
/// Naive stored timestamps are read as wall-clock time in this zone; aware
/// timestamps and "now" are converted into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl ReferenceZone {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
    pub fn parse(input: &str) -> Result<Self, LifecycleError> {
        let invalid = || LifecycleError::InvalidOffset(input.to_string());
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
            return Ok(Self::utc());
        }

        let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
            (1, rest)
        } else if let Some(rest) = trimmed.strip_prefix('-') {
            (-1, rest)
        } else {
            return Err(invalid());
        };
        let digits = rest.replace(':', "");
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
        if minutes >= 60 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self::new)
            .ok_or_else(invalid)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn normalize(&self, instant: StoredInstant) -> Result<DateTime<FixedOffset>, LifecycleError> {
        match instant {
            StoredInstant::Naive(naive) => match naive.and_local_timezone(self.offset) {
                LocalResult::Single(local) => Ok(local),
                _ => Err(LifecycleError::OutOfRange(naive)),
            },
            StoredInstant::Aware(aware) => Ok(aware.with_timezone(&self.offset)),
        }
    }

    /// Normalize a nullable column, naming the column when it is empty.
    pub fn normalize_required(
        &self,
        instant: Option<StoredInstant>,
        column: &'static str,
    ) -> Result<DateTime<FixedOffset>, LifecycleError> {
        self.normalize(instant.ok_or(LifecycleError::MissingTimestamp(column))?)
    }

    pub fn now(&self, clock: &dyn Clock) -> DateTime<FixedOffset> {
        clock.now().with_timezone(&self.offset)
    }
}

impl fmt::Display for ReferenceZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.offset)
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Identity of a reconciled row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum RowKey {
    Campaign {
        campaign_id: CampaignId,
    },
    Participation {
        influencer_id: InfluencerId,
        campaign_id: CampaignId,
    },
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Campaign { campaign_id } => write!(f, "campaign {campaign_id}"),
            RowKey::Participation {
                influencer_id,
                campaign_id,
            } => write!(f, "participation {influencer_id}/{campaign_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: CampaignId,
    pub start_date: Option<StoredInstant>,
    pub end_date: Option<StoredInstant>,
    pub status: StoredStatus<CampaignStatus>,
}

impl Campaign {
    pub fn key(&self) -> RowKey {
        RowKey::Campaign {
            campaign_id: self.campaign_id,
        }
    }

    pub fn resolve(
        &self,
        zone: &ReferenceZone,
        now: DateTime<FixedOffset>,
    ) -> Result<CampaignStatus, LifecycleError> {
        let start = zone.normalize_required(self.start_date, "start_date")?;
        let end = zone.normalize_required(self.end_date, "end_date")?;
        resolve_campaign_status(start, end, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub influencer_id: InfluencerId,
    pub campaign_id: CampaignId,
    pub start_date: Option<StoredInstant>,
    pub deadline: Option<StoredInstant>,
    pub submission_url: Option<String>,
    pub campaign_status: StoredStatus<ParticipationStatus>,
}

impl Participation {
    pub fn key(&self) -> RowKey {
        RowKey::Participation {
            influencer_id: self.influencer_id,
            campaign_id: self.campaign_id,
        }
    }

    /// A blank URL counts as no submission.
    pub fn has_submission(&self) -> bool {
        self.submission_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    pub fn resolve(
        &self,
        zone: &ReferenceZone,
        now: DateTime<FixedOffset>,
    ) -> Result<ParticipationStatus, LifecycleError> {
        let start = zone.normalize_required(self.start_date, "start_date")?;
        let deadline = zone.normalize_required(self.deadline, "deadline")?;
        resolve_participation_status(start, deadline, self.has_submission(), now)
    }
}

/// Derive a campaign's status from its window. First matching rule wins.
pub fn resolve_campaign_status(
    start: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> Result<CampaignStatus, LifecycleError> {
    if start > end {
        return Err(LifecycleError::InvertedWindow { start, end });
    }

    let status = if now < start {
        CampaignStatus::Upcoming
    } else if now <= end {
        CampaignStatus::Active
    } else {
        CampaignStatus::Expired
    };
    Ok(status)
}

/// Derive a participation's status from its window and whether work was
/// delivered. Evaluated top to bottom, first match wins; the stored status
/// is never consulted.
pub fn resolve_participation_status(
    start: DateTime<FixedOffset>,
    deadline: DateTime<FixedOffset>,
    has_submission: bool,
    now: DateTime<FixedOffset>,
) -> Result<ParticipationStatus, LifecycleError> {
    if start > deadline {
        return Err(LifecycleError::InvertedWindow {
            start,
            end: deadline,
        });
    }

    let in_window = start <= now && now <= deadline;
    let past_deadline = now > deadline;

    let status = if now < start {
        ParticipationStatus::SubmissionDue
    } else if in_window && has_submission {
        ParticipationStatus::Live
    } else if in_window {
        ParticipationStatus::SubmissionDue
    } else if past_deadline && !has_submission {
        ParticipationStatus::Rejected
    } else if past_deadline {
        ParticipationStatus::Past
    } else {
        // unreachable for ordered instants; kept as the table's default row
        ParticipationStatus::Expired
    };
    Ok(status)
}

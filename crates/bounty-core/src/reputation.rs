use crate::amount::Amount;
use crate::error::BountyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Deposit tier derived from a sender's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositTier {
    Standard,
    Reduced,
    Minimal,
    /// Manual override, never reached or cleared by the automatic rule.
    Trusted,
}

impl DepositTier {
    /// Automatic rule over the counters.
    ///
    /// Accuracy thresholds compare in integers: `accepted / total >= 0.90`
    /// is `accepted * 100 >= total * 90`.
    pub fn derive(total: u64, accepted: u64) -> Self {
        let scaled = u128::from(accepted) * 100;
        let total_wide = u128::from(total);
        if total >= 50 && scaled >= total_wide * 90 {
            Self::Minimal
        } else if total >= 10 && scaled >= total_wide * 80 {
            Self::Reduced
        } else {
            Self::Standard
        }
    }

    /// Deposit multiplier in basis points of 10_000.
    pub fn multiplier_bps(self) -> u32 {
        match self {
            Self::Trusted => 0,
            Self::Minimal => 1_000,
            Self::Reduced => 5_000,
            Self::Standard => 10_000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Reduced => "reduced",
            Self::Minimal => "minimal",
            Self::Trusted => "trusted",
        }
    }
}

impl fmt::Display for DepositTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DepositTier {
    type Err = BountyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "standard" => Ok(Self::Standard),
            "reduced" => Ok(Self::Reduced),
            "minimal" => Ok(Self::Minimal),
            "trusted" => Ok(Self::Trusted),
            other => Err(BountyError::Validation(format!("unknown tier '{other}'"))),
        }
    }
}

/// Scale a base deposit by the tier multiplier, rounding down.
pub fn required_deposit(base: &Amount, tier: DepositTier) -> Amount {
    base.scale_bps(tier.multiplier_bps())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub sender_pubkey: String,
    pub total_reports: u64,
    pub accepted_count: u64,
    pub rejected_count: u64,
    pub last_activity_at: DateTime<Utc>,
    pub trusted: bool,
    pub tier: DepositTier,
}

impl ReputationRecord {
    fn empty(sender_pubkey: &str) -> Self {
        Self {
            sender_pubkey: sender_pubkey.to_string(),
            total_reports: 0,
            accepted_count: 0,
            rejected_count: 0,
            last_activity_at: Utc::now(),
            trusted: false,
            tier: DepositTier::Standard,
        }
    }

    /// Tier as the counters and override currently imply.
    pub fn effective_tier(&self) -> DepositTier {
        if self.trusted {
            DepositTier::Trusted
        } else {
            DepositTier::derive(self.total_reports, self.accepted_count)
        }
    }
}

/// Per-sender counters sharing the report repository's database.
#[derive(Debug, Clone)]
pub struct ReputationLedger {
    pool: SqlitePool,
}

enum Counter {
    Report,
    Accepted,
    Rejected,
}

impl Counter {
    /// Single-statement increment; concurrent bumps never read a stale row.
    fn upsert_sql(&self) -> &'static str {
        match self {
            Self::Report => {
                r#"
                INSERT INTO reputation (sender_pubkey, total_reports, last_activity_at, tier)
                VALUES (?, 1, ?, 'standard')
                ON CONFLICT (sender_pubkey) DO UPDATE SET
                    total_reports = reputation.total_reports + 1,
                    last_activity_at = excluded.last_activity_at
                RETURNING *
                "#
            }
            Self::Accepted => {
                r#"
                INSERT INTO reputation (sender_pubkey, accepted_count, last_activity_at, tier)
                VALUES (?, 1, ?, 'standard')
                ON CONFLICT (sender_pubkey) DO UPDATE SET
                    accepted_count = reputation.accepted_count + 1,
                    last_activity_at = excluded.last_activity_at
                RETURNING *
                "#
            }
            Self::Rejected => {
                r#"
                INSERT INTO reputation (sender_pubkey, rejected_count, last_activity_at, tier)
                VALUES (?, 1, ?, 'standard')
                ON CONFLICT (sender_pubkey) DO UPDATE SET
                    rejected_count = reputation.rejected_count + 1,
                    last_activity_at = excluded.last_activity_at
                RETURNING *
                "#
            }
        }
    }
}

impl ReputationLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, sender_pubkey: &str) -> Result<Option<ReputationRecord>, BountyError> {
        let row = sqlx::query("SELECT * FROM reputation WHERE sender_pubkey = ?")
            .bind(sender_pubkey)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BountyError::Storage(format!("reputation load failed: {e}")))?;
        row.as_ref().map(decode_record).transpose()
    }

    /// Record or a fresh standard-tier record when the sender is unknown.
    pub async fn get_or_default(&self, sender_pubkey: &str) -> Result<ReputationRecord, BountyError> {
        Ok(self
            .get(sender_pubkey)
            .await?
            .unwrap_or_else(|| ReputationRecord::empty(sender_pubkey)))
    }

    pub async fn record_report(&self, sender_pubkey: &str) -> Result<ReputationRecord, BountyError> {
        self.bump(sender_pubkey, Counter::Report).await
    }

    pub async fn record_accepted(&self, sender_pubkey: &str) -> Result<ReputationRecord, BountyError> {
        self.bump(sender_pubkey, Counter::Accepted).await
    }

    pub async fn record_rejected(&self, sender_pubkey: &str) -> Result<ReputationRecord, BountyError> {
        self.bump(sender_pubkey, Counter::Rejected).await
    }

    /// Set or clear the manual trusted override.
    pub async fn set_trusted(
        &self,
        sender_pubkey: &str,
        trusted: bool,
    ) -> Result<ReputationRecord, BountyError> {
        let mut tx = self.pool.begin().await.map_err(storage("reputation transaction failed"))?;
        let row = sqlx::query(
            r#"
            INSERT INTO reputation (sender_pubkey, last_activity_at, trusted, tier)
            VALUES (?, ?, ?, 'standard')
            ON CONFLICT (sender_pubkey) DO UPDATE SET trusted = excluded.trusted
            RETURNING *
            "#,
        )
        .bind(sender_pubkey)
        .bind(Utc::now())
        .bind(trusted)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage("reputation override failed"))?;
        let mut record = decode_record(&row)?;
        record.tier = record.effective_tier();
        store_tier(&mut tx, &record).await?;
        tx.commit().await.map_err(storage("reputation commit failed"))?;

        info!(sender = sender_pubkey, trusted, tier = %record.tier, "trusted override updated");
        Ok(record)
    }

    pub async fn tier(&self, sender_pubkey: &str) -> Result<DepositTier, BountyError> {
        Ok(self.get_or_default(sender_pubkey).await?.effective_tier())
    }

    /// Increment one counter and re-derive the tier in one transaction.
    async fn bump(&self, sender_pubkey: &str, counter: Counter) -> Result<ReputationRecord, BountyError> {
        let mut tx = self.pool.begin().await.map_err(storage("reputation transaction failed"))?;
        let row = sqlx::query(counter.upsert_sql())
            .bind(sender_pubkey)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage("reputation update failed"))?;
        let mut record = decode_record(&row)?;

        let previous = record.tier;
        record.tier = record.effective_tier();
        if previous != record.tier {
            store_tier(&mut tx, &record).await?;
        }
        tx.commit().await.map_err(storage("reputation commit failed"))?;

        if previous != record.tier {
            info!(sender = sender_pubkey, from = %previous, to = %record.tier, "deposit tier changed");
        }
        Ok(record)
    }
}

async fn store_tier(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ReputationRecord,
) -> Result<(), BountyError> {
    sqlx::query("UPDATE reputation SET tier = ? WHERE sender_pubkey = ?")
        .bind(record.tier.name())
        .bind(&record.sender_pubkey)
        .execute(&mut **tx)
        .await
        .map_err(storage("reputation tier update failed"))?;
    Ok(())
}

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> BountyError {
    move |e| BountyError::Storage(format!("{context}: {e}"))
}

fn decode_record(row: &SqliteRow) -> Result<ReputationRecord, BountyError> {
    let decode = |e: sqlx::Error| BountyError::Storage(format!("reputation decode failed: {e}"));
    let total: i64 = row.try_get("total_reports").map_err(decode)?;
    let accepted: i64 = row.try_get("accepted_count").map_err(decode)?;
    let rejected: i64 = row.try_get("rejected_count").map_err(decode)?;
    let tier: String = row.try_get("tier").map_err(decode)?;

    Ok(ReputationRecord {
        sender_pubkey: row.try_get("sender_pubkey").map_err(decode)?,
        total_reports: total.max(0) as u64,
        accepted_count: accepted.max(0) as u64,
        rejected_count: rejected.max(0) as u64,
        last_activity_at: row.try_get("last_activity_at").map_err(decode)?,
        trusted: row.try_get("trusted").map_err(decode)?,
        tier: DepositTier::from_str(&tier)?,
    })
}

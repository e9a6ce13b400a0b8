use crate::amount::Amount;
use crate::error::BountyError;
use crate::flow::{Direction, ReportStatus, ResponseType};
use crate::types::{
    IdempotencyKey, PaymentArtifact, PaymentRecord, PaymentStatus, Report, ReportFilter, Response,
};
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Report repository backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReportStorageConfig {
    /// Process-local SQLite database, lost on exit.
    #[default]
    Memory,
    /// SQLite database file (WAL mode).
    Sqlite { path: PathBuf },
}

impl ReportStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite { path: path.into() }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

/// Persisted reports, responses, payment records, block list, and sync
/// cursors.
///
/// The pool holds exactly one connection, which makes it the single
/// serialized write path: no two writers touch the same row concurrently.
#[derive(Debug, Clone)]
pub struct ReportRepository {
    pool: SqlitePool,
    backend: &'static str,
}

fn db(context: &'static str) -> impl FnOnce(sqlx::Error) -> BountyError {
    move |e| BountyError::Storage(format!("{context}: {e}"))
}

impl ReportRepository {
    pub async fn connect(config: &ReportStorageConfig) -> Result<Self, BountyError> {
        let options = match config {
            ReportStorageConfig::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(db("sqlite memory options"))?,
            ReportStorageConfig::Sqlite { path } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
            }
        }
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db("sqlite connect failed"))?;

        let repository = Self {
            pool,
            backend: config.label(),
        };
        repository.ensure_schema().await?;
        Ok(repository)
    }

    pub fn backend_label(&self) -> &'static str {
        self.backend
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), BountyError> {
        // origin_event_id uniqueness is the primary dedup mechanism and lives
        // in the schema, not in application checks.
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                file_path TEXT NULL,
                description TEXT NOT NULL,
                suggested_fix TEXT NULL,
                sender_pubkey TEXT NOT NULL,
                sender_nametag TEXT NULL,
                recipient_pubkey TEXT NOT NULL,
                deposit_amount TEXT NOT NULL,
                deposit_coin TEXT NOT NULL,
                status TEXT NOT NULL,
                direction TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                origin_event_id TEXT NOT NULL UNIQUE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_reports_recipient_status ON reports (recipient_pubkey, status)",
            "CREATE INDEX IF NOT EXISTS idx_reports_sender ON reports (sender_pubkey)",
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                id TEXT PRIMARY KEY,
                report_id TEXT NOT NULL REFERENCES reports (id),
                response_type TEXT NOT NULL,
                message TEXT NULL,
                payout_amount TEXT NULL,
                responder_pubkey TEXT NOT NULL,
                created_at TEXT NOT NULL,
                origin_event_id TEXT NOT NULL UNIQUE
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_responses_report ON responses (report_id)",
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                idempotency_key TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                report_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                amount TEXT NOT NULL,
                coin TEXT NOT NULL,
                status TEXT NOT NULL,
                paid TEXT NOT NULL DEFAULT '0',
                proof_ref TEXT NULL,
                artifacts TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reputation (
                sender_pubkey TEXT PRIMARY KEY,
                total_reports INTEGER NOT NULL DEFAULT 0,
                accepted_count INTEGER NOT NULL DEFAULT 0,
                rejected_count INTEGER NOT NULL DEFAULT 0,
                last_activity_at TEXT NOT NULL,
                trusted INTEGER NOT NULL DEFAULT 0,
                tier TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS blocked_senders (
                pubkey TEXT PRIMARY KEY,
                blocked_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                inbox TEXT PRIMARY KEY,
                last_synced_at INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db("sqlite schema create failed"))?;
        }
        Ok(())
    }

    /// Insert a report. Returns `false` when the id or origin event id is
    /// already present.
    pub async fn insert_report(&self, report: &Report) -> Result<bool, BountyError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reports (
                id, repo_url, file_path, description, suggested_fix,
                sender_pubkey, sender_nametag, recipient_pubkey,
                deposit_amount, deposit_coin, status, direction,
                created_at, updated_at, origin_event_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&report.id)
        .bind(&report.repo_url)
        .bind(&report.file_path)
        .bind(&report.description)
        .bind(&report.suggested_fix)
        .bind(&report.sender_pubkey)
        .bind(&report.sender_nametag)
        .bind(&report.recipient_pubkey)
        .bind(report.deposit_amount.to_string())
        .bind(&report.deposit_coin)
        .bind(report.status.name())
        .bind(report.direction.name())
        .bind(report.created_at)
        .bind(report.updated_at)
        .bind(&report.origin_event_id)
        .execute(&self.pool)
        .await
        .map_err(db("report insert failed"))?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(report_id = %report.id, origin_event_id = %report.origin_event_id, "duplicate report suppressed");
        }
        Ok(inserted)
    }

    pub async fn get_report(&self, report_id: &str) -> Result<Option<Report>, BountyError> {
        let row = sqlx::query("SELECT * FROM reports WHERE id = ?")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db("report load failed"))?;
        row.as_ref().map(decode_report).transpose()
    }

    pub async fn report_exists(&self, report_id: &str) -> Result<bool, BountyError> {
        Ok(self.get_report(report_id).await?.is_some())
    }

    pub async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, BountyError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM reports WHERE 1 = 1");
        if let Some(inbox) = &filter.inbox {
            query.push(" AND recipient_pubkey = ").push_bind(inbox.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.name());
        }
        if let Some(direction) = filter.direction {
            query.push(" AND direction = ").push_bind(direction.name());
        }
        if let Some(sender) = &filter.sender {
            query.push(" AND sender_pubkey = ").push_bind(sender.clone());
        }
        query.push(" ORDER BY created_at DESC");
        query
            .push(" LIMIT ")
            .push_bind(i64::from(filter.limit.unwrap_or(100).min(1000)));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db("report list failed"))?;
        rows.iter().map(decode_report).collect()
    }

    pub async fn count_pending(&self, inbox: &str) -> Result<u64, BountyError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reports WHERE recipient_pubkey = ? AND status = 'pending' AND direction = 'received'",
        )
        .bind(inbox)
        .fetch_one(&self.pool)
        .await
        .map_err(db("pending count failed"))?;
        Ok(count.max(0) as u64)
    }

    /// Move a report from `expected_from` to `to`.
    ///
    /// The update is conditional on the current status, so two racing
    /// settlements cannot both succeed.
    pub async fn transition_status(
        &self,
        report_id: &str,
        expected_from: ReportStatus,
        to: ReportStatus,
    ) -> Result<(), BountyError> {
        expected_from.transition(to)?;

        let result = sqlx::query(
            "UPDATE reports SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.name())
        .bind(Utc::now())
        .bind(report_id)
        .bind(expected_from.name())
        .execute(&self.pool)
        .await
        .map_err(db("report status update failed"))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current = self
            .get_report(report_id)
            .await?
            .ok_or_else(|| BountyError::NotFound(format!("report '{report_id}'")))?;

        if expected_from == ReportStatus::Pending {
            Err(BountyError::AlreadySettled {
                report_id: report_id.to_string(),
                status: current.status.name().to_string(),
            })
        } else {
            Err(BountyError::illegal_transition(
                current.status.name(),
                to.name(),
            ))
        }
    }

    /// Insert a response. Returns `false` when its origin event id is known.
    pub async fn insert_response(&self, response: &Response) -> Result<bool, BountyError> {
        let result = response_insert(response)
            .execute(&self.pool)
            .await
            .map_err(db("response insert failed"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist a response together with the status move it implies, in one
    /// transaction. Returns `false` and changes nothing for a known event id.
    pub async fn apply_response(
        &self,
        response: &Response,
        transition: Option<(ReportStatus, ReportStatus)>,
    ) -> Result<bool, BountyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db("transaction begin failed"))?;

        let inserted = response_insert(response)
            .execute(&mut *tx)
            .await
            .map_err(db("response insert failed"))?
            .rows_affected()
            == 1;
        if !inserted {
            tx.rollback().await.map_err(db("transaction rollback failed"))?;
            return Ok(false);
        }

        if let Some((from, to)) = transition {
            from.transition(to)?;
            let updated = sqlx::query(
                "UPDATE reports SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(to.name())
            .bind(Utc::now())
            .bind(&response.report_id)
            .bind(from.name())
            .execute(&mut *tx)
            .await
            .map_err(db("report status update failed"))?;

            if updated.rows_affected() != 1 {
                tx.rollback().await.map_err(db("transaction rollback failed"))?;
                return Err(BountyError::AlreadySettled {
                    report_id: response.report_id.clone(),
                    status: "not pending".to_string(),
                });
            }
        }

        tx.commit().await.map_err(db("transaction commit failed"))?;
        Ok(true)
    }

    pub async fn response_exists(&self, origin_event_id: &str) -> Result<bool, BountyError> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT id FROM responses WHERE origin_event_id = ?")
                .bind(origin_event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("response lookup failed"))?;
        Ok(found.is_some())
    }

    pub async fn responses_for(&self, report_id: &str) -> Result<Vec<Response>, BountyError> {
        let rows = sqlx::query("SELECT * FROM responses WHERE report_id = ? ORDER BY created_at ASC")
            .bind(report_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db("response list failed"))?;
        rows.iter().map(decode_response).collect()
    }

    pub async fn payment(&self, key: &IdempotencyKey) -> Result<Option<PaymentRecord>, BountyError> {
        let row = sqlx::query("SELECT * FROM payments WHERE idempotency_key = ?")
            .bind(key.as_tag())
            .fetch_optional(&self.pool)
            .await
            .map_err(db("payment load failed"))?;
        row.as_ref().map(decode_payment).transpose()
    }

    /// Mark a payment attempt as in flight. A completed record is never
    /// downgraded, and once value has moved the recorded target, paid amount
    /// and artifacts are kept so a retry only pays the remainder.
    pub async fn begin_payment(
        &self,
        key: &IdempotencyKey,
        recipient: &str,
        amount: &Amount,
        coin: &str,
    ) -> Result<(), BountyError> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                idempotency_key, purpose, report_id, recipient, amount, coin, status, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 'in_flight', ?)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                status = 'in_flight',
                recipient = CASE WHEN payments.paid = '0' THEN excluded.recipient ELSE payments.recipient END,
                amount = CASE WHEN payments.paid = '0' THEN excluded.amount ELSE payments.amount END,
                coin = CASE WHEN payments.paid = '0' THEN excluded.coin ELSE payments.coin END,
                updated_at = excluded.updated_at
            WHERE payments.status != 'completed'
            "#,
        )
        .bind(key.as_tag())
        .bind(&key.purpose)
        .bind(&key.report_id)
        .bind(recipient)
        .bind(amount.to_string())
        .bind(coin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db("payment begin failed"))?;
        Ok(())
    }

    /// Record tokens that landed before an attempt stopped. `status` is
    /// `Partial` for a definite failure, `InFlight` when the last submission
    /// may still land.
    pub async fn record_partial(
        &self,
        key: &IdempotencyKey,
        status: PaymentStatus,
        paid: &Amount,
        proof_ref: Option<&str>,
        artifacts: &[PaymentArtifact],
    ) -> Result<(), BountyError> {
        let artifacts = serde_json::to_string(artifacts)?;
        sqlx::query(
            r#"
            UPDATE payments
            SET status = ?, paid = ?, proof_ref = ?, artifacts = ?, updated_at = ?
            WHERE idempotency_key = ? AND status != 'completed'
            "#,
        )
        .bind(status.name())
        .bind(paid.to_string())
        .bind(proof_ref)
        .bind(artifacts)
        .bind(Utc::now())
        .bind(key.as_tag())
        .execute(&self.pool)
        .await
        .map_err(db("payment progress update failed"))?;
        Ok(())
    }

    pub async fn complete_payment(
        &self,
        key: &IdempotencyKey,
        proof_ref: Option<&str>,
        artifacts: &[PaymentArtifact],
    ) -> Result<(), BountyError> {
        let artifacts = serde_json::to_string(artifacts)?;
        sqlx::query(
            "UPDATE payments SET status = 'completed', paid = amount, proof_ref = ?, artifacts = ?, updated_at = ? WHERE idempotency_key = ?",
        )
        .bind(proof_ref)
        .bind(artifacts)
        .bind(Utc::now())
        .bind(key.as_tag())
        .execute(&self.pool)
        .await
        .map_err(db("payment complete failed"))?;
        Ok(())
    }

    pub async fn fail_payment(&self, key: &IdempotencyKey) -> Result<(), BountyError> {
        sqlx::query(
            "UPDATE payments SET status = 'failed', updated_at = ? WHERE idempotency_key = ? AND status = 'in_flight'",
        )
        .bind(Utc::now())
        .bind(key.as_tag())
        .execute(&self.pool)
        .await
        .map_err(db("payment fail update failed"))?;
        Ok(())
    }

    pub async fn is_blocked(&self, pubkey: &str) -> Result<bool, BountyError> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT pubkey FROM blocked_senders WHERE pubkey = ?")
                .bind(pubkey)
                .fetch_optional(&self.pool)
                .await
                .map_err(db("block list lookup failed"))?;
        Ok(found.is_some())
    }

    pub async fn block_sender(&self, pubkey: &str) -> Result<(), BountyError> {
        sqlx::query("INSERT INTO blocked_senders (pubkey, blocked_at) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(pubkey)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db("block insert failed"))?;
        Ok(())
    }

    pub async fn unblock_sender(&self, pubkey: &str) -> Result<bool, BountyError> {
        let result = sqlx::query("DELETE FROM blocked_senders WHERE pubkey = ?")
            .bind(pubkey)
            .execute(&self.pool)
            .await
            .map_err(db("block delete failed"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Persisted high-water mark for an inbox, in unix seconds.
    pub async fn sync_cursor(&self, inbox: &str) -> Result<Option<i64>, BountyError> {
        sqlx::query_scalar("SELECT last_synced_at FROM sync_cursors WHERE inbox = ?")
            .bind(inbox)
            .fetch_optional(&self.pool)
            .await
            .map_err(db("cursor load failed"))
    }

    /// Advance the cursor. It never moves backwards.
    pub async fn advance_cursor(&self, inbox: &str, timestamp: i64) -> Result<(), BountyError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (inbox, last_synced_at) VALUES (?, ?)
            ON CONFLICT (inbox) DO UPDATE SET
                last_synced_at = MAX(last_synced_at, excluded.last_synced_at)
            "#,
        )
        .bind(inbox)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(db("cursor advance failed"))?;
        Ok(())
    }

    /// Checkpoint the write-ahead log into the main database file.
    pub async fn flush(&self) -> Result<(), BountyError> {
        if self.backend == "memory" {
            return Ok(());
        }
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await
            .map_err(db("wal checkpoint failed"))?;
        Ok(())
    }
}

fn response_insert(response: &Response) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO responses (
            id, report_id, response_type, message, payout_amount,
            responder_pubkey, created_at, origin_event_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&response.id)
    .bind(&response.report_id)
    .bind(response.response_type.name())
    .bind(&response.message)
    .bind(response.payout_amount.as_ref().map(|a| a.to_string()))
    .bind(&response.responder_pubkey)
    .bind(response.created_at)
    .bind(&response.origin_event_id)
}

fn column<'r, T>(row: &'r SqliteRow, name: &'static str) -> Result<T, BountyError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| BountyError::Storage(format!("sqlite decode {name} failed: {e}")))
}

fn decode_report(row: &SqliteRow) -> Result<Report, BountyError> {
    let deposit: String = column(row, "deposit_amount")?;
    let status: String = column(row, "status")?;
    let direction: String = column(row, "direction")?;
    let created_at: DateTime<Utc> = column(row, "created_at")?;
    let updated_at: DateTime<Utc> = column(row, "updated_at")?;

    Ok(Report {
        id: column(row, "id")?,
        repo_url: column(row, "repo_url")?,
        file_path: column(row, "file_path")?,
        description: column(row, "description")?,
        suggested_fix: column(row, "suggested_fix")?,
        sender_pubkey: column(row, "sender_pubkey")?,
        sender_nametag: column(row, "sender_nametag")?,
        recipient_pubkey: column(row, "recipient_pubkey")?,
        deposit_amount: Amount::from_str(&deposit)?,
        deposit_coin: column(row, "deposit_coin")?,
        status: ReportStatus::from_str(&status)?,
        direction: Direction::from_str(&direction)?,
        created_at,
        updated_at,
        origin_event_id: column(row, "origin_event_id")?,
    })
}

fn decode_response(row: &SqliteRow) -> Result<Response, BountyError> {
    let response_type: String = column(row, "response_type")?;
    let payout: Option<String> = column(row, "payout_amount")?;
    Ok(Response {
        id: column(row, "id")?,
        report_id: column(row, "report_id")?,
        response_type: ResponseType::from_str(&response_type)?,
        message: column(row, "message")?,
        payout_amount: payout.as_deref().map(Amount::from_str).transpose()?,
        responder_pubkey: column(row, "responder_pubkey")?,
        created_at: column(row, "created_at")?,
        origin_event_id: column(row, "origin_event_id")?,
    })
}

fn decode_payment(row: &SqliteRow) -> Result<PaymentRecord, BountyError> {
    let amount: String = column(row, "amount")?;
    let paid: String = column(row, "paid")?;
    let status: String = column(row, "status")?;
    let artifacts: String = column(row, "artifacts")?;
    Ok(PaymentRecord {
        key: IdempotencyKey::new(
            column::<String>(row, "purpose")?,
            column::<String>(row, "report_id")?,
        ),
        recipient: column(row, "recipient")?,
        amount: Amount::from_str(&amount)?,
        coin: column(row, "coin")?,
        status: PaymentStatus::parse(&status)?,
        paid: Amount::from_str(&paid)?,
        proof_ref: column(row, "proof_ref")?,
        artifacts: serde_json::from_str(&artifacts)?,
        updated_at: column(row, "updated_at")?,
    })
}

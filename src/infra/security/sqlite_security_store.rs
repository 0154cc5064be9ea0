// SQLite-backed storage for the security pipeline.
//
// Tables:
// - security_config: Per-guild detection and moderation settings
// - security_members: Denormalized member status and reputation
// - detection_events: Every verdict the detector produced
// - verification_cases: Moderation cases; at most one PENDING per member
// - admin_actions: Append-only moderator audit trail

use crate::core::security::{
    AdminAction, AdminActionStore, AdminActionType, CaseMetadata, CaseStatus, CaseStore,
    CaseUpdate, DetectionEvent, DetectionEventStore, MemberStatus, MemberStore, MessageRef,
    NewAdminAction, NewDetectionEvent, NewVerificationCase, SecurityConfig, SecurityConfigStore,
    SecurityError, SignalType, StatusChange, VerificationCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteSecurityStore {
    pool: Pool<Sqlite>,
}

fn storage(e: sqlx::Error) -> SecurityError {
    SecurityError::StorageError(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, SecurityError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SecurityError::StorageError(format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, SecurityError> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn parse_status(value: &str) -> Result<CaseStatus, SecurityError> {
    CaseStatus::parse(value)
        .ok_or_else(|| SecurityError::StorageError(format!("unknown case status {:?}", value)))
}

fn message_ref(channel_id: Option<i64>, message_id: Option<i64>) -> Option<MessageRef> {
    match (channel_id, message_id) {
        (Some(channel_id), Some(message_id)) => Some(MessageRef {
            channel_id: channel_id as u64,
            message_id: message_id as u64,
        }),
        _ => None,
    }
}

fn case_from_row(row: &SqliteRow) -> Result<VerificationCase, SecurityError> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    let metadata: CaseMetadata = serde_json::from_str(&metadata)
        .map_err(|e| SecurityError::StorageError(format!("bad case metadata: {}", e)))?;

    Ok(VerificationCase {
        id: row.get::<i64, _>("id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        detection_event_id: row
            .get::<Option<i64>, _>("detection_event_id")
            .map(|id| id as u64),
        notification: message_ref(
            row.get("notification_channel_id"),
            row.get("notification_message_id"),
        ),
        thread_id: row.get::<Option<i64>, _>("thread_id").map(|id| id as u64),
        status: parse_status(&status)?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        resolved_at: parse_optional_timestamp(row.get("resolved_at"))?,
        resolved_by: row.get::<Option<i64>, _>("resolved_by").map(|id| id as u64),
        notes: row.get("notes"),
        metadata,
    })
}

fn detection_event_from_row(row: &SqliteRow) -> Result<DetectionEvent, SecurityError> {
    let signal: String = row.get("signal_type");
    let reasons: String = row.get("reasons");

    Ok(DetectionEvent {
        id: row.get::<i64, _>("id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        signal_type: SignalType::parse(&signal).ok_or_else(|| {
            SecurityError::StorageError(format!("unknown signal type {:?}", signal))
        })?,
        confidence: row.get("confidence"),
        reasons: serde_json::from_str(&reasons)
            .map_err(|e| SecurityError::StorageError(format!("bad reasons: {}", e)))?,
        detected_at: parse_timestamp(&row.get::<String, _>("detected_at"))?,
        message_ref: message_ref(row.get("channel_id"), row.get("message_id")),
        case_id: row.get::<Option<i64>, _>("case_id").map(|id| id as u64),
    })
}

fn admin_action_from_row(row: &SqliteRow) -> Result<AdminAction, SecurityError> {
    let action_type: String = row.get("action_type");
    let previous: String = row.get("previous_status");
    let new: String = row.get("new_status");

    Ok(AdminAction {
        id: row.get::<i64, _>("id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        moderator_id: row.get::<i64, _>("moderator_id") as u64,
        case_id: row.get::<i64, _>("case_id") as u64,
        action_type: AdminActionType::parse(&action_type).ok_or_else(|| {
            SecurityError::StorageError(format!("unknown action type {:?}", action_type))
        })?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        previous_status: parse_status(&previous)?,
        new_status: parse_status(&new)?,
        notes: row.get("notes"),
    })
}

impl SqliteSecurityStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), SecurityError> {
        // Config table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS security_config (
                guild_id INTEGER PRIMARY KEY,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                confidence_threshold REAL NOT NULL DEFAULT 0.7,
                ai_review_floor REAL NOT NULL DEFAULT 0.2,
                keywords TEXT NOT NULL DEFAULT '[]',
                auto_restrict BOOLEAN NOT NULL DEFAULT 1,
                min_account_age_days INTEGER NOT NULL DEFAULT 7,
                max_messages_per_window INTEGER NOT NULL DEFAULT 6,
                rate_window_secs INTEGER NOT NULL DEFAULT 10,
                restricted_role_id INTEGER,
                alert_channel_id INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // Member status table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS security_members (
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                restricted BOOLEAN NOT NULL DEFAULT 0,
                verification_status TEXT,
                last_status_change TEXT,
                reputation INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (guild_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // Detection events table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS detection_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                signal_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                reasons TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                channel_id INTEGER,
                message_id INTEGER,
                case_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_detection_events_member
                ON detection_events(guild_id, user_id, detected_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // Cases table. The partial unique index is what makes "one pending
        // case per member" hold even across processes.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verification_cases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                detection_event_id INTEGER,
                notification_channel_id INTEGER,
                notification_message_id INTEGER,
                thread_id INTEGER,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT,
                resolved_by INTEGER,
                notes TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_verification_cases_one_pending
                ON verification_cases(guild_id, user_id) WHERE status = 'PENDING';
            CREATE INDEX IF NOT EXISTS idx_verification_cases_member
                ON verification_cases(guild_id, user_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // Audit trail table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS admin_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                moderator_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                previous_status TEXT NOT NULL,
                new_status TEXT NOT NULL,
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_admin_actions_case
                ON admin_actions(case_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

#[async_trait]
impl CaseStore for SqliteSecurityStore {
    async fn find_active_pending(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let row = sqlx::query(
            "SELECT * FROM verification_cases WHERE guild_id = ? AND user_id = ? AND status = 'PENDING'",
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(case_from_row).transpose()
    }

    async fn create(&self, case: NewVerificationCase) -> Result<VerificationCase, SecurityError> {
        let metadata = serde_json::to_string(&case.metadata)
            .map_err(|e| SecurityError::StorageError(e.to_string()))?;
        let created_at = case.created_at.to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO verification_cases (
                guild_id, user_id, detection_event_id, status,
                created_at, updated_at, notes, metadata
            )
            VALUES (?, ?, ?, 'PENDING', ?, ?, ?, ?)
            "#,
        )
        .bind(case.guild_id as i64)
        .bind(case.user_id as i64)
        .bind(case.detection_event_id.map(|id| id as i64))
        .bind(&created_at)
        .bind(&created_at)
        .bind(&case.notes)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SecurityError::ActiveCaseExists {
                    guild_id: case.guild_id,
                    user_id: case.user_id,
                }
            } else {
                storage(e)
            }
        })?;

        let case_id = result.last_insert_rowid() as u64;
        CaseStore::find_by_id(self, case_id)
            .await?
            .ok_or(SecurityError::CaseNotFound(case_id))
    }

    async fn update_status(
        &self,
        case_id: u64,
        expected: CaseStatus,
        change: StatusChange,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_cases SET
                status = ?,
                resolved_at = ?,
                resolved_by = ?,
                updated_at = ?,
                notes = COALESCE(?, notes)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(change.new_status.as_str())
        .bind(change.resolved_at.map(|t| t.to_rfc3339()))
        .bind(change.resolved_by.map(|id| id as i64))
        .bind(change.updated_at.to_rfc3339())
        .bind(change.notes.as_deref())
        .bind(case_id as i64)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(e) if is_unique_violation(&e) => {
                // Moving back to PENDING while the member has another pending case
                let case = CaseStore::find_by_id(self, case_id)
                    .await?
                    .ok_or(SecurityError::CaseNotFound(case_id))?;
                return Err(SecurityError::ActiveCaseExists {
                    guild_id: case.guild_id,
                    user_id: case.user_id,
                });
            }
            Err(e) => return Err(storage(e)),
        };

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        CaseStore::find_by_id(self, case_id).await
    }

    async fn update(
        &self,
        case_id: u64,
        expected: CaseStatus,
        update: CaseUpdate,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SecurityError::StorageError(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE verification_cases SET
                notes = COALESCE(?, notes),
                metadata = COALESCE(?, metadata),
                thread_id = COALESCE(thread_id, ?),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(update.notes.as_deref())
        .bind(metadata.as_deref())
        .bind(update.thread_id.map(|id| id as i64))
        .bind(Utc::now().to_rfc3339())
        .bind(case_id as i64)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        CaseStore::find_by_id(self, case_id).await
    }

    async fn link_notification(
        &self,
        case_id: u64,
        notification: MessageRef,
    ) -> Result<bool, SecurityError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_cases SET
                notification_channel_id = ?,
                notification_message_id = ?,
                updated_at = ?
            WHERE id = ? AND notification_message_id IS NULL
            "#,
        )
        .bind(notification.channel_id as i64)
        .bind(notification.message_id as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(case_id as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, case_id: u64) -> Result<Option<VerificationCase>, SecurityError> {
        let row = sqlx::query("SELECT * FROM verification_cases WHERE id = ?")
            .bind(case_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(case_from_row).transpose()
    }

    async fn find_latest(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<VerificationCase>, SecurityError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM verification_cases
            WHERE guild_id = ? AND user_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(case_from_row).transpose()
    }

    async fn list_for_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<VerificationCase>, SecurityError> {
        let rows = sqlx::query(
            "SELECT * FROM verification_cases WHERE guild_id = ? AND user_id = ? ORDER BY id DESC",
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(case_from_row).collect()
    }
}

#[async_trait]
impl DetectionEventStore for SqliteSecurityStore {
    async fn create(&self, event: NewDetectionEvent) -> Result<DetectionEvent, SecurityError> {
        let reasons = serde_json::to_string(&event.reasons)
            .map_err(|e| SecurityError::StorageError(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO detection_events (
                guild_id, user_id, signal_type, confidence, reasons,
                detected_at, channel_id, message_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.guild_id as i64)
        .bind(event.user_id as i64)
        .bind(event.signal_type.as_str())
        .bind(event.confidence)
        .bind(&reasons)
        .bind(event.detected_at.to_rfc3339())
        .bind(event.message_ref.map(|m| m.channel_id as i64))
        .bind(event.message_ref.map(|m| m.message_id as i64))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(DetectionEvent {
            id: result.last_insert_rowid() as u64,
            guild_id: event.guild_id,
            user_id: event.user_id,
            signal_type: event.signal_type,
            confidence: event.confidence,
            reasons: event.reasons,
            detected_at: event.detected_at,
            message_ref: event.message_ref,
            case_id: None,
        })
    }

    async fn link_case(&self, event_id: u64, case_id: u64) -> Result<(), SecurityError> {
        sqlx::query("UPDATE detection_events SET case_id = ? WHERE id = ?")
            .bind(case_id as i64)
            .bind(event_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn find_by_id(&self, event_id: u64) -> Result<Option<DetectionEvent>, SecurityError> {
        let row = sqlx::query("SELECT * FROM detection_events WHERE id = ?")
            .bind(event_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(detection_event_from_row).transpose()
    }
}

#[async_trait]
impl AdminActionStore for SqliteSecurityStore {
    async fn create(&self, action: NewAdminAction) -> Result<AdminAction, SecurityError> {
        let created_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO admin_actions (
                guild_id, user_id, moderator_id, case_id, action_type,
                created_at, previous_status, new_status, notes
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(action.guild_id as i64)
        .bind(action.user_id as i64)
        .bind(action.moderator_id as i64)
        .bind(action.case_id as i64)
        .bind(action.action_type.as_str())
        .bind(created_at.to_rfc3339())
        .bind(action.previous_status.as_str())
        .bind(action.new_status.as_str())
        .bind(action.notes.as_deref())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(AdminAction {
            id: result.last_insert_rowid() as u64,
            guild_id: action.guild_id,
            user_id: action.user_id,
            moderator_id: action.moderator_id,
            case_id: action.case_id,
            action_type: action.action_type,
            created_at,
            previous_status: action.previous_status,
            new_status: action.new_status,
            notes: action.notes,
        })
    }

    async fn find_by_case(&self, case_id: u64) -> Result<Vec<AdminAction>, SecurityError> {
        let rows = sqlx::query("SELECT * FROM admin_actions WHERE case_id = ? ORDER BY id ASC")
            .bind(case_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter().map(admin_action_from_row).collect()
    }
}

#[async_trait]
impl SecurityConfigStore for SqliteSecurityStore {
    async fn get_config(&self, guild_id: u64) -> Result<SecurityConfig, SecurityError> {
        let row = sqlx::query("SELECT * FROM security_config WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            // Return default config if none exists
            return Ok(SecurityConfig::default());
        };

        let keywords: String = row.get("keywords");
        Ok(SecurityConfig {
            enabled: row.get("enabled"),
            confidence_threshold: row.get("confidence_threshold"),
            ai_review_floor: row.get("ai_review_floor"),
            keywords: serde_json::from_str(&keywords)
                .map_err(|e| SecurityError::ConfigError(format!("bad keyword list: {}", e)))?,
            auto_restrict: row.get("auto_restrict"),
            min_account_age_days: row.get::<i64, _>("min_account_age_days") as u32,
            max_messages_per_window: row.get::<i64, _>("max_messages_per_window") as u32,
            rate_window_secs: row.get::<i64, _>("rate_window_secs") as u64,
            restricted_role_id: row
                .get::<Option<i64>, _>("restricted_role_id")
                .map(|id| id as u64),
            alert_channel_id: row
                .get::<Option<i64>, _>("alert_channel_id")
                .map(|id| id as u64),
        })
    }

    async fn save_config(&self, guild_id: u64, config: SecurityConfig) -> Result<(), SecurityError> {
        let keywords = serde_json::to_string(&config.keywords)
            .map_err(|e| SecurityError::ConfigError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO security_config (
                guild_id, enabled, confidence_threshold, ai_review_floor, keywords,
                auto_restrict, min_account_age_days, max_messages_per_window,
                rate_window_secs, restricted_role_id, alert_channel_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET
                enabled = excluded.enabled,
                confidence_threshold = excluded.confidence_threshold,
                ai_review_floor = excluded.ai_review_floor,
                keywords = excluded.keywords,
                auto_restrict = excluded.auto_restrict,
                min_account_age_days = excluded.min_account_age_days,
                max_messages_per_window = excluded.max_messages_per_window,
                rate_window_secs = excluded.rate_window_secs,
                restricted_role_id = excluded.restricted_role_id,
                alert_channel_id = excluded.alert_channel_id
            "#,
        )
        .bind(guild_id as i64)
        .bind(config.enabled)
        .bind(config.confidence_threshold)
        .bind(config.ai_review_floor)
        .bind(&keywords)
        .bind(config.auto_restrict)
        .bind(config.min_account_age_days as i64)
        .bind(config.max_messages_per_window as i64)
        .bind(config.rate_window_secs as i64)
        .bind(config.restricted_role_id.map(|id| id as i64))
        .bind(config.alert_channel_id.map(|id| id as i64))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl MemberStore for SqliteSecurityStore {
    async fn ensure_member(&self, guild_id: u64, user_id: u64) -> Result<(), SecurityError> {
        sqlx::query(
            r#"
            INSERT INTO security_members (guild_id, user_id)
            VALUES (?, ?)
            ON CONFLICT(guild_id, user_id) DO NOTHING
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_status(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberStatus>, SecurityError> {
        let row = sqlx::query("SELECT * FROM security_members WHERE guild_id = ? AND user_id = ?")
            .bind(guild_id as i64)
            .bind(user_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let verification_status = row
            .get::<Option<String>, _>("verification_status")
            .as_deref()
            .map(parse_status)
            .transpose()?;

        Ok(Some(MemberStatus {
            guild_id,
            user_id,
            restricted: row.get("restricted"),
            verification_status,
            last_status_change: parse_optional_timestamp(row.get("last_status_change"))?,
            reputation: row.get("reputation"),
        }))
    }

    async fn update_status(
        &self,
        guild_id: u64,
        user_id: u64,
        restricted: bool,
        verification_status: CaseStatus,
        changed_at: DateTime<Utc>,
    ) -> Result<(), SecurityError> {
        sqlx::query(
            r#"
            INSERT INTO security_members (guild_id, user_id, restricted, verification_status, last_status_change)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(guild_id, user_id) DO UPDATE SET
                restricted = excluded.restricted,
                verification_status = excluded.verification_status,
                last_status_change = excluded.last_status_change
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(restricted)
        .bind(verification_status.as_str())
        .bind(changed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn adjust_reputation(
        &self,
        guild_id: u64,
        user_id: u64,
        delta: i64,
    ) -> Result<i64, SecurityError> {
        sqlx::query(
            r#"
            INSERT INTO security_members (guild_id, user_id, reputation)
            VALUES (?, ?, ?)
            ON CONFLICT(guild_id, user_id) DO UPDATE SET
                reputation = reputation + excluded.reputation
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        // Get the updated value
        let row = sqlx::query(
            "SELECT reputation FROM security_members WHERE guild_id = ? AND user_id = ?",
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.get("reputation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteSecurityStore {
        // One connection, otherwise every connection gets its own memory db
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteSecurityStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn new_case(guild_id: u64, user_id: u64) -> NewVerificationCase {
        NewVerificationCase {
            guild_id,
            user_id,
            detection_event_id: None,
            notes: String::new(),
            metadata: CaseMetadata {
                detection_count: 1,
                last_confidence: 0.9,
                last_detection_event_id: None,
                signals: vec!["MESSAGE: Matched keyword \"airdrop\"".to_string()],
            },
            created_at: Utc::now(),
        }
    }

    fn verify_change(moderator_id: u64) -> StatusChange {
        let now = Utc::now();
        StatusChange {
            new_status: CaseStatus::Verified,
            resolved_at: Some(now),
            resolved_by: Some(moderator_id),
            updated_at: now,
            notes: Some("[VERIFY by 9] known member".to_string()),
        }
    }

    #[tokio::test]
    async fn test_case_roundtrip_keeps_metadata() {
        let store = store().await;
        let created = CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        assert_eq!(created.status, CaseStatus::Pending);
        assert_eq!(created.metadata.detection_count, 1);
        assert_eq!(created.metadata.signals.len(), 1);
        assert!(created.notification.is_none());

        let found = store.find_active_pending(1, 2).await.unwrap().unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn test_second_pending_case_is_rejected() {
        let store = store().await;
        CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        let err = CaseStore::create(&store, new_case(1, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            SecurityError::ActiveCaseExists {
                guild_id: 1,
                user_id: 2
            }
        ));

        // Another member, or the same member elsewhere, is fine
        CaseStore::create(&store, new_case(1, 3)).await.unwrap();
        CaseStore::create(&store, new_case(4, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_guarded_status_update() {
        let store = store().await;
        let case = CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        let verified = CaseStore::update_status(&store, case.id, CaseStatus::Pending, verify_change(9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verified.status, CaseStatus::Verified);
        assert_eq!(verified.resolved_by, Some(9));
        assert_eq!(verified.notes, "[VERIFY by 9] known member");

        // Guard no longer holds
        let again = CaseStore::update_status(&store, case.id, CaseStatus::Pending, verify_change(10))
            .await
            .unwrap();
        assert!(again.is_none());

        // Resolved cases free the slot for a new pending case
        CaseStore::create(&store, new_case(1, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_conflicts_with_other_pending_case() {
        let store = store().await;
        let old = CaseStore::create(&store, new_case(1, 2)).await.unwrap();
        CaseStore::update_status(&store, old.id, CaseStatus::Pending, verify_change(9))
            .await
            .unwrap();
        CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        let reopen = StatusChange {
            new_status: CaseStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            updated_at: Utc::now(),
            notes: None,
        };
        let err = CaseStore::update_status(&store, old.id, CaseStatus::Verified, reopen)
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ActiveCaseExists { .. }));
    }

    #[tokio::test]
    async fn test_notification_links_once() {
        let store = store().await;
        let case = CaseStore::create(&store, new_case(1, 2)).await.unwrap();
        let first = MessageRef {
            channel_id: 10,
            message_id: 20,
        };
        let second = MessageRef {
            channel_id: 10,
            message_id: 21,
        };

        assert!(store.link_notification(case.id, first).await.unwrap());
        assert!(!store.link_notification(case.id, second).await.unwrap());

        let case = CaseStore::find_by_id(&store, case.id).await.unwrap().unwrap();
        assert_eq!(case.notification, Some(first));
    }

    #[tokio::test]
    async fn test_update_sets_thread_only_once() {
        let store = store().await;
        let case = CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        let updated = store
            .update(
                case.id,
                CaseStatus::Pending,
                CaseUpdate {
                    thread_id: Some(77),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.thread_id, Some(77));

        let updated = store
            .update(
                case.id,
                CaseStatus::Pending,
                CaseUpdate {
                    thread_id: Some(78),
                    notes: Some("second look".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.thread_id, Some(77));
        assert_eq!(updated.notes, "second look");

        let wrong_state = store
            .update(case.id, CaseStatus::Banned, CaseUpdate::default())
            .await
            .unwrap();
        assert!(wrong_state.is_none());
    }

    #[tokio::test]
    async fn test_member_history_is_newest_first() {
        let store = store().await;
        let first = CaseStore::create(&store, new_case(1, 2)).await.unwrap();
        CaseStore::update_status(&store, first.id, CaseStatus::Pending, verify_change(9))
            .await
            .unwrap();
        let second = CaseStore::create(&store, new_case(1, 2)).await.unwrap();

        let history = store.list_for_member(1, 2).await.unwrap();
        let ids: Vec<u64> = history.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let latest = store.find_latest(1, 2).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.find_latest(1, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detection_event_links_case() {
        let store = store().await;
        let event = DetectionEventStore::create(
            &store,
            NewDetectionEvent {
                guild_id: 1,
                user_id: 2,
                signal_type: SignalType::Report,
                confidence: 1.0,
                reasons: vec!["Reported by <@5>: scam dm".to_string()],
                detected_at: Utc::now(),
                message_ref: Some(MessageRef {
                    channel_id: 3,
                    message_id: 4,
                }),
            },
        )
        .await
        .unwrap();

        store.link_case(event.id, 42).await.unwrap();

        let found = DetectionEventStore::find_by_id(&store, event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.signal_type, SignalType::Report);
        assert_eq!(found.reasons, event.reasons);
        assert_eq!(found.message_ref, event.message_ref);
        assert_eq!(found.case_id, Some(42));
    }

    #[tokio::test]
    async fn test_audit_trail_oldest_first() {
        let store = store().await;
        for (action_type, previous, new) in [
            (AdminActionType::Verify, CaseStatus::Pending, CaseStatus::Verified),
            (AdminActionType::Reopen, CaseStatus::Verified, CaseStatus::Pending),
        ] {
            AdminActionStore::create(
                &store,
                NewAdminAction {
                    guild_id: 1,
                    user_id: 2,
                    moderator_id: 9,
                    case_id: 5,
                    action_type,
                    previous_status: previous,
                    new_status: new,
                    notes: None,
                },
            )
            .await
            .unwrap();
        }

        let trail = store.find_by_case(5).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action_type, AdminActionType::Verify);
        assert_eq!(trail[1].action_type, AdminActionType::Reopen);
        assert_eq!(trail[1].previous_status, CaseStatus::Verified);
        assert!(store.find_by_case(6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_defaults_and_save() {
        let store = store().await;
        assert_eq!(store.get_config(1).await.unwrap(), SecurityConfig::default());

        let config = SecurityConfig {
            confidence_threshold: 0.8,
            keywords: vec!["crypto giveaway".to_string()],
            restricted_role_id: Some(555),
            alert_channel_id: Some(777),
            ..Default::default()
        };
        store.save_config(1, config.clone()).await.unwrap();
        assert_eq!(store.get_config(1).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_member_status_and_reputation() {
        let store = store().await;
        store.ensure_member(1, 2).await.unwrap();
        store.ensure_member(1, 2).await.unwrap();

        let status = store.get_status(1, 2).await.unwrap().unwrap();
        assert!(!status.restricted);
        assert_eq!(status.verification_status, None);
        assert_eq!(status.reputation, 0);

        MemberStore::update_status(&store, 1, 2, true, CaseStatus::Pending, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.adjust_reputation(1, 2, 1).await.unwrap(), 1);
        assert_eq!(store.adjust_reputation(1, 2, -5).await.unwrap(), -4);

        let status = store.get_status(1, 2).await.unwrap().unwrap();
        assert!(status.restricted);
        assert_eq!(status.verification_status, Some(CaseStatus::Pending));
        assert_eq!(status.reputation, -4);
        assert!(store.get_status(1, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent_on_disk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}", file.path().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        let store = SqliteSecurityStore::new(pool);

        store.migrate().await.unwrap();
        CaseStore::create(&store, new_case(1, 2)).await.unwrap();
        store.migrate().await.unwrap();

        assert!(store.find_active_pending(1, 2).await.unwrap().is_some());
    }
}

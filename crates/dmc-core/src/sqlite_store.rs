//! SQLite-based persistent storage implementation for DMC.
//!
//! The "one open action per device" rule is enforced by a UNIQUE constraint
//! on `pending_actions.device_id`, so it holds even with several control
//! plane processes sharing one database file. The terminal transition runs in
//! a transaction that deletes the pending row and appends the history row.
//!
//! Timestamps are stored as RFC 3339 text with nanosecond precision, which
//! round-trips exactly and sorts chronologically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::store::{next_retries, Store, StoreError};
use crate::types::{
    ActionKind, ActionRecord, ActionRef, ActionResult, CorrelationId, Device, DeviceId,
    Enrollment, ExpectedProfile, InstalledProfile, InstalledProfileReport, PendingAction,
    ProfileStatus, VerificationStatus, VerificationUpdate,
};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const PENDING_COLUMNS: &str = "correlation_id, device_id, kind, channel, protocol_status, \
     exit_code, unlock_pin, requested_at";

const HISTORY_COLUMNS: &str = "correlation_id, device_id, kind, channel, protocol_status, \
     exit_code, unlock_pin, requested_at, completed_at, result";

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store implementation.
pub struct SqliteStore {
    /// SQLite connection wrapped in a mutex for thread-safe access
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// # Returns
    /// * `Ok(SqliteStore)` on success
    /// * `Err(StoreError)` if database creation or migration fails
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::OperationFailed(format!("failed to open database: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {}", e)))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }
        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                platform TEXT NOT NULL,
                enrollment_status TEXT NOT NULL,
                solution_name TEXT NOT NULL,
                connected INTEGER NOT NULL,
                agent_supports_scripts INTEGER NOT NULL,
                detail_updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expected_profiles (
                device_id TEXT NOT NULL,
                identifier TEXT NOT NULL,
                earliest_install_date TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (device_id, identifier)
            );

            CREATE TABLE IF NOT EXISTS installed_profiles (
                device_id TEXT NOT NULL,
                identifier TEXT NOT NULL,
                install_date TEXT NOT NULL,
                PRIMARY KEY (device_id, identifier)
            );

            CREATE TABLE IF NOT EXISTS profile_status (
                device_id TEXT NOT NULL,
                identifier TEXT NOT NULL,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (device_id, identifier)
            );

            -- At most one open action per device
            CREATE TABLE IF NOT EXISTS pending_actions (
                correlation_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                channel TEXT NOT NULL,
                protocol_status TEXT,
                exit_code INTEGER,
                unlock_pin TEXT,
                requested_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_requested ON pending_actions(requested_at);

            CREATE TABLE IF NOT EXISTS action_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                correlation_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                channel TEXT NOT NULL,
                protocol_status TEXT,
                exit_code INTEGER,
                unlock_pin TEXT,
                requested_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                result TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_device ON action_history(device_id, seq);
            CREATE INDEX IF NOT EXISTS idx_history_correlation ON action_history(correlation_id);

            -- Record schema version
            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Row mapping
    // -------------------------------------------------------------------------

    fn insert_history(conn: &Connection, record: &ActionRecord) -> Result<(), StoreError> {
        let (channel, id, status, exit_code) = record.action_ref.to_parts();
        conn.execute(
            &format!(
                "INSERT INTO action_history ({HISTORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                id.as_str(),
                record.device_id.to_string(),
                record.kind.as_str(),
                channel.as_str(),
                status.map(|s| s.as_str()),
                exit_code,
                record.unlock_pin,
                ts(&record.requested_at),
                ts(&record.completed_at),
                record.result.as_str(),
            ],
        )
        .map_err(db_err("failed to append action history"))?;
        Ok(())
    }

    fn row_to_device(row: &Row) -> rusqlite::Result<Device> {
        let device_id: String = row.get(0)?;
        let platform: String = row.get(2)?;
        let status: String = row.get(3)?;
        let updated: String = row.get(7)?;
        Ok(Device {
            id: parse_col(0, device_id.parse())?,
            hostname: row.get(1)?,
            platform: parse_col(2, platform.parse())?,
            enrollment: Enrollment {
                status: parse_col(3, status.parse())?,
                solution_name: row.get(4)?,
                connected_to_this_control_plane: row.get(5)?,
            },
            agent_supports_scripts: row.get(6)?,
            detail_updated_at: parse_ts(7, &updated)?,
        })
    }

    fn row_to_pending(row: &Row) -> rusqlite::Result<PendingAction> {
        let correlation_id: String = row.get(0)?;
        let device_id: String = row.get(1)?;
        let kind: String = row.get(2)?;
        let channel: String = row.get(3)?;
        let status: Option<String> = row.get(4)?;
        let requested_at: String = row.get(7)?;

        Ok(PendingAction {
            device_id: parse_col(1, device_id.parse())?,
            kind: parse_col(2, kind.parse())?,
            action_ref: ActionRef::from_parts(
                parse_col(3, channel.parse())?,
                CorrelationId::from(correlation_id),
                status.map(|s| parse_col(4, s.parse())).transpose()?,
                row.get(5)?,
            ),
            unlock_pin: row.get(6)?,
            requested_at: parse_ts(7, &requested_at)?,
        })
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<ActionRecord> {
        let pending = Self::row_to_pending(row)?;
        let completed_at: String = row.get(8)?;
        let result: String = row.get(9)?;
        Ok(ActionRecord {
            device_id: pending.device_id,
            kind: pending.kind,
            action_ref: pending.action_ref,
            unlock_pin: pending.unlock_pin,
            requested_at: pending.requested_at,
            completed_at: parse_ts(8, &completed_at)?,
            result: parse_col(9, result.parse())?,
        })
    }
}

/// Format a timestamp for storage.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_col(
        idx,
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| e.to_string()),
    )
}

fn parse_col<T>(idx: usize, parsed: Result<T, String>) -> rusqlite::Result<T> {
    parsed.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Map a rusqlite error, separating undecodable rows from backend failures.
fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| match e {
        rusqlite::Error::FromSqlConversionFailure(..) => {
            StoreError::DataCorruption(format!("{}: {}", context, e))
        }
        other => StoreError::OperationFailed(format!("{}: {}", context, other)),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// Store Trait Implementation
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT device_id, hostname, platform, enrollment_status, solution_name,
                    connected, agent_supports_scripts, detail_updated_at
             FROM devices WHERE device_id = ?1",
            params![device_id.to_string()],
            Self::row_to_device,
        )
        .optional()
        .map_err(db_err("failed to load device"))
    }

    async fn save_device(&self, device: Device) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO devices (
                device_id, hostname, platform, enrollment_status, solution_name,
                connected, agent_supports_scripts, detail_updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.id.to_string(),
                device.hostname,
                device.platform.as_str(),
                device.enrollment.status.as_str(),
                device.enrollment.solution_name,
                device.enrollment.connected_to_this_control_plane,
                device.agent_supports_scripts,
                ts(&device.detail_updated_at),
            ],
        )
        .map_err(db_err("failed to save device"))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Profiles
    // -------------------------------------------------------------------------

    async fn get_expected_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ExpectedProfile>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT identifier, earliest_install_date FROM expected_profiles
                 WHERE device_id = ?1 ORDER BY position",
            )
            .map_err(db_err("failed to prepare query"))?;

        let profiles = stmt
            .query_map(params![device_id.to_string()], |row| {
                let earliest: String = row.get(1)?;
                Ok(ExpectedProfile {
                    identifier: row.get(0)?,
                    earliest_install_date: parse_ts(1, &earliest)?,
                })
            })
            .map_err(db_err("failed to load expected profiles"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect expected profiles"))?;

        Ok(profiles)
    }

    async fn set_expected_profiles(
        &self,
        device_id: &DeviceId,
        profiles: Vec<ExpectedProfile>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        let id = device_id.to_string();

        tx.execute("DELETE FROM expected_profiles WHERE device_id = ?1", params![id])
            .map_err(db_err("failed to clear expected profiles"))?;
        for (position, profile) in profiles.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO expected_profiles
                    (device_id, identifier, earliest_install_date, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    profile.identifier,
                    ts(&profile.earliest_install_date),
                    position as i64,
                ],
            )
            .map_err(db_err("failed to save expected profile"))?;
        }

        tx.commit().map_err(db_err("failed to commit expected profiles"))?;
        Ok(())
    }

    async fn get_installed_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<InstalledProfileReport, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT identifier, install_date FROM installed_profiles WHERE device_id = ?1")
            .map_err(db_err("failed to prepare query"))?;

        let report = stmt
            .query_map(params![device_id.to_string()], |row| {
                let identifier: String = row.get(0)?;
                let installed: String = row.get(1)?;
                Ok((
                    identifier,
                    InstalledProfile {
                        install_date: parse_ts(1, &installed)?,
                    },
                ))
            })
            .map_err(db_err("failed to load installed profiles"))?
            .collect::<Result<InstalledProfileReport, _>>()
            .map_err(db_err("failed to collect installed profiles"))?;

        Ok(report)
    }

    async fn save_installed_profiles(
        &self,
        device_id: &DeviceId,
        report: InstalledProfileReport,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        let id = device_id.to_string();

        tx.execute("DELETE FROM installed_profiles WHERE device_id = ?1", params![id])
            .map_err(db_err("failed to clear installed profiles"))?;
        for (identifier, profile) in &report {
            tx.execute(
                "INSERT INTO installed_profiles (device_id, identifier, install_date)
                 VALUES (?1, ?2, ?3)",
                params![id, identifier, ts(&profile.install_date)],
            )
            .map_err(db_err("failed to save installed profile"))?;
        }

        tx.commit().map_err(db_err("failed to commit installed profiles"))?;
        Ok(())
    }

    async fn get_retry_counters(
        &self,
        device_id: &DeviceId,
    ) -> Result<HashMap<String, u32>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT identifier, retries FROM profile_status WHERE device_id = ?1")
            .map_err(db_err("failed to prepare query"))?;

        let counters = stmt
            .query_map(params![device_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .map_err(db_err("failed to load retry counters"))?
            .collect::<Result<_, _>>()
            .map_err(db_err("failed to collect retry counters"))?;

        Ok(counters)
    }

    async fn update_verification(
        &self,
        device_id: &DeviceId,
        update: &VerificationUpdate,
        read_counters: &HashMap<String, u32>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        let id = device_id.to_string();
        let updated_at = ts(&update.updated_at);

        let current: HashMap<String, u32> = {
            let mut stmt = tx
                .prepare("SELECT identifier, retries FROM profile_status WHERE device_id = ?1")
                .map_err(db_err("failed to prepare query"))?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })
                .map_err(db_err("failed to load retry counters"))?
                .collect::<Result<_, _>>()
                .map_err(db_err("failed to collect retry counters"))?;
            rows
        };

        let classified = update
            .verified
            .iter()
            .map(|p| (p, VerificationStatus::Verified))
            .chain(update.retry.iter().map(|p| (p, VerificationStatus::Retrying)))
            .chain(update.failed.iter().map(|p| (p, VerificationStatus::Failed)));

        let mut next = Vec::new();
        for (identifier, status) in classified {
            let read = read_counters.get(identifier).copied().unwrap_or(0);
            let now = current.get(identifier).copied().unwrap_or(0);
            if now != read {
                return Err(StoreError::ConcurrentUpdate(format!(
                    "retry counter for {} on {} moved from {} to {}",
                    identifier, device_id, read, now
                )));
            }
            next.push((identifier, status, next_retries(status, read)));
        }

        // Replacing the device's rows also prunes profiles no longer expected
        tx.execute("DELETE FROM profile_status WHERE device_id = ?1", params![id])
            .map_err(db_err("failed to clear profile statuses"))?;
        for (identifier, status, retries) in next {
            tx.execute(
                "INSERT INTO profile_status (device_id, identifier, status, retries, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, identifier, status.as_str(), retries, updated_at],
            )
            .map_err(db_err("failed to record profile status"))?;
        }

        tx.commit().map_err(db_err("failed to commit verification"))?;
        Ok(())
    }

    async fn get_profile_statuses(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ProfileStatus>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT identifier, status, retries, updated_at FROM profile_status
                 WHERE device_id = ?1 ORDER BY identifier",
            )
            .map_err(db_err("failed to prepare query"))?;

        let statuses = stmt
            .query_map(params![device_id.to_string()], |row| {
                let status: String = row.get(1)?;
                let updated_at: String = row.get(3)?;
                Ok(ProfileStatus {
                    identifier: row.get(0)?,
                    status: parse_col(1, status.parse())?,
                    retries: row.get(2)?,
                    updated_at: parse_ts(3, &updated_at)?,
                })
            })
            .map_err(db_err("failed to load profile statuses"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect profile statuses"))?;

        Ok(statuses)
    }

    // -------------------------------------------------------------------------
    // Device Actions
    // -------------------------------------------------------------------------

    async fn get_pending_action(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<PendingAction>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_actions WHERE device_id = ?1"),
            params![device_id.to_string()],
            Self::row_to_pending,
        )
        .optional()
        .map_err(db_err("failed to load pending action"))
    }

    async fn get_pending_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<PendingAction>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_actions WHERE correlation_id = ?1"),
            params![correlation_id.as_str()],
            Self::row_to_pending,
        )
        .optional()
        .map_err(db_err("failed to load pending action"))
    }

    async fn list_pending_actions(&self) -> Result<Vec<PendingAction>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_actions ORDER BY requested_at"
            ))
            .map_err(db_err("failed to prepare query"))?;

        let pending = stmt
            .query_map([], Self::row_to_pending)
            .map_err(db_err("failed to list pending actions"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect pending actions"))?;

        Ok(pending)
    }

    async fn insert_pending_action(&self, action: PendingAction) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let (channel, correlation_id, status, exit_code) = action.action_ref.to_parts();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO pending_actions ({PENDING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                correlation_id.as_str(),
                action.device_id.to_string(),
                action.kind.as_str(),
                channel.as_str(),
                status.map(|s| s.as_str()),
                exit_code,
                action.unlock_pin,
                ts(&action.requested_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT kind FROM pending_actions WHERE device_id = ?1",
                        params![action.device_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err("failed to load conflicting action"))?;
                match existing {
                    Some(kind) => {
                        let kind: ActionKind = kind.parse().map_err(StoreError::DataCorruption)?;
                        Err(StoreError::PendingConflict {
                            device_id: action.device_id,
                            pending: kind.pending_kind(),
                        })
                    }
                    None => Err(StoreError::OperationFailed(format!(
                        "failed to insert pending action: {}",
                        e
                    ))),
                }
            }
            Err(e) => Err(db_err("failed to insert pending action")(e)),
        }
    }

    async fn release_pending_action(
        &self,
        device_id: &DeviceId,
        correlation_id: &CorrelationId,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM pending_actions WHERE device_id = ?1 AND correlation_id = ?2",
                params![device_id.to_string(), correlation_id.as_str()],
            )
            .map_err(db_err("failed to release pending action"))?;
        Ok(removed > 0)
    }

    async fn rekey_pending_action(
        &self,
        device_id: &DeviceId,
        from: &CorrelationId,
        to: &CorrelationId,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows_affected = conn
            .execute(
                "UPDATE pending_actions SET correlation_id = ?3
                 WHERE device_id = ?1 AND correlation_id = ?2",
                params![device_id.to_string(), from.as_str(), to.as_str()],
            )
            .map_err(db_err("failed to re-key pending action"))?;

        if rows_affected == 0 {
            return Err(StoreError::NotFound(format!(
                "pending action {} for device {}",
                from, device_id
            )));
        }
        Ok(())
    }

    async fn record_terminal_result(
        &self,
        correlation_id: &CorrelationId,
        final_ref: ActionRef,
        result: ActionResult,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<ActionRecord>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;

        let pending = tx
            .query_row(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_actions WHERE correlation_id = ?1"),
                params![correlation_id.as_str()],
                Self::row_to_pending,
            )
            .optional()
            .map_err(db_err("failed to load pending action"))?;
        let Some(pending) = pending else {
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM pending_actions WHERE correlation_id = ?1",
            params![correlation_id.as_str()],
        )
        .map_err(db_err("failed to close pending action"))?;

        let record = ActionRecord::complete(pending, final_ref, result, completed_at);
        Self::insert_history(&tx, &record)?;

        tx.commit().map_err(db_err("failed to commit terminal result"))?;
        Ok(Some(record))
    }

    async fn append_completed_action(&self, record: ActionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;

        let open: Option<String> = tx
            .query_row(
                "SELECT kind FROM pending_actions WHERE device_id = ?1",
                params![record.device_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to load pending action"))?;
        if let Some(kind) = open {
            let kind: ActionKind = kind.parse().map_err(StoreError::DataCorruption)?;
            return Err(StoreError::PendingConflict {
                device_id: record.device_id,
                pending: kind.pending_kind(),
            });
        }

        Self::insert_history(&tx, &record)?;
        tx.commit().map_err(db_err("failed to commit completed action"))?;
        Ok(())
    }

    async fn get_action_history(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM action_history WHERE device_id = ?1 ORDER BY seq"
            ))
            .map_err(db_err("failed to prepare query"))?;

        let history = stmt
            .query_map(params![device_id.to_string()], Self::row_to_record)
            .map_err(db_err("failed to load action history"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect action history"))?;

        Ok(history)
    }

    async fn find_history_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ActionRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {HISTORY_COLUMNS} FROM action_history
                 WHERE correlation_id = ?1 ORDER BY seq DESC LIMIT 1"
            ),
            params![correlation_id.as_str()],
            Self::row_to_record,
        )
        .optional()
        .map_err(db_err("failed to load action history"))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::make_device;
    use crate::types::{Platform, ProtocolStatus, VerificationStatus};
    use chrono::Duration;

    fn make_pending(device_id: DeviceId, kind: ActionKind, id: &str) -> PendingAction {
        PendingAction {
            device_id,
            kind,
            action_ref: ActionRef::Protocol {
                correlation_id: CorrelationId::from(id),
                status: None,
            },
            unlock_pin: Some("123456".into()),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_device_save_and_load() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = make_device(Platform::Windows);

        store.save_device(device.clone()).await.unwrap();
        let loaded = store.get_device(&device.id).await.unwrap();
        assert_eq!(loaded, Some(device));

        let missing = store.get_device(&DeviceId::new_random()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_unique_pending_per_device() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();

        store
            .insert_pending_action(make_pending(device, ActionKind::Wipe, "c1"))
            .await
            .unwrap();
        let err = store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "c2"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::PendingConflict {
                device_id: device,
                pending: crate::types::PendingKind::WipePending,
            }
        );

        // Another device is unaffected
        store
            .insert_pending_action(make_pending(DeviceId::new_random(), ActionKind::Lock, "c3"))
            .await
            .unwrap();
        assert_eq!(store.list_pending_actions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_terminal_transition() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();
        let id = CorrelationId::from("c1");
        let pending = make_pending(device, ActionKind::Lock, "c1");
        store.insert_pending_action(pending.clone()).await.unwrap();

        let loaded = store.get_pending_by_correlation(&id).await.unwrap();
        assert_eq!(loaded, Some(pending));

        let final_ref = ActionRef::Protocol {
            correlation_id: id.clone(),
            status: Some(ProtocolStatus::Acknowledged),
        };
        let record = store
            .record_terminal_result(&id, final_ref.clone(), ActionResult::Succeeded, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.unlock_pin.as_deref(), Some("123456"));

        let again = store
            .record_terminal_result(&id, final_ref, ActionResult::Succeeded, Utc::now())
            .await
            .unwrap();
        assert!(again.is_none());

        assert!(store.get_pending_action(&device).await.unwrap().is_none());
        let history = store.get_action_history(&device).await.unwrap();
        assert_eq!(history, vec![record.clone()]);
        assert_eq!(store.find_history_by_correlation(&id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_sqlite_release_and_rekey() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();
        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "c1"))
            .await
            .unwrap();

        store
            .rekey_pending_action(&device, &CorrelationId::from("c1"), &CorrelationId::from("q1"))
            .await
            .unwrap();
        assert!(!store
            .release_pending_action(&device, &CorrelationId::from("c1"))
            .await
            .unwrap());
        assert!(store
            .release_pending_action(&device, &CorrelationId::from("q1"))
            .await
            .unwrap());
        assert!(store.get_pending_action(&device).await.unwrap().is_none());

        let missing = store
            .rekey_pending_action(&device, &CorrelationId::from("q1"), &CorrelationId::from("x"))
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sqlite_profiles_and_verification() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();
        let now = Utc::now();

        store
            .set_expected_profiles(
                &device,
                vec![
                    ExpectedProfile {
                        identifier: "b".into(),
                        earliest_install_date: now - Duration::days(1),
                    },
                    ExpectedProfile {
                        identifier: "a".into(),
                        earliest_install_date: now,
                    },
                ],
            )
            .await
            .unwrap();
        let expected = store.get_expected_profiles(&device).await.unwrap();
        assert_eq!(expected[0].identifier, "b");
        assert_eq!(expected[1].earliest_install_date, now);

        let mut report = InstalledProfileReport::new();
        report.insert("a".into(), InstalledProfile { install_date: now });
        store.save_installed_profiles(&device, report.clone()).await.unwrap();
        assert_eq!(store.get_installed_profiles(&device).await.unwrap(), report);

        let update = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec![],
            retry: vec!["b".into()],
            updated_at: now,
        };
        store
            .update_verification(&device, &update, &HashMap::new())
            .await
            .unwrap();
        let read = store.get_retry_counters(&device).await.unwrap();
        store.update_verification(&device, &update, &read).await.unwrap();
        let counters = store.get_retry_counters(&device).await.unwrap();
        assert_eq!(counters.get("a"), Some(&0));
        assert_eq!(counters.get("b"), Some(&2));

        let failed = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec!["b".into()],
            retry: vec![],
            updated_at: now,
        };
        store.update_verification(&device, &failed, &counters).await.unwrap();
        let statuses = store.get_profile_statuses(&device).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].status, VerificationStatus::Failed);
        assert_eq!(statuses[1].retries, 2);
        assert_eq!(statuses[0].updated_at, now);
    }

    #[tokio::test]
    async fn test_sqlite_verification_stale_counters_and_pruning() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();
        let now = Utc::now();
        let update = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec![],
            retry: vec!["b".into()],
            updated_at: now,
        };
        store
            .update_verification(&device, &update, &HashMap::new())
            .await
            .unwrap();

        // A writer that read before the first write must not double count
        let stale = store
            .update_verification(&device, &update, &HashMap::new())
            .await;
        assert!(matches!(stale, Err(StoreError::ConcurrentUpdate(_))));
        assert_eq!(store.get_retry_counters(&device).await.unwrap().get("b"), Some(&1));

        // "b" is no longer expected
        let read = store.get_retry_counters(&device).await.unwrap();
        let only_a = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec![],
            retry: vec![],
            updated_at: now,
        };
        store.update_verification(&device, &only_a, &read).await.unwrap();
        let statuses = store.get_profile_statuses(&device).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].identifier, "a");
    }

    #[tokio::test]
    async fn test_sqlite_append_completed_action() {
        let store = SqliteStore::new_in_memory().unwrap();
        let device = DeviceId::new_random();
        let now = Utc::now();
        let record = ActionRecord {
            device_id: device,
            kind: ActionKind::Unlock,
            action_ref: ActionRef::NoDelivery {
                correlation_id: CorrelationId::from("u1"),
            },
            unlock_pin: None,
            requested_at: now,
            completed_at: now,
            result: ActionResult::Succeeded,
        };

        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "l1"))
            .await
            .unwrap();
        let err = store.append_completed_action(record.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::PendingConflict { .. }));
        assert!(store.get_action_history(&device).await.unwrap().is_empty());

        store
            .release_pending_action(&device, &CorrelationId::from("l1"))
            .await
            .unwrap();
        store.append_completed_action(record.clone()).await.unwrap();
        assert_eq!(store.get_action_history(&device).await.unwrap(), vec![record]);
        assert!(store.get_pending_action(&device).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dmc.db");
        let device = make_device(Platform::MacOs);
        {
            let store = SqliteStore::new(&path).unwrap();
            store.save_device(device.clone()).await.unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.get_device(&device.id).await.unwrap(), Some(device));
    }
}

//! Credential record storage using SQLite.
//!
//! Stores one row per (user, service). Tokens are sealed with AES-256-GCM
//! before they reach the database.

use super::encryption::{Sealed, TokenCipher};
use super::{CredentialRecord, Credentials, ServiceId, WebhookChannel};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SELECT_COLUMNS: &str = r#"
    user_id, service,
    access_token, access_token_nonce,
    refresh_token, refresh_token_nonce,
    expires_at, is_active,
    webhook_channel_id, webhook_resource_id, webhook_expires_at,
    updated_at
"#;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     service TEXT NOT NULL,
///     access_token TEXT NOT NULL,       -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,               -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     expires_at TEXT NOT NULL,         -- RFC 3339
///     is_active INTEGER NOT NULL,
///     webhook_channel_id TEXT,
///     webhook_resource_id TEXT,
///     webhook_expires_at TEXT,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, service)
/// );
/// ```
///
/// The UNIQUE constraint plus upsert keeps at most one record, and therefore
/// at most one active record, per (user, service).
///
/// # Thread Safety
/// The connection sits behind a `Mutex`; every call re-reads the row, so the
/// database is the only source of truth.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                service TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                webhook_channel_id TEXT,
                webhook_resource_id TEXT,
                webhook_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service)
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_service_active ON credentials(service, is_active)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store connection lock poisoned"))
    }

    /// Creates or reactivates the record for `(user_id, service)`.
    ///
    /// An absent `refresh_token` keeps the one already stored. Webhook columns
    /// are left untouched; the webhook manager owns them.
    pub fn upsert(&self, user_id: &str, service: ServiceId, credentials: &Credentials) -> Result<()> {
        let access = self
            .cipher
            .seal(&credentials.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = self
            .cipher
            .seal_optional(credentials.refresh_token.as_deref())
            .context("Failed to encrypt refresh token")?;
        let (refresh_ciphertext, refresh_nonce) = split_optional(refresh);

        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, service,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    expires_at, is_active, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)
                ON CONFLICT(user_id, service) DO UPDATE SET
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    refresh_token = COALESCE(excluded.refresh_token, credentials.refresh_token),
                    refresh_token_nonce = CASE
                        WHEN excluded.refresh_token IS NULL THEN credentials.refresh_token_nonce
                        ELSE excluded.refresh_token_nonce
                    END,
                    expires_at = excluded.expires_at,
                    is_active = 1,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    service.as_str(),
                    access.ciphertext,
                    access.nonce,
                    refresh_ciphertext,
                    refresh_nonce,
                    credentials.expires_at.to_rfc3339(),
                    now,
                ],
            )
            .context("Failed to upsert credentials")?;

        Ok(())
    }

    /// Replaces the access token (and refresh token, if rotated) of an active
    /// record. Returns `false` if no active record exists.
    pub fn update_tokens(
        &self,
        user_id: &str,
        service: ServiceId,
        credentials: &Credentials,
    ) -> Result<bool> {
        let access = self
            .cipher
            .seal(&credentials.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = self
            .cipher
            .seal_optional(credentials.refresh_token.as_deref())
            .context("Failed to encrypt refresh token")?;
        let (refresh_ciphertext, refresh_nonce) = split_optional(refresh);

        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = ?3,
                    access_token_nonce = ?4,
                    refresh_token = COALESCE(?5, refresh_token),
                    refresh_token_nonce = CASE WHEN ?5 IS NULL THEN refresh_token_nonce ELSE ?6 END,
                    expires_at = ?7,
                    updated_at = ?8
                WHERE user_id = ?1 AND service = ?2 AND is_active = 1
                "#,
                params![
                    user_id,
                    service.as_str(),
                    access.ciphertext,
                    access.nonce,
                    refresh_ciphertext,
                    refresh_nonce,
                    credentials.expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update tokens")?;

        Ok(rows > 0)
    }

    /// Fetches the record regardless of `is_active`.
    pub fn get(&self, user_id: &str, service: ServiceId) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM credentials WHERE user_id = ?1 AND service = ?2",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id, service.as_str()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(self.read_record(row)?)),
            None => Ok(None),
        }
    }

    /// Fetches the record only if it is active.
    pub fn get_active(&self, user_id: &str, service: ServiceId) -> Result<Option<CredentialRecord>> {
        Ok(self.get(user_id, service)?.filter(|r| r.is_active))
    }

    /// Records a freshly registered channel, replacing any previous triple.
    pub fn set_webhook(
        &self,
        user_id: &str,
        service: ServiceId,
        channel: &WebhookChannel,
    ) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    webhook_channel_id = ?3,
                    webhook_resource_id = ?4,
                    webhook_expires_at = ?5,
                    updated_at = ?6
                WHERE user_id = ?1 AND service = ?2 AND is_active = 1
                "#,
                params![
                    user_id,
                    service.as_str(),
                    channel.channel_id,
                    channel.resource_id,
                    channel.expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store webhook channel")?;

        Ok(rows > 0)
    }

    /// Clears all three webhook columns.
    pub fn clear_webhook(&self, user_id: &str, service: ServiceId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    webhook_channel_id = NULL,
                    webhook_resource_id = NULL,
                    webhook_expires_at = NULL,
                    updated_at = ?3
                WHERE user_id = ?1 AND service = ?2
                "#,
                params![user_id, service.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to clear webhook channel")?;

        Ok(rows > 0)
    }

    /// Soft-deletes the record: `is_active = 0` and webhook columns cleared.
    ///
    /// Returns `true` if a record exists (active or not), so repeated calls
    /// behave the same.
    pub fn deactivate(&self, user_id: &str, service: ServiceId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    is_active = 0,
                    webhook_channel_id = NULL,
                    webhook_resource_id = NULL,
                    webhook_expires_at = NULL,
                    updated_at = ?3
                WHERE user_id = ?1 AND service = ?2
                "#,
                params![user_id, service.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to deactivate credentials")?;

        Ok(rows > 0)
    }

    /// Lists user ids with an active record for `service`.
    pub fn list_active(&self, service: ServiceId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM credentials WHERE service = ?1 AND is_active = 1 ORDER BY user_id",
            )
            .context("Failed to prepare query")?;

        let users = stmt
            .query_map(params![service.as_str()], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(users)
    }

    /// Lists services with an active record for `user_id`.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<ServiceId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT service FROM credentials WHERE user_id = ?1 AND is_active = 1 ORDER BY service",
            )
            .context("Failed to prepare query")?;

        let names = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        names
            .iter()
            .map(|name| name.parse::<ServiceId>().map_err(anyhow::Error::from))
            .collect()
    }

    fn read_record(&self, row: &Row<'_>) -> Result<CredentialRecord> {
        let user_id: String = row.get(0)?;
        let service: String = row.get(1)?;
        let service = service.parse::<ServiceId>()?;

        let access_token = self
            .cipher
            .open(&Sealed {
                ciphertext: row.get(2)?,
                nonce: row.get(3)?,
            })
            .context("Failed to decrypt access token")?;

        let refresh_ciphertext: Option<String> = row.get(4)?;
        let refresh_nonce: Option<String> = row.get(5)?;
        let refresh_token = match (refresh_ciphertext, refresh_nonce) {
            (Some(ciphertext), Some(nonce)) => Some(
                self.cipher
                    .open(&Sealed { ciphertext, nonce })
                    .context("Failed to decrypt refresh token")?,
            ),
            _ => None,
        };

        let expires_at = parse_timestamp(&row.get::<_, String>(6)?)
            .context("Failed to parse expires_at")?;
        let is_active: i64 = row.get(7)?;

        let webhook_expires_at = row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_timestamp(&s))
            .transpose()
            .context("Failed to parse webhook_expires_at")?;

        let updated_at = parse_timestamp(&row.get::<_, String>(11)?)
            .context("Failed to parse updated_at")?;

        Ok(CredentialRecord {
            user_id,
            service,
            credentials: Credentials {
                access_token,
                refresh_token,
                expires_at,
            },
            is_active: is_active != 0,
            webhook_channel_id: row.get(8)?,
            webhook_resource_id: row.get(9)?,
            webhook_expires_at,
            updated_at,
        })
    }
}

fn split_optional(sealed: Option<Sealed>) -> (Option<String>, Option<String>) {
    match sealed {
        Some(s) => (Some(s.ciphertext), Some(s.nonce)),
        None => (None, None),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

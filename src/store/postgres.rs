//! PostgreSQL store. Schema lives in `sql/schema.sql`.
//!
//! Timestamps come from the caller's clock rather than `NOW()` so that expiry decisions made
//! in the core and in SQL agree.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Connection, PgPool, Row};
use tracing::{info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::{
    FailedLogin, InsertUserOutcome, ParentUpdate, PasswordReset, RefreshRotation, RoleStore,
    SessionStore, SuccessfulLogin, TokenSweep, UserStore,
};
use crate::credentials::lockout::LockoutPolicy;
use crate::credentials::permissions::RoleGraph;
use crate::model::{
    DeviceInfo, LocationInfo, LoginMethod, Permission, Role, RolePermission, Session,
    SessionStatus, User, UserRole, UserStatus, VerificationToken,
};

const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, phone_number, \
    status, is_email_verified, email_verified_at, failed_login_attempts, locked_until, \
    email_verification_token, email_verification_expires_at, password_reset_token, \
    password_reset_expires_at, last_login_at, password_changed_at, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, user_id, session_token_hash, refresh_token_hash, status, \
    expires_at, refresh_expires_at, last_activity_at, user_agent, device_type, browser, \
    operating_system, device_fingerprint, ip_address, country, city, device_name, login_method, \
    is_known_device, risk_score, initial_ip, last_ip, created_at, revoked_at";

const ROLE_COLUMNS: &str = "id, name, normalized_name, description, parent_role_id, \
    is_inherited, is_system_role, is_active, created_at";

fn db_span(operation: &str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn token_pair(
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> Option<VerificationToken> {
    match (token, expires_at) {
        (Some(token), Some(expires_at)) => Some(VerificationToken { token, expires_at }),
        _ => None,
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let status: String = row.try_get("status")?;
    let failed: i32 = row.try_get("failed_login_attempts")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone_number: row.try_get("phone_number")?,
        status: status.parse::<UserStatus>().map_err(|err| anyhow!(err))?,
        is_email_verified: row.try_get("is_email_verified")?,
        email_verified_at: row.try_get("email_verified_at")?,
        failed_login_attempts: u32::try_from(failed).unwrap_or(0),
        locked_until: row.try_get("locked_until")?,
        email_verification: token_pair(
            row.try_get("email_verification_token")?,
            row.try_get("email_verification_expires_at")?,
        ),
        password_reset: token_pair(
            row.try_get("password_reset_token")?,
            row.try_get("password_reset_expires_at")?,
        ),
        last_login_at: row.try_get("last_login_at")?,
        password_changed_at: row.try_get("password_changed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    let device_type: String = row.try_get("device_type")?;
    let login_method: String = row.try_get("login_method")?;
    let risk_score: i16 = row.try_get("risk_score")?;
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        session_token_hash: row.try_get("session_token_hash")?,
        refresh_token_hash: row.try_get("refresh_token_hash")?,
        status: status.parse::<SessionStatus>().map_err(|err| anyhow!(err))?,
        expires_at: row.try_get("expires_at")?,
        refresh_expires_at: row.try_get("refresh_expires_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        device: DeviceInfo {
            user_agent: row.try_get("user_agent")?,
            device_type: device_type.parse().unwrap_or(crate::model::DeviceType::Unknown),
            browser: row.try_get("browser")?,
            operating_system: row.try_get("operating_system")?,
            fingerprint: row.try_get("device_fingerprint")?,
        },
        location: LocationInfo {
            ip_address: row.try_get("ip_address")?,
            country: row.try_get("country")?,
            city: row.try_get("city")?,
        },
        device_name: row.try_get("device_name")?,
        login_method: LoginMethod::parse_lossy(&login_method),
        is_known_device: row.try_get("is_known_device")?,
        risk_score: u8::try_from(risk_score).unwrap_or(100),
        initial_ip: row.try_get("initial_ip")?,
        last_ip: row.try_get("last_ip")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role> {
    Ok(Role {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        description: row.try_get("description")?,
        parent_role_id: row.try_get("parent_role_id")?,
        is_inherited: row.try_get("is_inherited")?,
        is_system_role: row.try_get("is_system_role")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_role_from_row(row: &PgRow) -> Result<UserRole> {
    Ok(UserRole {
        user_id: row.try_get("user_id")?,
        role_id: row.try_get("role_id")?,
        granted_by: row.try_get("granted_by")?,
        granted_at: row.try_get("granted_at")?,
        is_active: row.try_get("is_active")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `sql/schema.sql`. Every statement is idempotent.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn apply_schema(&self) -> Result<()> {
        let schema = include_str!("../../sql/schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .instrument(db_span("MIGRATE", "schema.sql"))
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    async fn fetch_user(&self, filter: &str, value: &str) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {filter} LIMIT 1");
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to look up user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn fetch_session(&self, column: &str, hash: &[u8]) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {column} = $1");
        let row = sqlx::query(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to look up session")?;
        row.as_ref().map(session_from_row).transpose()
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &User) -> Result<InsertUserOutcome> {
        let query = format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        );
        let result = sqlx::query(&query)
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.phone_number)
            .bind(user.status.as_str())
            .bind(user.is_email_verified)
            .bind(user.email_verified_at)
            .bind(i32::try_from(user.failed_login_attempts).unwrap_or(i32::MAX))
            .bind(user.locked_until)
            .bind(user.email_verification.as_ref().map(|t| t.token.as_str()))
            .bind(user.email_verification.as_ref().map(|t| t.expires_at))
            .bind(user.password_reset.as_ref().map(|t| t.token.as_str()))
            .bind(user.password_reset.as_ref().map(|t| t.expires_at))
            .bind(user.last_login_at)
            .bind(user.password_changed_at)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await;

        match result {
            Ok(_) => Ok(InsertUserOutcome::Created),
            Err(err) if is_unique_violation(&err) => Ok(InsertUserOutcome::EmailTaken),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        lockout: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailedLogin>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start failed login transaction")?;

        // The row stays locked until commit, so concurrent failures queue up behind each other.
        let query = r"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1,
                updated_at = $2
            WHERE id = $1
            RETURNING failed_login_attempts
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to count failed login")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let failed: i32 = row.try_get("failed_login_attempts")?;
        let failed_attempts = u32::try_from(failed).unwrap_or(0);

        let locked_until = lockout
            .lockout_duration(failed_attempts)
            .map(|duration| now + duration);
        if let Some(locked_until) = locked_until {
            let query = r"
                UPDATE users
                SET locked_until = $2,
                    status = 'blocked'
                WHERE id = $1
            ";
            sqlx::query(query)
                .bind(user_id)
                .bind(locked_until)
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to lock account")?;
        }

        tx.commit()
            .await
            .context("failed to commit failed login")?;
        Ok(Some(FailedLogin {
            failed_attempts,
            locked_until,
        }))
    }

    async fn record_successful_login(&self, login: &SuccessfulLogin) -> Result<bool> {
        let query = r"
            UPDATE users
            SET failed_login_attempts = 0,
                locked_until = NULL,
                status = CASE WHEN status = 'blocked' THEN 'active' ELSE status END,
                password_hash = COALESCE($3, password_hash),
                last_login_at = $4,
                updated_at = $4
            WHERE id = $1
              AND password_changed_at IS NOT DISTINCT FROM $2
        ";
        let result = sqlx::query(query)
            .bind(login.user_id)
            .bind(login.password_changed_at)
            .bind(login.rehashed_password.as_deref())
            .bind(login.now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to record successful login")?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_password(&self, reset: &PasswordReset) -> Result<bool> {
        let query = r"
            UPDATE users
            SET password_hash = $3,
                password_changed_at = $4,
                password_reset_token = NULL,
                password_reset_expires_at = NULL,
                failed_login_attempts = 0,
                locked_until = NULL,
                status = CASE WHEN status = 'blocked' THEN 'active' ELSE status END,
                updated_at = $5
            WHERE id = $1
              AND password_reset_token = $2
              AND password_reset_expires_at > $5
        ";
        let result = sqlx::query(query)
            .bind(reset.user_id)
            .bind(&reset.token)
            .bind(&reset.password_hash)
            .bind(reset.changed_at)
            .bind(reset.now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to reset password")?;
        Ok(result.rows_affected() == 1)
    }

    async fn confirm_email(&self, user_id: Uuid, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let query = r"
            UPDATE users
            SET is_email_verified = TRUE,
                email_verified_at = $3,
                email_verification_token = NULL,
                email_verification_expires_at = NULL,
                status = 'active',
                updated_at = $3
            WHERE id = $1
              AND email_verification_token = $2
              AND email_verification_expires_at > $3
              AND status = 'pending_confirmation'
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to confirm email")?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_email_verification(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE users
            SET email_verification_token = $2,
                email_verification_expires_at = $3,
                updated_at = $4
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(&token.token)
            .bind(token.expires_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to store verification token")?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_password_reset(
        &self,
        user_id: Uuid,
        token: &VerificationToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE users
            SET password_reset_token = $2,
                password_reset_expires_at = $3,
                updated_at = $4
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(&token.token)
            .bind(token.expires_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to store password reset token")?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = "UPDATE users SET status = $2, updated_at = $3 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update user status")?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to look up user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.fetch_user("lower(email) = lower($1)", email).await
    }

    async fn find_user_by_verification_token(&self, token: &str) -> Result<Option<User>> {
        self.fetch_user("email_verification_token = $1", token).await
    }

    async fn find_user_by_password_reset_token(&self, token: &str) -> Result<Option<User>> {
        self.fetch_user("password_reset_token = $1", token).await
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM users WHERE lower(email) = lower($1)) AS found";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to check email")?;
        Ok(row.try_get("found")?)
    }

    async fn clear_expired_tokens(&self, now: DateTime<Utc>) -> Result<TokenSweep> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start token cleanup transaction")?;

        let query = r"
            UPDATE users
            SET email_verification_token = NULL,
                email_verification_expires_at = NULL,
                updated_at = $1
            WHERE email_verification_token IS NOT NULL
              AND email_verification_expires_at <= $1
        ";
        let email = sqlx::query(query)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to clear expired verification tokens")?;

        let query = r"
            UPDATE users
            SET password_reset_token = NULL,
                password_reset_expires_at = NULL,
                updated_at = $1
            WHERE password_reset_token IS NOT NULL
              AND password_reset_expires_at <= $1
        ";
        let reset = sqlx::query(query)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to clear expired reset tokens")?;

        tx.commit()
            .await
            .context("failed to commit token cleanup")?;

        Ok(TokenSweep {
            email_verification: email.rows_affected(),
            password_reset: reset.rows_affected(),
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await
            .context("failed to acquire database connection")?;
        conn.ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await
            .context("failed to ping database")
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> Result<bool> {
        let query = format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, \
              $19, $20, $21, $22, $23, $24)"
        );
        let result = sqlx::query(&query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.session_token_hash)
            .bind(&session.refresh_token_hash)
            .bind(session.status.as_str())
            .bind(session.expires_at)
            .bind(session.refresh_expires_at)
            .bind(session.last_activity_at)
            .bind(&session.device.user_agent)
            .bind(session.device.device_type.as_str())
            .bind(&session.device.browser)
            .bind(&session.device.operating_system)
            .bind(&session.device.fingerprint)
            .bind(&session.location.ip_address)
            .bind(&session.location.country)
            .bind(&session.location.city)
            .bind(&session.device_name)
            .bind(session.login_method.as_str())
            .bind(session.is_known_device)
            .bind(i16::from(session.risk_score))
            .bind(&session.initial_ip)
            .bind(&session.last_ip)
            .bind(session.created_at)
            .bind(session.revoked_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert session"),
        }
    }

    async fn find_session_by_token_hash(&self, hash: &[u8]) -> Result<Option<Session>> {
        self.fetch_session("session_token_hash", hash).await
    }

    async fn find_session_by_refresh_hash(&self, hash: &[u8]) -> Result<Option<Session>> {
        self.fetch_session("refresh_token_hash", hash).await
    }

    async fn fingerprint_seen(&self, user_id: Uuid, fingerprint: &str) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM sessions WHERE user_id = $1 AND device_fingerprint = $2
            ) AS seen
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(fingerprint)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to check device fingerprint")?;
        Ok(row.try_get("seen")?)
    }

    async fn rotate_refresh_token(&self, rotation: &RefreshRotation) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET refresh_token_hash = $3,
                expires_at = $4,
                refresh_expires_at = $5,
                last_ip = $6,
                last_activity_at = $7
            WHERE id = $1
              AND refresh_token_hash = $2
              AND status = 'active'
        ";
        let result = sqlx::query(query)
            .bind(rotation.session_id)
            .bind(&rotation.current_hash)
            .bind(&rotation.next_hash)
            .bind(rotation.expires_at)
            .bind(rotation.refresh_expires_at)
            .bind(&rotation.last_ip)
            .bind(rotation.now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to rotate refresh token")?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE sessions
            SET status = $2,
                revoked_at = CASE WHEN $2 = 'revoked' THEN $3 ELSE revoked_at END
            WHERE id = $1
              AND status = 'active'
        ";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to close session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<Uuid>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE sessions
            SET status = $3,
                revoked_at = CASE WHEN $3 = 'revoked' THEN $4 ELSE revoked_at END
            WHERE user_id = $1
              AND status = 'active'
              AND ($2::uuid IS NULL OR id <> $2)
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(keep)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to close user sessions")?;
        Ok(result.rows_affected())
    }

    async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = r"
            UPDATE sessions
            SET status = 'expired'
            WHERE status = 'active'
              AND (expires_at <= $1 OR refresh_expires_at <= $1)
        ";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to expire sessions")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn load_role_graph(&self) -> Result<RoleGraph> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM roles");
        let roles = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to load roles")?
            .iter()
            .map(role_from_row)
            .collect::<Result<Vec<_>>>()?;

        let query = "SELECT id, name, resource, action, scope, description, is_active FROM permissions";
        let permissions = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load permissions")?
            .iter()
            .map(|row| -> Result<Permission> {
                Ok(Permission {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    resource: row.try_get("resource")?,
                    action: row.try_get("action")?,
                    scope: row.try_get("scope")?,
                    description: row.try_get("description")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let query = r"
            SELECT role_id, permission_id, granted_by, granted_at, is_active, expires_at, conditions
            FROM role_permissions
        ";
        let grants = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load role permissions")?
            .iter()
            .map(|row| -> Result<RolePermission> {
                Ok(RolePermission {
                    role_id: row.try_get("role_id")?,
                    permission_id: row.try_get("permission_id")?,
                    granted_by: row.try_get("granted_by")?,
                    granted_at: row.try_get("granted_at")?,
                    is_active: row.try_get("is_active")?,
                    expires_at: row.try_get("expires_at")?,
                    conditions: row.try_get("conditions")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RoleGraph::new(roles, permissions, grants))
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        let query = r"
            SELECT user_id, role_id, granted_by, granted_at, is_active, expires_at
            FROM user_roles
            WHERE user_id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load user roles")?
            .iter()
            .map(user_role_from_row)
            .collect()
    }

    async fn insert_role(&self, role: &Role) -> Result<()> {
        let query = format!(
            "INSERT INTO roles ({ROLE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&query)
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.normalized_name)
            .bind(&role.description)
            .bind(role.parent_role_id)
            .bind(role.is_inherited)
            .bind(role.is_system_role)
            .bind(role.is_active)
            .bind(role.created_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await
            .with_context(|| format!("failed to insert role {}", role.name))?;
        Ok(())
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        let query = r"
            INSERT INTO permissions (id, name, resource, action, scope, description, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(permission.id)
            .bind(&permission.name)
            .bind(&permission.resource)
            .bind(&permission.action)
            .bind(&permission.scope)
            .bind(&permission.description)
            .bind(permission.is_active)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .with_context(|| format!("failed to insert permission {}", permission.name))?;
        Ok(())
    }

    async fn attach_parent(&self, child: Uuid, parent: Uuid) -> Result<ParentUpdate> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start role hierarchy transaction")?;

        // Serialize hierarchy edits so two concurrent attaches cannot close a loop together.
        let query = "LOCK TABLE roles IN SHARE ROW EXCLUSIVE MODE";
        sqlx::query(query)
            .execute(&mut *tx)
            .instrument(db_span("LOCK", query))
            .await
            .context("failed to lock roles")?;

        let query = format!("SELECT {ROLE_COLUMNS} FROM roles");
        let roles = sqlx::query(&query)
            .fetch_all(&mut *tx)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to load roles")?
            .iter()
            .map(role_from_row)
            .collect::<Result<Vec<_>>>()?;

        let graph = RoleGraph::new(roles, Vec::new(), Vec::new());
        if let Err(err) = graph.check_parent(child, parent) {
            if let Err(rollback) = tx.rollback().await {
                warn!(
                    %child,
                    %parent,
                    "Failed to roll back rejected role hierarchy change: {rollback}"
                );
            }
            return Ok(ParentUpdate::Rejected(err));
        }

        let query = "UPDATE roles SET parent_role_id = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(child)
            .bind(parent)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to attach parent role")?;

        tx.commit()
            .await
            .context("failed to commit role hierarchy change")?;
        Ok(ParentUpdate::Attached)
    }

    async fn detach_parent(&self, child: Uuid) -> Result<bool> {
        let query = r"
            UPDATE roles SET parent_role_id = NULL
            WHERE id = $1 AND parent_role_id IS NOT NULL
        ";
        let result = sqlx::query(query)
            .bind(child)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to detach parent role")?;
        Ok(result.rows_affected() == 1)
    }

    async fn grant_permission(&self, grant: &RolePermission) -> Result<()> {
        let query = r"
            INSERT INTO role_permissions
                (role_id, permission_id, granted_by, granted_at, is_active, expires_at, conditions)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (role_id, permission_id) DO UPDATE
            SET granted_by = EXCLUDED.granted_by,
                granted_at = EXCLUDED.granted_at,
                is_active = EXCLUDED.is_active,
                expires_at = EXCLUDED.expires_at,
                conditions = EXCLUDED.conditions
        ";
        sqlx::query(query)
            .bind(grant.role_id)
            .bind(grant.permission_id)
            .bind(grant.granted_by)
            .bind(grant.granted_at)
            .bind(grant.is_active)
            .bind(grant.expires_at)
            .bind(&grant.conditions)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to grant permission")?;
        Ok(())
    }

    async fn assign_role(&self, assignment: &UserRole) -> Result<()> {
        let query = r"
            INSERT INTO user_roles (user_id, role_id, granted_by, granted_at, is_active, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, role_id) DO UPDATE
            SET granted_by = EXCLUDED.granted_by,
                granted_at = EXCLUDED.granted_at,
                is_active = EXCLUDED.is_active,
                expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(assignment.user_id)
            .bind(assignment.role_id)
            .bind(assignment.granted_by)
            .bind(assignment.granted_at)
            .bind(assignment.is_active)
            .bind(assignment.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to assign role")?;
        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        let query = r"
            UPDATE user_roles SET is_active = FALSE
            WHERE user_id = $1 AND role_id = $2 AND is_active
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to revoke role")?;
        Ok(result.rows_affected() == 1)
    }
}

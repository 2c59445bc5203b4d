//! Local user accounts that own long-term memory

use crate::memory::UserId;
use crate::memory_db::schema::format_timestamp;
use anyhow::Context;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand_core::OsRng;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::info;

pub struct UserStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl UserStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    /// Log in as `username`, registering the account on first use.
    /// A wrong password for an existing account is an error.
    pub fn create_or_authenticate(&self, username: &str, password: &str) -> anyhow::Result<UserId> {
        let username = username.trim();
        if username.is_empty() {
            anyhow::bail!("Username must not be empty");
        }
        if password.is_empty() {
            anyhow::bail!("Password must not be empty");
        }

        match self.lookup(username)? {
            Some((user_id, stored)) => {
                if verify_password(password, &stored)? {
                    Ok(user_id)
                } else {
                    anyhow::bail!("Invalid password for user {}", username)
                }
            }
            None => self.create_user(username, password),
        }
    }

    fn lookup(&self, username: &str) -> anyhow::Result<Option<(UserId, String)>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT user_id, password_hash FROM users WHERE username = ?1",
                [username],
                |row| Ok((UserId(row.get(0)?), row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn create_user(&self, username: &str, password: &str) -> anyhow::Result<UserId> {
        let password_hash = hash_password(password)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, password_hash, format_timestamp(&Utc::now())],
        )
        .with_context(|| format!("Failed to register user {}", username))?;
        let user_id = UserId(conn.last_insert_rowid());
        info!("Registered user {} ({})", username, user_id);
        Ok(user_id)
    }
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

fn verify_password(password: &str, stored: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| anyhow::anyhow!("Stored password hash is malformed: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

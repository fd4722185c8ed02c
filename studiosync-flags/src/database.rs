use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, Error as SqlxError, PgPool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CustomDatabaseError {
    #[error("Pg error: {0}")]
    Other(#[from] sqlx::Error),

    #[error("Timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

pub async fn get_pool(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
}

/// Determines if a sqlx::Error represents a unique constraint violation
pub fn is_unique_violation(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => {
            // Class 23 (integrity constraint violation); 23505 = unique_violation
            // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = db_error.code() {
                code.as_ref() == "23505"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("duplicate key value violates unique constraint")
            }
        }
        _ => false,
    }
}

/// Determines if a sqlx::Error represents a foreign key constraint violation
pub fn is_foreign_key_violation(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => {
            // 23503 = foreign_key_violation
            if let Some(code) = db_error.code() {
                code.as_ref() == "23503"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("violates foreign key constraint")
                    || msg.contains("foreign key constraint")
            }
        }
        _ => false,
    }
}

//! Transaction-scoped advisory locks.
//!
//! Postgres advisory locks take integers, so names are hashed with 64-bit
//! FNV-1a and the top bit is cleared to keep the key positive. Two names may
//! collide; the only effect is that they wait on each other.

use txkit_core::{TxContext, TxError};

use crate::database::{PgTransaction, pg_error};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Advisory lock key for `name`.
#[must_use]
pub fn lock_key(name: &str) -> i64 {
    let hash = name.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    // top bit cleared, so the value fits
    i64::try_from(hash & !(1 << 63)).unwrap_or(i64::MAX)
}

/// Wait for the advisory lock on `name`. Released when the transaction ends.
///
/// # Errors
///
/// Returns [`TxError::Done`] if the transaction is finished, or the database error.
pub async fn lock(ctx: &mut TxContext<PgTransaction>, name: &str) -> Result<(), TxError> {
    let key = lock_key(name);
    tracing::debug!(lock = name, key, "Acquiring advisory lock");

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(ctx.tx()?.conn())
        .await
        .map_err(pg_error)?;
    Ok(())
}

/// Take the advisory lock on `name` if it is free. Returns whether it was taken.
///
/// # Errors
///
/// Returns [`TxError::Done`] if the transaction is finished, or the database error.
pub async fn try_lock(ctx: &mut TxContext<PgTransaction>, name: &str) -> Result<bool, TxError> {
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
        .bind(lock_key(name))
        .fetch_one(ctx.tx()?.conn())
        .await
        .map_err(pg_error)?;

    if !acquired {
        tracing::debug!(lock = name, "Advisory lock is held elsewhere");
    }
    Ok(acquired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_matches_fnv1a() {
        // FNV-1a 64 of "" and "a", top bit cleared
        assert_eq!(lock_key(""), 0x4bf2_9ce4_8422_2325);
        assert_eq!(lock_key("a"), 0x2f63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_lock_key_is_stable_and_positive() {
        let key = lock_key("outbox-relay");
        assert_eq!(key, lock_key("outbox-relay"));
        assert!(key >= 0);
        assert_ne!(key, lock_key("outbox-relay-2"));
    }
}

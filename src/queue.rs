//! Alert work queue — PostgreSQL-backed, at-least-once delivery.
//!
//! Uses `FOR UPDATE SKIP LOCKED` so concurrent workers each claim their own
//! job without stepping on each other. Intake deduplication makes redelivery
//! harmless; failed jobs are rescheduled with exponential backoff until their
//! attempts are exhausted.

use sqlx::PgPool;
use tracing::warn;

/// A claimed queue entry ready for processing.
#[derive(Debug, Clone)]
pub struct AlertJob {
    pub id: i64,
    pub alert_id: i64,
    pub attempt: i32,
    pub max_attempts: i32,
}

/// Backoff before retry number `attempt` (0-based): `2^attempt` seconds.
/// No jitter; the exponent is the contract.
pub fn backoff_seconds(attempt: i32) -> i64 {
    2i64.pow(attempt.clamp(0, 30) as u32)
}

/// Enqueue an alert for asynchronous enrichment.
pub async fn enqueue(pool: &PgPool, alert_id: i64) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) =
        sqlx::query_as("INSERT INTO alert_queue (alert_id) VALUES ($1) RETURNING id")
            .bind(alert_id)
            .fetch_one(pool)
            .await?;
    Ok(id)
}

/// Atomically claim the next due job.
///
/// Returns `None` when nothing is pending and due. Concurrent callers never
/// claim the same row.
pub async fn claim(pool: &PgPool) -> Result<Option<AlertJob>, sqlx::Error> {
    let row: Option<(i64, i64, i32, i32)> = sqlx::query_as(
        r#"
        UPDATE alert_queue
        SET    status = 'running',
               claimed_at = NOW()
        WHERE  id = (
            SELECT id
            FROM   alert_queue
            WHERE  status = 'pending'
              AND  available_at <= NOW()
            ORDER  BY available_at ASC, id ASC
            LIMIT  1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, alert_id, attempt, max_attempts
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, alert_id, attempt, max_attempts)| AlertJob {
        id,
        alert_id,
        attempt,
        max_attempts,
    }))
}

/// Mark a job as successfully completed.
pub async fn complete(pool: &PgPool, job: &AlertJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE alert_queue SET status = 'done', completed_at = NOW(), last_error = NULL \
         WHERE id = $1",
    )
    .bind(job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a transient failure. The job is rescheduled `2^attempt` seconds out
/// until attempts are exhausted, then parked as permanently failed.
pub async fn fail(pool: &PgPool, job: &AlertJob, error: &str) -> Result<(), sqlx::Error> {
    let next_attempt = job.attempt + 1;
    let exhausted = next_attempt >= job.max_attempts;
    let new_status = if exhausted { "failed" } else { "pending" };
    let delay = backoff_seconds(job.attempt);

    if exhausted {
        warn!(
            job_id = job.id,
            alert_id = job.alert_id,
            attempts = next_attempt,
            "Alert job permanently failed after {} attempts",
            next_attempt
        );
    }

    sqlx::query(
        "UPDATE alert_queue \
         SET status       = $1, \
             attempt      = $2, \
             last_error   = $3, \
             available_at = NOW() + make_interval(secs => $4), \
             completed_at = CASE WHEN $5 THEN NOW() ELSE NULL END, \
             claimed_at   = NULL \
         WHERE id = $6",
    )
    .bind(new_status)
    .bind(next_attempt)
    .bind(error)
    .bind(delay as f64)
    .bind(exhausted)
    .bind(job.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Park a job as failed without retry (terminal errors: alert gone, bad
/// payload).
pub async fn discard(pool: &PgPool, job: &AlertJob, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE alert_queue \
         SET status = 'failed', last_error = $1, completed_at = NOW(), claimed_at = NULL \
         WHERE id = $2",
    )
    .bind(error)
    .bind(job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Count pending jobs (metrics/logging).
pub async fn pending_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM alert_queue WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_seconds(0), 1);
        assert_eq!(backoff_seconds(1), 2);
        assert_eq!(backoff_seconds(2), 4);
    }

    #[test]
    fn backoff_is_clamped_for_absurd_attempts() {
        assert_eq!(backoff_seconds(-3), 1);
        assert_eq!(backoff_seconds(500), 2i64.pow(30));
    }
}

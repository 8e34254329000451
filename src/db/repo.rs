use super::model::StateRow;
use super::Pool;
use anyhow::Result;
use tracing::instrument;

#[instrument(skip(pool))]
pub async fn load_partition_state(
    pool: &Pool,
    stream: &str,
    partition: &str,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT key, value FROM partition_state WHERE stream = ? AND partition = ? ORDER BY key",
    )
    .bind(stream)
    .bind(partition)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Replace every stored key of one partition in a single transaction, so a
/// reader never observes half of a checkpoint.
#[instrument(skip(pool, entries))]
pub async fn replace_partition_state(
    pool: &Pool,
    stream: &str,
    partition: &str,
    entries: &[(&str, &str)],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM partition_state WHERE stream = ? AND partition = ?")
        .bind(stream)
        .bind(partition)
        .execute(&mut *tx)
        .await?;
    for &(key, value) in entries {
        sqlx::query(
            "INSERT INTO partition_state (stream, partition, key, value) VALUES (?, ?, ?, ?)",
        )
        .bind(stream)
        .bind(partition)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_partition_state(pool: &Pool, stream: Option<&str>) -> Result<Vec<StateRow>> {
    let rows = match stream {
        Some(stream) => {
            sqlx::query_as::<_, StateRow>(
                "SELECT stream, partition, key, value, updated_at FROM partition_state WHERE stream = ? ORDER BY stream, partition, key",
            )
            .bind(stream)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, StateRow>(
                "SELECT stream, partition, key, value, updated_at FROM partition_state ORDER BY stream, partition, key",
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn delete_partition_state(pool: &Pool, stream: &str, partition: &str) -> Result<u64> {
    let res = sqlx::query("DELETE FROM partition_state WHERE stream = ? AND partition = ?")
        .bind(stream)
        .bind(partition)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

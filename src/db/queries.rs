use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::status::{RecordKey, StatusPatch, StatusRecord};

const RECORD_COLUMNS: &str = "user_id, artist, origin_url, vocal_url, instrum_url, vc_source_url, \
                              vc_instrum_url, trained, model_url, vc_vocal_url, updated_at";

fn record_from_row(row: &PgRow) -> Result<StatusRecord, sqlx::Error> {
    Ok(StatusRecord {
        user_id: row.try_get("user_id")?,
        artist: row.try_get("artist")?,
        origin_url: row.try_get("origin_url")?,
        vocal_url: row.try_get("vocal_url")?,
        instrum_url: row.try_get("instrum_url")?,
        vc_source_url: row.try_get("vc_source_url")?,
        vc_instrum_url: row.try_get("vc_instrum_url")?,
        trained: row.try_get("trained")?,
        model_url: row.try_get("model_url")?,
        vc_vocal_url: row.try_get("vc_vocal_url")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Merge the set fields of `patch` into the record, creating it if needed.
///
/// Unset patch fields keep their stored value, so stages writing disjoint
/// fields concurrently never overwrite each other.
pub async fn merge_status(
    pool: &PgPool,
    key: &RecordKey,
    patch: &StatusPatch,
) -> Result<StatusRecord, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO status_records
            (user_id, artist, origin_url, vocal_url, instrum_url, vc_source_url,
             vc_instrum_url, trained, model_url, vc_vocal_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, FALSE), $9, $10)
        ON CONFLICT (user_id, artist) DO UPDATE SET
            origin_url     = COALESCE(EXCLUDED.origin_url, status_records.origin_url),
            vocal_url      = COALESCE(EXCLUDED.vocal_url, status_records.vocal_url),
            instrum_url    = COALESCE(EXCLUDED.instrum_url, status_records.instrum_url),
            vc_source_url  = COALESCE(EXCLUDED.vc_source_url, status_records.vc_source_url),
            vc_instrum_url = COALESCE(EXCLUDED.vc_instrum_url, status_records.vc_instrum_url),
            trained        = COALESCE($8, status_records.trained),
            model_url      = COALESCE(EXCLUDED.model_url, status_records.model_url),
            vc_vocal_url   = COALESCE(EXCLUDED.vc_vocal_url, status_records.vc_vocal_url),
            updated_at     = NOW()
        RETURNING {RECORD_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(&key.user_id)
        .bind(&key.artist)
        .bind(&patch.origin_url)
        .bind(&patch.vocal_url)
        .bind(&patch.instrum_url)
        .bind(&patch.vc_source_url)
        .bind(&patch.vc_instrum_url)
        .bind(patch.trained)
        .bind(&patch.model_url)
        .bind(&patch.vc_vocal_url)
        .fetch_one(pool)
        .await?;

    record_from_row(&row)
}

/// Get a record by identity
pub async fn get_status(
    pool: &PgPool,
    key: &RecordKey,
) -> Result<Option<StatusRecord>, sqlx::Error> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM status_records WHERE user_id = $1 AND artist = $2"
    );

    let row = sqlx::query(&sql)
        .bind(&key.user_id)
        .bind(&key.artist)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

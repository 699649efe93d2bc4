use crate::context::types::UsageContext;
use crate::file::error::FileResult;
use crate::file::types::StoredFile;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

/// Persistent record of files managed by the framework.
#[derive(Clone)]
pub struct FileStore {
    pool: SqlitePool,
}

impl FileStore {
    pub async fn new(pool: SqlitePool) -> FileResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                name TEXT NOT NULL,
                mime TEXT NOT NULL,
                extension TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                size INTEGER NOT NULL,
                upload_pending INTEGER NOT NULL,
                upload_failed INTEGER NOT NULL,
                is_private INTEGER NOT NULL,
                delete_pending INTEGER NOT NULL,
                node_ids TEXT NOT NULL,
                context TEXT,
                path TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_pending ON files(upload_pending)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn insert(&self, file: &StoredFile) -> FileResult<()> {
        let node_ids_json = serde_json::to_string(&file.node_ids)?;
        let context_json = file
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO files
            (id, hash, name, mime, extension, created_at, size, upload_pending,
             upload_failed, is_private, delete_pending, node_ids, context, path)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.content_hash)
        .bind(&file.descriptive_name)
        .bind(&file.mime_type)
        .bind(&file.extension)
        .bind(file.created_at)
        .bind(file.size as i64)
        .bind(file.upload_pending)
        .bind(file.upload_failed)
        .bind(file.is_private)
        .bind(file.delete_pending)
        .bind(node_ids_json)
        .bind(context_json)
        .bind(file.path.to_string_lossy().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> FileResult<Option<StoredFile>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_file).transpose()
    }

    /// Whether a file with the given content hash is already stored.
    pub async fn is_content_stored(&self, hash: &str) -> FileResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM files WHERE hash = ?")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    /// Updates the transfer state flags of a file.
    pub async fn set_flags(
        &self,
        id: &str,
        upload_pending: bool,
        upload_failed: bool,
        delete_pending: bool,
    ) -> FileResult<()> {
        sqlx::query(
            "UPDATE files SET upload_pending = ?, upload_failed = ?, delete_pending = ? WHERE id = ?",
        )
        .bind(upload_pending)
        .bind(upload_failed)
        .bind(delete_pending)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Files still waiting to be uploaded, newest first.
    pub async fn files_to_upload(&self) -> FileResult<Vec<StoredFile>> {
        let rows = sqlx::query(
            "SELECT * FROM files WHERE upload_pending = 1 AND delete_pending = 0 ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_file).collect()
    }

    /// Files marked for deletion.
    pub async fn files_for_deletion(&self) -> FileResult<Vec<StoredFile>> {
        let rows = sqlx::query("SELECT * FROM files WHERE delete_pending = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_file).collect()
    }

    /// All files uploaded (or uploading) from this device, newest first.
    pub async fn list_my_files(
        &self,
        only_pending: bool,
        only_private: bool,
    ) -> FileResult<Vec<StoredFile>> {
        let rows = sqlx::query("SELECT * FROM files ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut files: Vec<StoredFile> =
            rows.into_iter().map(row_to_file).collect::<FileResult<_>>()?;
        if only_pending {
            files.retain(|f| f.upload_pending);
        }
        if only_private {
            files.retain(|f| f.is_private);
        }
        Ok(files)
    }

    pub async fn delete(&self, id: &str) -> FileResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> FileResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

fn row_to_file(row: sqlx::sqlite::SqliteRow) -> FileResult<StoredFile> {
    let node_ids: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("node_ids")?)?;
    let context: Option<UsageContext> = row
        .try_get::<Option<String>, _>("context")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?;
    let path: String = row.try_get("path")?;

    Ok(StoredFile {
        id: row.try_get("id")?,
        descriptive_name: row.try_get("name")?,
        mime_type: row.try_get("mime")?,
        extension: row.try_get("extension")?,
        size: row.try_get::<i64, _>("size")? as u64,
        created_at: row.try_get("created_at")?,
        content_hash: row.try_get("hash")?,
        is_private: row.try_get("is_private")?,
        upload_pending: row.try_get("upload_pending")?,
        upload_failed: row.try_get("upload_failed")?,
        delete_pending: row.try_get("delete_pending")?,
        node_ids,
        context,
        path: PathBuf::from(path),
    })
}

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::metadata::{VideoMetadata, VideoThumbnail};

/// 元数据存储，管理 SQLite 中的 `video_metadata` 和 `video_thumbnails` 两张表。
///
/// 单条记录的写入是原子的；同一路径的并发写入以最后一次为准。
pub struct MetadataStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

const METADATA_COLUMNS: &str = "path, last_modified, duration_ms, thumbnail_path, width, height";
const THUMBNAIL_COLUMNS: &str =
    "id, video_path, thumbnail_path, timestamp_ms, display_order, is_default, created_at, display_interval_ms";

impl MetadataStore {
    /// 打开（或创建）数据库文件并初始化表结构
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        info!("📁 [元数据库] 数据库位置: {}", db_path.display());

        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// 内存数据库，用于测试和一次性导入校验
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        // 外键约束需要逐连接开启
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS video_metadata (
                path            TEXT PRIMARY KEY NOT NULL,
                last_modified   INTEGER NOT NULL,
                duration_ms     INTEGER,
                thumbnail_path  TEXT,
                width           INTEGER,
                height          INTEGER
            );

            CREATE TABLE IF NOT EXISTS video_thumbnails (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                video_path          TEXT NOT NULL,
                thumbnail_path      TEXT NOT NULL,
                timestamp_ms        INTEGER NOT NULL,
                display_order       INTEGER NOT NULL DEFAULT 0,
                is_default          INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                display_interval_ms INTEGER NOT NULL DEFAULT 1000,
                FOREIGN KEY(video_path) REFERENCES video_metadata(path)
                    ON UPDATE CASCADE ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_video_thumbnails_video_path
                ON video_thumbnails(video_path);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_video_default_thumbnail
                ON video_thumbnails(video_path, is_default) WHERE is_default = 1;",
        )?;

        debug!("✅ [元数据库] 表结构初始化完成");
        Ok(())
    }

    fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<VideoMetadata> {
        Ok(VideoMetadata {
            path: row.get(0)?,
            last_modified: row.get(1)?,
            duration_millis: row.get(2)?,
            thumbnail_path: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        })
    }

    fn thumbnail_from_row(row: &Row<'_>) -> rusqlite::Result<VideoThumbnail> {
        Ok(VideoThumbnail {
            id: row.get(0)?,
            video_path: row.get(1)?,
            thumbnail_path: row.get(2)?,
            timestamp_ms: row.get(3)?,
            display_order: row.get(4)?,
            is_default: row.get(5)?,
            created_at: row.get(6)?,
            display_interval_ms: row.get(7)?,
        })
    }

    // ---- video_metadata ----

    /// 按路径查询，不存在时返回 None
    pub fn get_by_path(&self, path: &str) -> Result<Option<VideoMetadata>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {METADATA_COLUMNS} FROM video_metadata WHERE path = ?1 LIMIT 1"),
                [path],
                Self::metadata_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// 以路径为键插入或覆盖全部字段。
    ///
    /// 使用 UPSERT 而不是 `INSERT OR REPLACE`，避免替换时级联删除幻灯片缩略图。
    pub fn insert_or_replace(&self, record: &VideoMetadata) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO video_metadata ({METADATA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                    last_modified = excluded.last_modified,
                    duration_ms = excluded.duration_ms,
                    thumbnail_path = excluded.thumbnail_path,
                    width = excluded.width,
                    height = excluded.height"
            ),
            params![
                record.path,
                record.last_modified,
                record.duration_millis,
                record.thumbnail_path,
                record.width,
                record.height,
            ],
        )?;
        Ok(())
    }

    /// 只更新缩略图路径和修改时间两个字段
    pub fn update_thumbnail_path(
        &self,
        path: &str,
        thumbnail_path: Option<&str>,
        last_modified: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE video_metadata SET thumbnail_path = ?1, last_modified = ?2 WHERE path = ?3",
            params![thumbnail_path, last_modified, path],
        )?;
        Ok(changed > 0)
    }

    pub fn get_thumbnail_path(&self, path: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let thumbnail = conn
            .query_row(
                "SELECT thumbnail_path FROM video_metadata WHERE path = ?1 LIMIT 1",
                [path],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(thumbnail.flatten())
    }

    pub fn delete_by_path(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM video_metadata WHERE path = ?1", [path])?;
        Ok(changed > 0)
    }

    /// 全表扫描，仅用于导出
    pub fn get_all(&self) -> Result<Vec<VideoMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {METADATA_COLUMNS} FROM video_metadata ORDER BY path"
        ))?;
        let rows = stmt.query_map([], Self::metadata_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM video_metadata", [], |row| row.get(0))?;
        Ok(count)
    }

    /// 文件被移动或重命名时迁移记录，幻灯片缩略图随外键级联更新
    pub fn rename_path(&self, old_path: &str, new_path: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM video_metadata WHERE path = ?1)",
            [old_path],
            |row| row.get(0),
        )?;
        // 旧路径没有记录时不能动目标路径上的记录
        if !exists || old_path == new_path {
            return Ok(exists);
        }
        tx.execute("DELETE FROM video_metadata WHERE path = ?1", [new_path])?;
        let changed = tx.execute(
            "UPDATE video_metadata SET path = ?1 WHERE path = ?2",
            params![new_path, old_path],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    // ---- video_thumbnails ----

    pub fn thumbnails_for_video(&self, video_path: &str) -> Result<Vec<VideoThumbnail>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {THUMBNAIL_COLUMNS} FROM video_thumbnails
             WHERE video_path = ?1 ORDER BY display_order, id"
        ))?;
        let rows = stmt.query_map([video_path], Self::thumbnail_from_row)?;

        let mut thumbnails = Vec::new();
        for row in rows {
            thumbnails.push(row?);
        }
        Ok(thumbnails)
    }

    pub fn default_thumbnail(&self, video_path: &str) -> Result<Option<VideoThumbnail>> {
        let conn = self.conn.lock();
        let thumbnail = conn
            .query_row(
                &format!(
                    "SELECT {THUMBNAIL_COLUMNS} FROM video_thumbnails
                     WHERE video_path = ?1 AND is_default = 1 LIMIT 1"
                ),
                [video_path],
                Self::thumbnail_from_row,
            )
            .optional()?;
        Ok(thumbnail)
    }

    pub fn first_thumbnail(&self, video_path: &str) -> Result<Option<VideoThumbnail>> {
        let conn = self.conn.lock();
        let thumbnail = conn
            .query_row(
                &format!(
                    "SELECT {THUMBNAIL_COLUMNS} FROM video_thumbnails
                     WHERE video_path = ?1 ORDER BY display_order, id LIMIT 1"
                ),
                [video_path],
                Self::thumbnail_from_row,
            )
            .optional()?;
        Ok(thumbnail)
    }

    /// 时间点不晚于 `timestamp_ms` 的最近一张缩略图
    pub fn nearest_thumbnail(&self, video_path: &str, timestamp_ms: i64) -> Result<Option<VideoThumbnail>> {
        let conn = self.conn.lock();
        let thumbnail = conn
            .query_row(
                &format!(
                    "SELECT {THUMBNAIL_COLUMNS} FROM video_thumbnails
                     WHERE video_path = ?1 AND timestamp_ms <= ?2
                     ORDER BY timestamp_ms DESC LIMIT 1"
                ),
                params![video_path, timestamp_ms],
                Self::thumbnail_from_row,
            )
            .optional()?;
        Ok(thumbnail)
    }

    pub fn thumbnail_count(&self, video_path: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM video_thumbnails WHERE video_path = ?1",
            [video_path],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 插入缩略图并返回新 ID；如果新行是默认缩略图，先在同一事务中清除旧的默认标记
    pub fn insert_thumbnail(&self, thumbnail: &VideoThumbnail) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if thumbnail.is_default {
            tx.execute(
                "UPDATE video_thumbnails SET is_default = 0 WHERE video_path = ?1",
                [&thumbnail.video_path],
            )?;
        }
        tx.execute(
            "INSERT INTO video_thumbnails
                (video_path, thumbnail_path, timestamp_ms, display_order, is_default, created_at, display_interval_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                thumbnail.video_path,
                thumbnail.thumbnail_path,
                thumbnail.timestamp_ms,
                thumbnail.display_order,
                thumbnail.is_default,
                thumbnail.created_at,
                thumbnail.display_interval_ms,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn update_thumbnail(&self, thumbnail: &VideoThumbnail) -> Result<()> {
        self.update_thumbnails(std::slice::from_ref(thumbnail))
    }

    pub fn update_thumbnails(&self, thumbnails: &[VideoThumbnail]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE video_thumbnails SET
                    video_path = ?1, thumbnail_path = ?2, timestamp_ms = ?3, display_order = ?4,
                    is_default = ?5, created_at = ?6, display_interval_ms = ?7
                 WHERE id = ?8",
            )?;
            for t in thumbnails {
                stmt.execute(params![
                    t.video_path,
                    t.thumbnail_path,
                    t.timestamp_ms,
                    t.display_order,
                    t.is_default,
                    t.created_at,
                    t.display_interval_ms,
                    t.id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// 先清除再设置，保证每个视频至多一个默认缩略图
    pub fn set_default_thumbnail(&self, video_path: &str, thumbnail_id: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE video_thumbnails SET is_default = 0 WHERE video_path = ?1",
            [video_path],
        )?;
        let changed = tx.execute(
            "UPDATE video_thumbnails SET is_default = 1 WHERE id = ?1 AND video_path = ?2",
            params![thumbnail_id, video_path],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn delete_thumbnail(&self, thumbnail_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM video_thumbnails WHERE id = ?1", [thumbnail_id])?;
        Ok(changed > 0)
    }

    pub fn delete_all_thumbnails(&self, video_path: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM video_thumbnails WHERE video_path = ?1", [video_path])?;
        Ok(changed)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

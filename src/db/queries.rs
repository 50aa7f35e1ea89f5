use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::errors::Result;
use crate::models::{
    DownloadItem, InstalledIndexEntry, InstallingRecord, InstallingStatus,
};

pub trait SettingsQueries {
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn delete_setting(&self, key: &str) -> Result<()>;
}

pub trait DownloadQueries {
    fn upsert_download(&self, item: &DownloadItem) -> Result<()>;
    fn get_downloads(&self) -> Result<Vec<DownloadItem>>;
    fn remove_download(&self, download_id: &str) -> Result<()>;
}

pub trait InstallingQueries {
    fn upsert_installing(&self, record: &InstallingRecord) -> Result<()>;
    fn get_installing(&self, appid: &str) -> Result<Option<InstallingRecord>>;
    fn set_installing_status(
        &self,
        appid: &str,
        status: InstallingStatus,
        error: Option<&str>,
    ) -> Result<()>;
    fn delete_installing(&self, appid: &str) -> Result<()>;
}

pub trait InstalledIndexQueries {
    fn upsert_index_entry(&self, entry: &InstalledIndexEntry) -> Result<()>;
    fn get_index_entry(&self, appid: &str) -> Result<Option<InstalledIndexEntry>>;
    fn list_index_entries(&self) -> Result<Vec<InstalledIndexEntry>>;
    fn remove_index_entry(&self, appid: &str) -> Result<()>;
}

impl SettingsQueries for Database {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl DownloadQueries for Database {
    fn upsert_download(&self, item: &DownloadItem) -> Result<()> {
        let item_json = serde_json::to_string(item)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO downloads (id, appid, status, item_json, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id,
                item.appid,
                item.status.as_str(),
                item_json,
                item.started_at,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_downloads(&self) -> Result<Vec<DownloadItem>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, item_json FROM downloads ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((id, raw))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            match serde_json::from_str::<DownloadItem>(&raw) {
                Ok(item) => items.push(item),
                Err(err) => tracing::warn!("skipping unreadable download row id={}: {}", id, err),
            }
        }
        Ok(items)
    }

    fn remove_download(&self, download_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![download_id])?;
        Ok(())
    }
}

impl InstallingQueries for Database {
    fn upsert_installing(&self, record: &InstallingRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO installing (appid, metadata_json, status, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.appid,
                metadata_json,
                record.status.as_str(),
                record.error,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_installing(&self, appid: &str) -> Result<Option<InstallingRecord>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT appid, metadata_json, status, error, updated_at FROM installing WHERE appid = ?1",
                params![appid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((appid, metadata_json, status, error, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(InstallingRecord {
            appid,
            metadata: serde_json::from_str(&metadata_json)?,
            status: InstallingStatus::parse(&status),
            error,
            updated_at,
        }))
    }

    fn set_installing_status(
        &self,
        appid: &str,
        status: InstallingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE installing SET status = ?1, error = ?2, updated_at = ?3 WHERE appid = ?4",
            params![status.as_str(), error, chrono::Utc::now().timestamp(), appid],
        )?;
        Ok(())
    }

    fn delete_installing(&self, appid: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM installing WHERE appid = ?1", params![appid])?;
        Ok(())
    }
}

impl InstalledIndexQueries for Database {
    fn upsert_index_entry(&self, entry: &InstalledIndexEntry) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO installed_index (appid, name, install_path, installed_at, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.appid,
                entry.name,
                entry.install_path,
                entry.installed_at,
                entry.size_bytes as i64,
            ],
        )?;
        Ok(())
    }

    fn get_index_entry(&self, appid: &str) -> Result<Option<InstalledIndexEntry>> {
        let conn = self.connection()?;
        let entry = conn
            .query_row(
                "SELECT appid, name, install_path, installed_at, size_bytes
                 FROM installed_index WHERE appid = ?1",
                params![appid],
                map_index_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_index_entries(&self) -> Result<Vec<InstalledIndexEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT appid, name, install_path, installed_at, size_bytes
             FROM installed_index ORDER BY installed_at DESC",
        )?;
        let rows = stmt.query_map([], map_index_row)?;

        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    fn remove_index_entry(&self, appid: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM installed_index WHERE appid = ?1",
            params![appid],
        )?;
        Ok(())
    }
}

fn map_index_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledIndexEntry> {
    Ok(InstalledIndexEntry {
        appid: row.get(0)?,
        name: row.get(1)?,
        install_path: row.get(2)?,
        installed_at: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)?.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadStatus;

    fn sample_item(id: &str, status: DownloadStatus) -> DownloadItem {
        DownloadItem {
            id: id.to_string(),
            appid: "730".to_string(),
            game_name: "Sample".to_string(),
            host: "pixeldrain".to_string(),
            url: "https://pixeldrain.com/u/abc".to_string(),
            original_url: None,
            filename: "sample.zip".to_string(),
            status,
            received_bytes: 10,
            total_bytes: 100,
            speed_bps: 0.0,
            eta_seconds: None,
            part_index: None,
            part_total: None,
            save_path: None,
            version_label: None,
            fallbacks: Vec::new(),
            started_at: 1,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn downloads_round_trip_through_json_column() {
        let db = Database::in_memory().unwrap();
        db.upsert_download(&sample_item("a", DownloadStatus::Downloading))
            .unwrap();
        db.upsert_download(&sample_item("a", DownloadStatus::Paused))
            .unwrap();

        let items = db.get_downloads().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, DownloadStatus::Paused);

        db.remove_download("a").unwrap();
        assert!(db.get_downloads().unwrap().is_empty());
    }

    #[test]
    fn installing_status_updates_in_place() {
        let db = Database::in_memory().unwrap();
        db.upsert_installing(&InstallingRecord {
            appid: "730".to_string(),
            metadata: serde_json::json!({ "name": "Sample" }),
            status: InstallingStatus::Downloading,
            error: None,
            updated_at: 0,
        })
        .unwrap();
        db.set_installing_status("730", InstallingStatus::Failed, Some("boom"))
            .unwrap();

        let record = db.get_installing("730").unwrap().unwrap();
        assert_eq!(record.status, InstallingStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.metadata["name"], "Sample");
    }
}

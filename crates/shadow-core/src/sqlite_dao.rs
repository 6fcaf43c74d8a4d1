//! `rusqlite`-backed [`ShadowDao`], following `at_core::cache::CacheDb`'s
//! shape: WAL mode, a `conn.call(..)` closure per statement, schema created
//! (and migrated) on open.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_rusqlite::Connection;

use crate::dao::{ShadowDao, ShadowUpdateResult};
use crate::error::CoreError;
use crate::json_merge;
use crate::model::{ShadowKey, SyncInformation};

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteShadowDao {
    conn: Connection,
}

impl SqliteShadowDao {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let dao = Self { conn };
        dao.init_schema().await?;
        Ok(dao)
    }

    pub async fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().await?;
        let dao = Self { conn };
        dao.init_schema().await?;
        Ok(dao)
    }

    async fn init_schema(&self) -> Result<(), CoreError> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS documents (
                        thing_name      TEXT NOT NULL,
                        shadow_name     TEXT NOT NULL,
                        payload         TEXT NOT NULL,
                        version         INTEGER NOT NULL,
                        deleted_version INTEGER,
                        updated_at      INTEGER NOT NULL,
                        PRIMARY KEY (thing_name, shadow_name)
                    );

                    CREATE TABLE IF NOT EXISTS sync_info (
                        thing_name           TEXT NOT NULL,
                        shadow_name          TEXT NOT NULL,
                        last_synced_document TEXT,
                        cloud_version        INTEGER NOT NULL,
                        local_version        INTEGER NOT NULL,
                        cloud_update_time    INTEGER NOT NULL,
                        last_sync_time       INTEGER NOT NULL,
                        cloud_deleted        INTEGER NOT NULL,
                        PRIMARY KEY (thing_name, shadow_name)
                    );
                    ",
                )?;

                let version: i64 =
                    conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
                if version < SCHEMA_VERSION {
                    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                }
                Ok(())
            })
            .await
            .map_err(CoreError::from)
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }
}

#[async_trait]
impl ShadowDao for SqliteShadowDao {
    async fn get_shadow_thing(&self, key: &ShadowKey) -> Result<Option<Value>, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();
        let row: Option<(String, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload, version FROM documents WHERE thing_name = ?1 AND shadow_name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![thing, shadow])?;
                if let Some(row) = rows.next()? {
                    let payload: String = row.get(0)?;
                    let version: i64 = row.get(1)?;
                    Ok(Some((payload, version)))
                } else {
                    Ok(None)
                }
            })
            .await?;

        match row {
            None => Ok(None),
            Some((payload, version)) => {
                let mut state: Value = serde_json::from_str(&payload)?;
                if let Value::Object(ref mut map) = state {
                    map.insert("version".into(), Value::from(version));
                }
                Ok(Some(state))
            }
        }
    }

    async fn update_shadow_thing(
        &self,
        key: &ShadowKey,
        overlay: &Value,
        version: u64,
    ) -> Result<Option<ShadowUpdateResult>, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();
        let overlay = overlay.clone();
        let now = Self::now();

        let result = self
            .conn
            .call(move |conn| {
                let existing: Option<(String, i64)> = {
                    let mut stmt = conn.prepare(
                        "SELECT payload, version FROM documents WHERE thing_name = ?1 AND shadow_name = ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![thing, shadow])?;
                    if let Some(row) = rows.next()? {
                        Some((row.get(0)?, row.get(1)?))
                    } else {
                        None
                    }
                };

                let (current_state, current_version): (Value, i64) = match existing {
                    Some((payload, v)) => (serde_json::from_str(&payload).unwrap_or(Value::Null), v),
                    None => (Value::Object(serde_json::Map::new()), 0),
                };

                if version as i64 != current_version + 1 {
                    return Ok(None);
                }

                let merged = json_merge::merge(&current_state, &overlay);
                let payload = serde_json::to_string(&merged).unwrap_or_default();

                conn.execute(
                    "INSERT INTO documents (thing_name, shadow_name, payload, version, deleted_version, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                     ON CONFLICT(thing_name, shadow_name) DO UPDATE SET
                        payload = excluded.payload, version = excluded.version, updated_at = excluded.updated_at",
                    rusqlite::params![thing, shadow, payload, version as i64, now],
                )?;

                Ok(Some((version, merged)))
            })
            .await?;

        Ok(result.map(|(version, current_document)| ShadowUpdateResult {
            version,
            current_document,
        }))
    }

    async fn delete_shadow_thing(&self, key: &ShadowKey) -> Result<Option<Value>, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();

        let removed = self
            .conn
            .call(move |conn| {
                let existing: Option<(String, i64)> = {
                    let mut stmt = conn.prepare(
                        "SELECT payload, version FROM documents WHERE thing_name = ?1 AND shadow_name = ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![thing, shadow])?;
                    if let Some(row) = rows.next()? {
                        Some((row.get(0)?, row.get(1)?))
                    } else {
                        None
                    }
                };

                let Some((payload, version)) = existing else {
                    return Ok(None);
                };

                conn.execute(
                    "DELETE FROM documents WHERE thing_name = ?1 AND shadow_name = ?2",
                    rusqlite::params![thing, shadow],
                )?;
                conn.execute(
                    "INSERT INTO documents (thing_name, shadow_name, payload, version, deleted_version, updated_at)
                     VALUES (?1, ?2, '{}', 0, ?3, ?4)
                     ON CONFLICT(thing_name, shadow_name) DO UPDATE SET
                        deleted_version = excluded.deleted_version, updated_at = excluded.updated_at",
                    rusqlite::params![thing, shadow, version + 1, Self::now()],
                )?;

                let state: Value = serde_json::from_str(&payload).unwrap_or(Value::Null);
                Ok(Some(state))
            })
            .await?;

        Ok(removed)
    }

    async fn get_deleted_shadow_version(&self, key: &ShadowKey) -> Result<Option<u64>, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();
        let version: Option<i64> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT deleted_version FROM documents WHERE thing_name = ?1 AND shadow_name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![thing, shadow])?;
                if let Some(row) = rows.next()? {
                    let v: Option<i64> = row.get(0)?;
                    Ok(v)
                } else {
                    Ok(None)
                }
            })
            .await?;
        Ok(version.map(|v| v as u64))
    }

    async fn get_shadow_sync_information(
        &self,
        key: &ShadowKey,
    ) -> Result<Option<SyncInformation>, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT last_synced_document, cloud_version, local_version, cloud_update_time,
                            last_sync_time, cloud_deleted
                     FROM sync_info WHERE thing_name = ?1 AND shadow_name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![thing, shadow])?;
                if let Some(row) = rows.next()? {
                    let last_synced: Option<String> = row.get(0)?;
                    let cloud_version: i64 = row.get(1)?;
                    let local_version: i64 = row.get(2)?;
                    let cloud_update_time: i64 = row.get(3)?;
                    let last_sync_time: i64 = row.get(4)?;
                    let cloud_deleted: i64 = row.get(5)?;
                    Ok(Some((
                        last_synced,
                        cloud_version,
                        local_version,
                        cloud_update_time,
                        last_sync_time,
                        cloud_deleted != 0,
                    )))
                } else {
                    Ok(None)
                }
            })
            .await?;

        Ok(row.map(
            |(last_synced, cloud_version, local_version, cloud_update_time, last_sync_time, cloud_deleted)| {
                SyncInformation {
                    thing_name: key.thing_name.clone(),
                    shadow_name: key.shadow_name.clone(),
                    last_synced_document: last_synced.map(|s| s.into_bytes()),
                    cloud_version: cloud_version as u64,
                    local_version: local_version as u64,
                    cloud_update_time,
                    last_sync_time,
                    cloud_deleted,
                }
            },
        ))
    }

    async fn update_sync_information(&self, info: &SyncInformation) -> Result<bool, CoreError> {
        let info = info.clone();
        self.conn
            .call(move |conn| {
                let last_synced = info
                    .last_synced_document
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).to_string());
                conn.execute(
                    "INSERT INTO sync_info (thing_name, shadow_name, last_synced_document, cloud_version,
                        local_version, cloud_update_time, last_sync_time, cloud_deleted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(thing_name, shadow_name) DO UPDATE SET
                        last_synced_document = excluded.last_synced_document,
                        cloud_version = excluded.cloud_version,
                        local_version = excluded.local_version,
                        cloud_update_time = excluded.cloud_update_time,
                        last_sync_time = excluded.last_sync_time,
                        cloud_deleted = excluded.cloud_deleted",
                    rusqlite::params![
                        info.thing_name,
                        info.shadow_name,
                        last_synced,
                        info.cloud_version as i64,
                        info.local_version as i64,
                        info.cloud_update_time,
                        info.last_sync_time,
                        info.cloud_deleted as i64,
                    ],
                )?;
                Ok(true)
            })
            .await
            .map_err(CoreError::from)
    }

    async fn insert_sync_info_if_not_exists(
        &self,
        info: &SyncInformation,
    ) -> Result<bool, CoreError> {
        let info = info.clone();
        self.conn
            .call(move |conn| {
                let last_synced = info
                    .last_synced_document
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).to_string());
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO sync_info (thing_name, shadow_name, last_synced_document,
                        cloud_version, local_version, cloud_update_time, last_sync_time, cloud_deleted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        info.thing_name,
                        info.shadow_name,
                        last_synced,
                        info.cloud_version as i64,
                        info.local_version as i64,
                        info.cloud_update_time,
                        info.last_sync_time,
                        info.cloud_deleted as i64,
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(CoreError::from)
    }

    async fn delete_sync_information(&self, key: &ShadowKey) -> Result<bool, CoreError> {
        let thing = key.thing_name.clone();
        let shadow = key.shadow_name.clone();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM sync_info WHERE thing_name = ?1 AND shadow_name = ?2",
                    rusqlite::params![thing, shadow],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(CoreError::from)
    }

    async fn list_synced_shadows(&self) -> Result<Vec<ShadowKey>, CoreError> {
        let rows: Vec<(String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT thing_name, shadow_name FROM sync_info")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(thing, shadow)| ShadowKey::new(thing, shadow))
            .collect())
    }

    async fn list_named_shadows_for_thing(
        &self,
        thing_name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let thing = thing_name.to_string();
        let mut shadows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT shadow_name FROM documents WHERE thing_name = ?1 AND shadow_name != '' ORDER BY shadow_name",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![thing], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        if offset >= 0 {
            if offset as usize >= shadows.len() {
                return Ok(Vec::new());
            }
            shadows = shadows.split_off(offset as usize);
        }
        if limit >= 0 && (limit as usize) < shadows.len() {
            shadows.truncate(limit as usize);
        }
        Ok(shadows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn on_disk_dao_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadow.db");
        let key = ShadowKey::classic("t1");

        {
            let dao = SqliteShadowDao::open(&path).await.unwrap();
            dao.update_shadow_thing(&key, &json!({"reported": {"a": 1}}), 1)
                .await
                .unwrap();
        }

        let dao = SqliteShadowDao::open(&path).await.unwrap();
        let doc = dao.get_shadow_thing(&key).await.unwrap().unwrap();
        assert_eq!(doc["reported"]["a"], json!(1));
    }

    #[tokio::test]
    async fn fresh_shadow_is_absent() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");
        assert!(dao.get_shadow_thing(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_update_requires_version_one() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");
        let overlay = json!({"desired": {"on": true}});

        let conflict = dao.update_shadow_thing(&key, &overlay, 5).await.unwrap();
        assert!(conflict.is_none());

        let ok = dao.update_shadow_thing(&key, &overlay, 1).await.unwrap();
        assert!(ok.is_some());
        assert_eq!(ok.unwrap().version, 1);
    }

    #[tokio::test]
    async fn updates_merge_and_increment_version() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");

        dao.update_shadow_thing(&key, &json!({"reported": {"a": 1}}), 1)
            .await
            .unwrap();
        let second = dao
            .update_shadow_thing(&key, &json!({"reported": {"b": 2}}), 2)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.current_document["reported"]["a"], json!(1));
        assert_eq!(second.current_document["reported"]["b"], json!(2));
    }

    #[tokio::test]
    async fn delete_then_get_deleted_version() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");
        dao.update_shadow_thing(&key, &json!({"reported": {"a": 1}}), 1)
            .await
            .unwrap();

        let removed = dao.delete_shadow_thing(&key).await.unwrap();
        assert!(removed.is_some());
        assert!(dao.get_shadow_thing(&key).await.unwrap().is_none());
        assert_eq!(dao.get_deleted_shadow_version(&key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn deleting_absent_shadow_is_none() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("ghost");
        assert!(dao.delete_shadow_thing(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_info_insert_if_not_exists_is_idempotent() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");
        let info = SyncInformation::new(&key, 1000);

        assert!(dao.insert_sync_info_if_not_exists(&info).await.unwrap());
        assert!(!dao.insert_sync_info_if_not_exists(&info).await.unwrap());

        let fetched = dao.get_shadow_sync_information(&key).await.unwrap().unwrap();
        assert_eq!(fetched.cloud_version, 0);
    }

    #[tokio::test]
    async fn list_synced_shadows_reflects_inserts() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let k1 = ShadowKey::classic("t1");
        let k2 = ShadowKey::new("t1", "config");
        dao.insert_sync_info_if_not_exists(&SyncInformation::new(&k1, 1))
            .await
            .unwrap();
        dao.insert_sync_info_if_not_exists(&SyncInformation::new(&k2, 1))
            .await
            .unwrap();

        let mut keys = dao.list_synced_shadows().await.unwrap();
        keys.sort();
        let mut expected = vec![k1, k2];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn list_named_shadows_excludes_classic_and_honors_paging() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        dao.update_shadow_thing(&ShadowKey::classic("t1"), &json!({}), 1)
            .await
            .unwrap();
        for name in ["a", "b", "c"] {
            dao.update_shadow_thing(&ShadowKey::new("t1", name), &json!({}), 1)
                .await
                .unwrap();
        }

        let all = dao.list_named_shadows_for_thing("t1", 0, 10).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);

        let page = dao.list_named_shadows_for_thing("t1", 1, 1).await.unwrap();
        assert_eq!(page, vec!["b"]);

        let negative = dao.list_named_shadows_for_thing("t1", -1, -1).await.unwrap();
        assert_eq!(negative, vec!["a", "b", "c"]);

        let past_end = dao.list_named_shadows_for_thing("t1", 10, 10).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn delete_sync_information_removes_row() {
        let dao = SqliteShadowDao::open_in_memory().await.unwrap();
        let key = ShadowKey::classic("t1");
        dao.insert_sync_info_if_not_exists(&SyncInformation::new(&key, 1))
            .await
            .unwrap();
        assert!(dao.delete_sync_information(&key).await.unwrap());
        assert!(dao.get_shadow_sync_information(&key).await.unwrap().is_none());
    }
}

//! SQLite-backed canonical store. Documents live in a JSON `doc` column with
//! the dedup keys broken out into indexed columns/tables; the merge-upsert
//! runs read-merge-write inside one IMMEDIATE transaction so concurrent
//! resolutions of the same real-world item serialize at the database.

use super::{CatalogStore, DedupKeys, LinkOutcome, UpsertOutcome};
use crate::fingerprint::{normalize, normalize_creator};
use crate::merge::merge_collectable;
use crate::model::{
    Collectable, FuzzyFingerprint, LinkTarget, ManualEntry, MediaType, ShelfItemMeta,
    UserCollection,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collectables (
    id TEXT PRIMARY KEY,
    media_type TEXT NOT NULL,
    title TEXT NOT NULL,
    title_norm TEXT NOT NULL,
    creator_norm TEXT,
    year INTEGER,
    fingerprint TEXT,
    lightweight_fingerprint TEXT,
    doc TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_collectables_fingerprint ON collectables(fingerprint);
CREATE INDEX IF NOT EXISTS idx_collectables_lightweight ON collectables(lightweight_fingerprint);
CREATE INDEX IF NOT EXISTS idx_collectables_title ON collectables(media_type, title_norm);

CREATE TABLE IF NOT EXISTS collectable_keys (
    collectable_id TEXT NOT NULL,
    key_type TEXT NOT NULL,
    key_value TEXT NOT NULL,
    UNIQUE(collectable_id, key_type, key_value)
);
CREATE INDEX IF NOT EXISTS idx_keys_value ON collectable_keys(key_type, key_value);

CREATE TABLE IF NOT EXISTS fuzzy_fingerprints (
    collectable_id TEXT NOT NULL,
    value TEXT NOT NULL,
    doc TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(collectable_id, value)
);
CREATE INDEX IF NOT EXISTS idx_fuzzy_value ON fuzzy_fingerprints(value);

CREATE TABLE IF NOT EXISTS manual_entries (
    id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_collections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    shelf_id TEXT NOT NULL,
    collectable_id TEXT,
    manual_entry_id TEXT,
    meta TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, shelf_id, collectable_id),
    UNIQUE(user_id, shelf_id, manual_entry_id)
);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url: {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        info!("connected to catalog store");
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    fn doc_to_collectable(doc: &str) -> Result<Collectable> {
        serde_json::from_str(doc).context("malformed collectable doc")
    }

    async fn load_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Collectable>> {
        let row = sqlx::query("SELECT doc FROM collectables WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|r| Self::doc_to_collectable(r.get::<String, _>("doc").as_str()))
            .transpose()
    }

    /// Dedup-priority lookup on one connection so the upsert can reuse it
    /// inside its transaction.
    async fn find_match_on(
        conn: &mut SqliteConnection,
        keys: &DedupKeys,
    ) -> Result<Option<Collectable>> {
        for key in &keys.provider_ids {
            let row = sqlx::query(
                "SELECT collectable_id FROM collectable_keys \
                 WHERE key_type = 'provider' AND key_value = ?1 LIMIT 1",
            )
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(r) = row {
                let id: String = r.get("collectable_id");
                return Self::load_by_id(conn, &id).await;
            }
        }
        for barcode in &keys.barcodes {
            let row = sqlx::query(
                "SELECT collectable_id FROM collectable_keys \
                 WHERE key_type = 'barcode' AND key_value = ?1 LIMIT 1",
            )
            .bind(barcode)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(r) = row {
                let id: String = r.get("collectable_id");
                return Self::load_by_id(conn, &id).await;
            }
        }
        if let Some(fp) = &keys.fingerprint {
            let row = sqlx::query("SELECT doc FROM collectables WHERE fingerprint = ?1 LIMIT 1")
                .bind(fp)
                .fetch_optional(&mut *conn)
                .await?;
            if let Some(r) = row {
                return Ok(Some(Self::doc_to_collectable(
                    r.get::<String, _>("doc").as_str(),
                )?));
            }
        }
        if let Some(lw) = &keys.lightweight_fingerprint {
            let row = sqlx::query(
                "SELECT doc FROM collectables WHERE lightweight_fingerprint = ?1 LIMIT 1",
            )
            .bind(lw)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(r) = row {
                return Ok(Some(Self::doc_to_collectable(
                    r.get::<String, _>("doc").as_str(),
                )?));
            }
        }
        Ok(None)
    }

    /// Write the full row plus its derived key/fuzzy index rows.
    async fn write_collectable(
        conn: &mut SqliteConnection,
        c: &Collectable,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let doc = serde_json::to_string(c)?;
        let id = c.id.to_string();
        let creator_norm = c.primary_creator.as_deref().map(normalize_creator);
        sqlx::query(
            "INSERT INTO collectables \
               (id, media_type, title, title_norm, creator_norm, year, fingerprint, \
                lightweight_fingerprint, doc, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11) \
             ON CONFLICT(id) DO UPDATE SET \
               title = excluded.title, \
               title_norm = excluded.title_norm, \
               creator_norm = excluded.creator_norm, \
               year = excluded.year, \
               lightweight_fingerprint = excluded.lightweight_fingerprint, \
               doc = excluded.doc, \
               updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(c.media_type.as_str())
        .bind(&c.title)
        .bind(normalize(&c.title))
        .bind(creator_norm)
        .bind(c.year)
        .bind(&c.fingerprint)
        .bind(&c.lightweight_fingerprint)
        .bind(&doc)
        .bind(created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM collectable_keys WHERE collectable_id = ?1")
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        let keys = DedupKeys::from_collectable(c);
        for key in &keys.provider_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO collectable_keys (collectable_id, key_type, key_value) \
                 VALUES (?1, 'provider', ?2)",
            )
            .bind(&id)
            .bind(key)
            .execute(&mut *conn)
            .await?;
        }
        for barcode in &keys.barcodes {
            sqlx::query(
                "INSERT OR IGNORE INTO collectable_keys (collectable_id, key_type, key_value) \
                 VALUES (?1, 'barcode', ?2)",
            )
            .bind(&id)
            .bind(barcode)
            .execute(&mut *conn)
            .await?;
        }
        for fp in &c.fuzzy_fingerprints {
            sqlx::query(
                "INSERT OR IGNORE INTO fuzzy_fingerprints (collectable_id, value, doc, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&id)
            .bind(&fp.value)
            .bind(serde_json::to_string(fp)?)
            .bind(fp.created_at.to_rfc3339())
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn upsert_in_tx(
        conn: &mut SqliteConnection,
        candidate: Collectable,
        keys: &DedupKeys,
    ) -> Result<UpsertOutcome> {
        match Self::find_match_on(conn, keys).await? {
            Some(mut existing) => {
                merge_collectable(&mut existing, &candidate);
                // created_at is preserved by the ON CONFLICT update path
                Self::write_collectable(conn, &existing, Utc::now()).await?;
                Ok(UpsertOutcome {
                    collectable: existing,
                    created: false,
                })
            }
            None => {
                Self::write_collectable(conn, &candidate, Utc::now()).await?;
                Ok(UpsertOutcome {
                    collectable: candidate,
                    created: true,
                })
            }
        }
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction: the write lock is taken
    /// up front, so read-merge-write is atomic against other writers.
    async fn immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut SqliteConnection,
        )
            -> futures::future::BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        match f(&mut conn).await {
            Ok(v) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(v)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }
}

fn link_columns(target: &LinkTarget) -> (Option<String>, Option<String>) {
    match target {
        LinkTarget::Collectable(id) => (Some(id.to_string()), None),
        LinkTarget::Manual(id) => (None, Some(id.to_string())),
    }
}

fn row_to_link(row: &sqlx::sqlite::SqliteRow) -> Result<UserCollection> {
    let collectable_id: Option<String> = row.get("collectable_id");
    let manual_entry_id: Option<String> = row.get("manual_entry_id");
    let target = match (collectable_id, manual_entry_id) {
        (Some(id), _) => LinkTarget::Collectable(Uuid::parse_str(&id)?),
        (None, Some(id)) => LinkTarget::Manual(Uuid::parse_str(&id)?),
        (None, None) => anyhow::bail!("user_collections row has no target"),
    };
    let meta: ShelfItemMeta = serde_json::from_str(row.get::<String, _>("meta").as_str())?;
    let created_at = DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())?
        .with_timezone(&Utc);
    let updated_at = DateTime::parse_from_rfc3339(row.get::<String, _>("updated_at").as_str())?
        .with_timezone(&Utc);
    Ok(UserCollection {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())?,
        user_id: row.get("user_id"),
        shelf_id: row.get("shelf_id"),
        target,
        meta,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn find_match(&self, keys: &DedupKeys) -> Result<Option<Collectable>> {
        if keys.is_empty() {
            return Ok(None);
        }
        let mut conn = self.pool.acquire().await?;
        Self::find_match_on(&mut conn, keys).await
    }

    async fn upsert_collectable(&self, candidate: Collectable) -> Result<UpsertOutcome> {
        let keys = DedupKeys::from_collectable(&candidate);
        self.immediate_tx(move |conn| {
            Box::pin(async move { Self::upsert_in_tx(conn, candidate, &keys).await })
        })
        .await
    }

    async fn get_collectable(&self, id: Uuid) -> Result<Option<Collectable>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_by_id(&mut conn, &id.to_string()).await
    }

    async fn find_by_fuzzy_fingerprint(&self, value: &str) -> Result<Vec<Collectable>> {
        let rows = sqlx::query(
            "SELECT c.doc AS doc FROM fuzzy_fingerprints f \
             JOIN collectables c ON c.id = f.collectable_id \
             WHERE f.value = ?1",
        )
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Self::doc_to_collectable(r.get::<String, _>("doc").as_str()))
            .collect()
    }

    async fn find_by_lightweight_fingerprint(&self, value: &str) -> Result<Option<Collectable>> {
        let row =
            sqlx::query("SELECT doc FROM collectables WHERE lightweight_fingerprint = ?1 LIMIT 1")
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| Self::doc_to_collectable(r.get::<String, _>("doc").as_str()))
            .transpose()
    }

    async fn find_by_title(
        &self,
        media_type: MediaType,
        title: &str,
        creator: Option<&str>,
    ) -> Result<Option<Collectable>> {
        let title_norm = normalize(title);
        let row = match creator {
            Some(c) => {
                sqlx::query(
                    "SELECT doc FROM collectables \
                     WHERE media_type = ?1 AND title_norm = ?2 AND creator_norm = ?3 LIMIT 1",
                )
                .bind(media_type.as_str())
                .bind(&title_norm)
                .bind(normalize_creator(c))
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT doc FROM collectables \
                     WHERE media_type = ?1 AND title_norm = ?2 LIMIT 1",
                )
                .bind(media_type.as_str())
                .bind(&title_norm)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|r| Self::doc_to_collectable(r.get::<String, _>("doc").as_str()))
            .transpose()
    }

    async fn set_lightweight_fingerprint_if_missing(&self, id: Uuid, value: &str) -> Result<()> {
        let value = value.to_string();
        self.immediate_tx(move |conn| {
            Box::pin(async move {
                let Some(mut c) = Self::load_by_id(conn, &id.to_string()).await? else {
                    return Ok(());
                };
                if c.lightweight_fingerprint.is_some() {
                    return Ok(());
                }
                c.lightweight_fingerprint = Some(value);
                Self::write_collectable(conn, &c, Utc::now()).await
            })
        })
        .await
    }

    async fn append_fuzzy_fingerprint(&self, id: Uuid, entry: FuzzyFingerprint) -> Result<bool> {
        self.immediate_tx(move |conn| {
            Box::pin(async move {
                let Some(mut c) = Self::load_by_id(conn, &id.to_string()).await? else {
                    return Ok(false);
                };
                if c.has_fuzzy_fingerprint(&entry.value) {
                    return Ok(false);
                }
                c.fuzzy_fingerprints.push(entry);
                Self::write_collectable(conn, &c, Utc::now()).await?;
                Ok(true)
            })
        })
        .await
    }

    async fn insert_manual_entry(&self, entry: ManualEntry) -> Result<Uuid> {
        sqlx::query("INSERT INTO manual_entries (id, doc, created_at) VALUES (?1, ?2, ?3)")
            .bind(entry.id.to_string())
            .bind(serde_json::to_string(&entry)?)
            .bind(entry.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(entry.id)
    }

    async fn link_user_collection(
        &self,
        user_id: &str,
        shelf_id: &str,
        target: LinkTarget,
        meta: ShelfItemMeta,
    ) -> Result<LinkOutcome> {
        let user_id = user_id.to_string();
        let shelf_id = shelf_id.to_string();
        self.immediate_tx(move |conn| {
            Box::pin(async move {
                let (collectable_id, manual_entry_id) = link_columns(&target);
                let existing = sqlx::query(
                    "SELECT * FROM user_collections \
                     WHERE user_id = ?1 AND shelf_id = ?2 \
                       AND collectable_id IS ?3 AND manual_entry_id IS ?4",
                )
                .bind(&user_id)
                .bind(&shelf_id)
                .bind(&collectable_id)
                .bind(&manual_entry_id)
                .fetch_optional(&mut *conn)
                .await?;
                if let Some(row) = existing {
                    let mut link = row_to_link(&row)?;
                    link.meta.absorb(&meta);
                    sqlx::query(
                        "UPDATE user_collections SET meta = ?1, updated_at = ?2 WHERE id = ?3",
                    )
                    .bind(serde_json::to_string(&link.meta)?)
                    .bind(Utc::now().to_rfc3339())
                    .bind(link.id.to_string())
                    .execute(&mut *conn)
                    .await?;
                    return Ok(LinkOutcome::AlreadyLinked(link.id));
                }
                let id = Uuid::new_v4();
                let now = Utc::now().to_rfc3339();
                sqlx::query(
                    "INSERT INTO user_collections \
                       (id, user_id, shelf_id, collectable_id, manual_entry_id, meta, \
                        created_at, updated_at) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                )
                .bind(id.to_string())
                .bind(&user_id)
                .bind(&shelf_id)
                .bind(&collectable_id)
                .bind(&manual_entry_id)
                .bind(serde_json::to_string(&meta)?)
                .bind(&now)
                .bind(&now)
                .execute(&mut *conn)
                .await?;
                Ok(LinkOutcome::Created(id))
            })
        })
        .await
    }

    async fn list_shelf(&self, user_id: &str, shelf_id: &str) -> Result<Vec<UserCollection>> {
        let rows = sqlx::query(
            "SELECT * FROM user_collections WHERE user_id = ?1 AND shelf_id = ?2 \
             ORDER BY created_at",
        )
        .bind(user_id)
        .bind(shelf_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_link).collect()
    }

    async fn unlink_user_collection(
        &self,
        user_id: &str,
        shelf_id: &str,
        target: LinkTarget,
    ) -> Result<bool> {
        let (collectable_id, manual_entry_id) = link_columns(&target);
        let done = sqlx::query(
            "DELETE FROM user_collections \
             WHERE user_id = ?1 AND shelf_id = ?2 \
               AND collectable_id IS ?3 AND manual_entry_id IS ?4",
        )
        .bind(user_id)
        .bind(shelf_id)
        .bind(&collectable_id)
        .bind(&manual_entry_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/catalog.db", dir.path().display());
        let store = SqliteStore::connect(&url, 4).await.unwrap();
        (dir, store)
    }

    fn book_with_isbn(title: &str, isbn: &str, fp: &str) -> Collectable {
        let mut c = Collectable::new(MediaType::Book, title);
        c.add_identifier("openlibrary", "isbn13", isbn);
        c.fingerprint = Some(fp.to_string());
        c
    }

    #[tokio::test]
    async fn upsert_twice_yields_one_row_with_union_identifiers() {
        let (_dir, store) = temp_store().await;
        let mut first = book_with_isbn("Dune", "111", "fp1");
        first.add_identifier("openlibrary", "isbn13", "222");
        store.upsert_collectable(first).await.unwrap();

        let second = book_with_isbn("Dune", "111", "fp1");
        let out = store.upsert_collectable(second).await.unwrap();
        assert!(!out.created);
        assert_eq!(
            out.collectable.identifier_values("isbn13"),
            vec!["111", "222"]
        );

        let keys = DedupKeys {
            barcodes: vec!["222".into()],
            ..Default::default()
        };
        let found = store.find_match(&keys).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn fuzzy_append_guards_duplicates_and_is_queryable() {
        let (_dir, store) = temp_store().await;
        let c = book_with_isbn("Dune", "111", "fp1");
        let id = store.upsert_collectable(c).await.unwrap().collectable.id;

        let entry = FuzzyFingerprint {
            value: "fuzzy-abc".into(),
            source: "ai_second_pass".into(),
            raw_title: "Dvne".into(),
            raw_creator: Some("Frank Herbert".into()),
            media_type: MediaType::Book,
            confidence: 0.9,
            created_at: Utc::now(),
        };
        assert!(store.append_fuzzy_fingerprint(id, entry.clone()).await.unwrap());
        assert!(!store.append_fuzzy_fingerprint(id, entry).await.unwrap());

        let hits = store.find_by_fuzzy_fingerprint("fuzzy-abc").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[tokio::test]
    async fn lightweight_backfill_is_write_once() {
        let (_dir, store) = temp_store().await;
        let c = book_with_isbn("Dune", "111", "fp1");
        let id = store.upsert_collectable(c).await.unwrap().collectable.id;

        store
            .set_lightweight_fingerprint_if_missing(id, "lw-1")
            .await
            .unwrap();
        store
            .set_lightweight_fingerprint_if_missing(id, "lw-2")
            .await
            .unwrap();
        let found = store
            .find_by_lightweight_fingerprint("lw-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert!(store
            .find_by_lightweight_fingerprint("lw-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn title_lookup_filters_by_creator() {
        let (_dir, store) = temp_store().await;
        let mut c = book_with_isbn("Dune", "111", "fp1");
        c.primary_creator = Some("Frank Herbert".into());
        store.upsert_collectable(c).await.unwrap();

        let hit = store
            .find_by_title(MediaType::Book, "  DUNE ", Some("frank herbert"))
            .await
            .unwrap();
        assert!(hit.is_some());
        let miss = store
            .find_by_title(MediaType::Book, "Dune", Some("Someone Else"))
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}

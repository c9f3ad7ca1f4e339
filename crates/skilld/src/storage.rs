//! SQLite storage for the shared device registry.
//!
//! Every write is an upsert or runs inside a transaction, so a registration
//! interrupted by shutdown can simply be repeated on the next start.

use chrono::{DateTime, Utc};
use skill_core::registry::normalize_patterns;
use skill_core::{Device, DeviceType, DeviceUpdate, Id, NewDevice, Room, SkillRecord};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, Transaction};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const DEVICE_COLUMNS: &str = "d.id, d.skill_id, d.device_type_id, t.name AS device_type, d.name, \
    d.device_attributes, d.room_id, d.created_at, d.updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("skill not found: {0}")]
    SkillNotFound(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("pattern '{pattern}' already belongs to device '{owner}'")]
    PatternConflict { pattern: String, owner: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Outcome of [`Storage::register_device`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub device: Device,
    /// False when the device already existed and was merged into.
    pub created: bool,
    pub patterns_added: u64,
}

/// Registry storage backend.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the registry database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_device_registry.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Rooms ---

    pub async fn ensure_room(&self, name: &str) -> Result<Room> {
        sqlx::query(
            r#"
            INSERT INTO rooms (id, name, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Id::new().as_ref())
        .bind(name)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let (id, name): (String, String) =
            sqlx::query_as("SELECT id, name FROM rooms WHERE name = ?1")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(Room {
            id: Id::from_string(id),
            name,
        })
    }

    pub async fn find_room(&self, name: &str) -> Result<Option<Room>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT id, name FROM rooms WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name)| Room {
            id: Id::from_string(id),
            name,
        }))
    }

    // --- Skills ---

    /// Insert the skill or refresh its help text. Keeps the existing id.
    pub async fn upsert_skill(&self, name: &str, help_text: Option<&str>) -> Result<SkillRecord> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO skills (id, name, help_text, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(name) DO UPDATE SET
                help_text = COALESCE(excluded.help_text, skills.help_text),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Id::new().as_ref())
        .bind(name)
        .bind(help_text)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_skill(name)
            .await?
            .ok_or_else(|| StorageError::SkillNotFound(name.to_string()))
    }

    pub async fn find_skill(&self, name: &str) -> Result<Option<SkillRecord>> {
        let row = sqlx::query_as::<_, SkillRow>(
            "SELECT id, name, help_text FROM skills WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SkillRow::into_skill))
    }

    /// Remove a skill; its devices and type links cascade.
    pub async fn delete_skill(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM skills WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SkillNotFound(name.to_string()));
        }
        Ok(())
    }

    // --- Device types ---

    /// Upsert a device type by name and link it to the declaring skill.
    pub async fn upsert_device_type(&self, skill_id: &Id, name: &str) -> Result<DeviceType> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO device_types (id, name, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Id::new().as_ref())
        .bind(name)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let (id, name): (String, String) =
            sqlx::query_as("SELECT id, name FROM device_types WHERE name = ?1")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO skill_device_types (skill_id, device_type_id) VALUES (?1, ?2)",
        )
        .bind(skill_id.as_ref())
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(DeviceType {
            id: Id::from_string(id),
            name,
        })
    }

    pub async fn list_device_types(&self, skill_id: &Id) -> Result<Vec<DeviceType>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT t.id, t.name FROM device_types t
            JOIN skill_device_types l ON l.device_type_id = t.id
            WHERE l.skill_id = ?1
            ORDER BY t.name ASC
            "#,
        )
        .bind(skill_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name)| DeviceType {
                id: Id::from_string(id),
                name,
            })
            .collect())
    }

    // --- Devices ---

    /// Register a device, merging into an existing `(skill, type, name)` row.
    ///
    /// Fails without writing anything if a pattern is already held by a
    /// different device.
    pub async fn register_device(
        &self,
        skill_id: &Id,
        device_type: &DeviceType,
        new: &NewDevice,
        room_id: Option<&Id>,
    ) -> Result<Registration> {
        let patterns = new.normalized_patterns();
        let attributes = new
            .device_attributes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM devices WHERE skill_id = ?1 AND device_type_id = ?2 AND name = ?3",
        )
        .bind(skill_id.as_ref())
        .bind(device_type.id.as_ref())
        .bind(&new.name)
        .fetch_optional(&mut *tx)
        .await?;

        let device_id = existing.as_ref().map(|(id,)| id.clone());
        for pattern in &patterns {
            check_pattern_free(&mut tx, pattern, device_id.as_deref()).await?;
        }

        let (device_id, created) = match device_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE devices SET
                        room_id = COALESCE(?1, room_id),
                        device_attributes = COALESCE(?2, device_attributes),
                        updated_at = ?3
                    WHERE id = ?4
                    "#,
                )
                .bind(room_id.map(AsRef::<str>::as_ref))
                .bind(&attributes)
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            None => {
                let id = Id::new().0;
                sqlx::query(
                    r#"
                    INSERT INTO devices (id, skill_id, device_type_id, room_id, name,
                                         device_attributes, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                    "#,
                )
                .bind(&id)
                .bind(skill_id.as_ref())
                .bind(device_type.id.as_ref())
                .bind(room_id.map(AsRef::<str>::as_ref))
                .bind(&new.name)
                .bind(&attributes)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (id, true)
            }
        };

        let patterns_added = insert_patterns(&mut tx, &device_id, &patterns).await?;
        tx.commit().await?;

        let device = self.get_device(&Id::from_string(device_id)).await?;
        Ok(Registration {
            device,
            created,
            patterns_added,
        })
    }

    pub async fn get_device(&self, id: &Id) -> Result<Device> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices d \
             JOIN device_types t ON t.id = d.device_type_id WHERE d.id = ?1"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::DeviceNotFound(id.to_string()))?;

        let patterns: Vec<(String,)> = sqlx::query_as(
            "SELECT pattern FROM device_patterns WHERE device_id = ?1 ORDER BY position ASC",
        )
        .bind(id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(row.into_device(patterns.into_iter().map(|(p,)| p).collect()))
    }

    /// All devices owned by a skill, ordered by name.
    pub async fn list_devices(&self, skill_id: &Id) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices d JOIN device_types t ON t.id = d.device_type_id \
             WHERE d.skill_id = ?1 ORDER BY d.name ASC"
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(skill_id.as_ref())
            .fetch_all(&self.pool)
            .await?;

        let pattern_rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT p.device_id, p.pattern FROM device_patterns p
            JOIN devices d ON d.id = p.device_id
            WHERE d.skill_id = ?1
            ORDER BY p.position ASC
            "#,
        )
        .bind(skill_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        let mut patterns: HashMap<String, Vec<String>> = HashMap::new();
        for (device_id, pattern) in pattern_rows {
            patterns.entry(device_id).or_default().push(pattern);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let device_patterns = patterns.remove(&row.id).unwrap_or_default();
                row.into_device(device_patterns)
            })
            .collect())
    }

    /// Apply `update` to a device owned by `skill_id`.
    pub async fn update_device(
        &self,
        skill_id: &Id,
        id: &Id,
        update: &DeviceUpdate,
    ) -> Result<Device> {
        let attributes = update
            .device_attributes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE devices SET
                name = COALESCE(?1, name),
                device_attributes = COALESCE(?2, device_attributes),
                updated_at = ?3
            WHERE id = ?4 AND skill_id = ?5
            "#,
        )
        .bind(&update.name)
        .bind(&attributes)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .bind(skill_id.as_ref())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::DeviceNotFound(id.to_string()));
        }

        if let Some(room_id) = &update.room_id {
            sqlx::query("UPDATE devices SET room_id = ?1 WHERE id = ?2")
                .bind(room_id.as_ref().map(AsRef::<str>::as_ref))
                .bind(id.as_ref())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(patterns) = &update.patterns {
            let normalized = normalize_patterns(patterns);
            for pattern in &normalized {
                check_pattern_free(&mut tx, pattern, Some(id.as_ref())).await?;
            }
            sqlx::query("DELETE FROM device_patterns WHERE device_id = ?1")
                .bind(id.as_ref())
                .execute(&mut *tx)
                .await?;
            insert_patterns(&mut tx, id.as_ref(), &normalized).await?;
        }

        tx.commit().await?;
        self.get_device(id).await
    }

    /// Delete a device owned by `skill_id`; its patterns cascade.
    pub async fn delete_device(&self, skill_id: &Id, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?1 AND skill_id = ?2")
            .bind(id.as_ref())
            .bind(skill_id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::DeviceNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn count_devices(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }
}

/// Error if `pattern` is held by any device other than `owner`.
async fn check_pattern_free(
    tx: &mut Transaction<'_, Sqlite>,
    pattern: &str,
    owner: Option<&str>,
) -> Result<()> {
    let holder: Option<(String, String)> = sqlx::query_as(
        r#"
        SELECT d.id, d.name FROM device_patterns p
        JOIN devices d ON d.id = p.device_id
        WHERE p.pattern = ?1
        LIMIT 1
        "#,
    )
    .bind(pattern)
    .fetch_optional(&mut **tx)
    .await?;

    match holder {
        Some((holder_id, holder_name)) if Some(holder_id.as_str()) != owner => {
            Err(StorageError::PatternConflict {
                pattern: pattern.to_string(),
                owner: holder_name,
            })
        }
        _ => Ok(()),
    }
}

async fn insert_patterns(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: &str,
    patterns: &[String],
) -> Result<u64> {
    let (next,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM device_patterns WHERE device_id = ?1",
    )
    .bind(device_id)
    .fetch_one(&mut **tx)
    .await?;

    let mut added = 0;
    for pattern in patterns {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO device_patterns (device_id, pattern, position)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(device_id)
        .bind(pattern)
        .bind(next + added as i64)
        .execute(&mut **tx)
        .await?;
        added += result.rows_affected();
    }
    Ok(added)
}

// --- Row types ---

#[derive(sqlx::FromRow)]
struct SkillRow {
    id: String,
    name: String,
    help_text: Option<String>,
}

impl SkillRow {
    fn into_skill(self) -> SkillRecord {
        SkillRecord {
            id: Id::from_string(self.id),
            name: self.name,
            help_text: self.help_text,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    skill_id: String,
    device_type_id: String,
    device_type: String,
    name: String,
    device_attributes: Option<String>,
    room_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl DeviceRow {
    fn into_device(self, patterns: Vec<String>) -> Device {
        Device {
            id: Id::from_string(self.id),
            skill_id: Id::from_string(self.skill_id),
            device_type_id: Id::from_string(self.device_type_id),
            device_type: self.device_type,
            name: self.name,
            patterns,
            device_attributes: self
                .device_attributes
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            room_id: self.room_id.map(Id::from_string),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::create_test_storage;
    use super::*;

    async fn skill_with_type(
        storage: &Storage,
        skill: &str,
        device_type: &str,
    ) -> (SkillRecord, DeviceType) {
        let skill = storage.upsert_skill(skill, Some("help")).await.unwrap();
        let device_type = storage.upsert_device_type(&skill.id, device_type).await.unwrap();
        (skill, device_type)
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        assert_eq!(ts.storage.count_devices().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_skill_keeps_id_and_help_text() {
        let ts = create_test_storage().await;
        let first = ts.storage.upsert_skill("switch", Some("turns things on")).await.unwrap();
        let second = ts.storage.upsert_skill("switch", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.help_text.as_deref(), Some("turns things on"));

        let third = ts.storage.upsert_skill("switch", Some("new help")).await.unwrap();
        assert_eq!(third.help_text.as_deref(), Some("new help"));
    }

    #[tokio::test]
    async fn device_types_deduplicate_per_skill() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let again = ts.storage.upsert_device_type(&skill.id, "light").await.unwrap();
        assert_eq!(light.id, again.id);
        ts.storage.upsert_device_type(&skill.id, "plug").await.unwrap();

        let types = ts.storage.list_device_types(&skill.id).await.unwrap();
        let names: Vec<_> = types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["light", "plug"]);
    }

    #[tokio::test]
    async fn registering_twice_creates_one_row() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let new = NewDevice::new("light", "ceiling light").pattern("big light");

        let first = ts.storage.register_device(&skill.id, &light, &new, None).await.unwrap();
        let second = ts.storage.register_device(&skill.id, &light, &new, None).await.unwrap();

        assert!(first.created);
        assert_eq!(first.patterns_added, 1);
        assert!(!second.created);
        assert_eq!(second.patterns_added, 0);
        assert_eq!(first.device.id, second.device.id);
        assert_eq!(ts.storage.count_devices().await.unwrap(), 1);
        assert_eq!(second.device.patterns, vec!["big light"]);
    }

    #[tokio::test]
    async fn re_registration_merges_new_patterns() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        ts.storage
            .register_device(&skill.id, &light, &NewDevice::new("light", "lamp"), None)
            .await
            .unwrap();
        let desk_lamp = NewDevice::new("light", "lamp").pattern("desk lamp");
        let merged = ts
            .storage
            .register_device(&skill.id, &light, &desk_lamp, None)
            .await
            .unwrap();
        assert_eq!(merged.patterns_added, 1);
        assert_eq!(merged.device.patterns, vec!["desk lamp"]);
    }

    #[tokio::test]
    async fn same_name_devices_with_disjoint_patterns_coexist() {
        let ts = create_test_storage().await;
        let (switch, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let (media, speaker) = skill_with_type(&ts.storage, "media", "speaker").await;

        let kitchen_light = NewDevice::new("light", "kitchen").pattern("kitchen light");
        let kitchen_speaker = NewDevice::new("speaker", "kitchen").pattern("kitchen speaker");
        let lamp = ts
            .storage
            .register_device(&switch.id, &light, &kitchen_light, None)
            .await
            .unwrap();
        let radio = ts
            .storage
            .register_device(&media.id, &speaker, &kitchen_speaker, None)
            .await
            .unwrap();

        assert_ne!(lamp.device.id, radio.device.id);
        assert_eq!(lamp.device.patterns, vec!["kitchen light"]);
        assert_eq!(radio.device.patterns, vec!["kitchen speaker"]);
        assert_eq!(ts.storage.count_devices().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rename_leaves_no_stale_pattern() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let device = ts
            .storage
            .register_device(&skill.id, &light, &NewDevice::new("light", "lamp"), None)
            .await
            .unwrap()
            .device;

        let update = DeviceUpdate {
            name: Some("desk lamp".to_string()),
            ..DeviceUpdate::default()
        };
        let renamed = ts.storage.update_device(&skill.id, &device.id, &update).await.unwrap();
        assert!(renamed.patterns.is_empty());
        assert!(!renamed.is_named_by("lamp"));
        assert!(renamed.is_named_by("desk lamp"));

        // The old name is free for another device.
        ts.storage
            .register_device(&skill.id, &light, &NewDevice::new("light", "lamp"), None)
            .await
            .unwrap();
        assert_eq!(ts.storage.count_devices().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn colliding_pattern_is_rejected_without_writes() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let lamp = NewDevice::new("light", "lamp").pattern("reading light");
        let other = NewDevice::new("light", "other lamp").pattern("reading light");
        ts.storage
            .register_device(&skill.id, &light, &lamp, None)
            .await
            .unwrap();

        let err = ts
            .storage
            .register_device(&skill.id, &light, &other, None)
            .await
            .unwrap_err();
        match err {
            StorageError::PatternConflict { pattern, owner } => {
                assert_eq!(pattern, "reading light");
                assert_eq!(owner, "lamp");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ts.storage.count_devices().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_are_scoped_to_owner() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        let (other, _) = skill_with_type(&ts.storage, "media", "speaker").await;
        let room = ts.storage.ensure_room("kitchen").await.unwrap();
        let device = ts
            .storage
            .register_device(&skill.id, &light, &NewDevice::new("light", "lamp"), Some(&room.id))
            .await
            .unwrap()
            .device;
        assert_eq!(device.room_id.as_ref(), Some(&room.id));

        let update = DeviceUpdate {
            name: Some("kitchen lamp".to_string()),
            patterns: Some(vec!["kitchen lamp".to_string(), "counter light".to_string()]),
            device_attributes: Some(serde_json::json!({"dimmable": true})),
            room_id: Some(None),
        };
        assert!(matches!(
            ts.storage.update_device(&other.id, &device.id, &update).await,
            Err(StorageError::DeviceNotFound(_))
        ));

        let updated = ts.storage.update_device(&skill.id, &device.id, &update).await.unwrap();
        assert_eq!(updated.name, "kitchen lamp");
        assert_eq!(updated.patterns, vec!["kitchen lamp", "counter light"]);
        assert_eq!(updated.device_attributes, Some(serde_json::json!({"dimmable": true})));
        assert!(updated.room_id.is_none());

        assert!(ts.storage.delete_device(&other.id, &device.id).await.is_err());
        ts.storage.delete_device(&skill.id, &device.id).await.unwrap();
        assert!(ts.storage.list_devices(&skill.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_skill_cascades_to_devices() {
        let ts = create_test_storage().await;
        let (skill, light) = skill_with_type(&ts.storage, "switch", "light").await;
        ts.storage
            .register_device(&skill.id, &light, &NewDevice::new("light", "lamp"), None)
            .await
            .unwrap();
        ts.storage.delete_skill("switch").await.unwrap();
        assert_eq!(ts.storage.count_devices().await.unwrap(), 0);
        assert!(ts.storage.find_skill("switch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rooms_are_unique_by_name() {
        let ts = create_test_storage().await;
        let a = ts.storage.ensure_room("office").await.unwrap();
        let b = ts.storage.ensure_room("office").await.unwrap();
        assert_eq!(a, b);
        assert!(ts.storage.find_room("attic").await.unwrap().is_none());
    }
}

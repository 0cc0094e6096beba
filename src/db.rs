use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::measurement::{DamageType, Measurement};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tire_measurements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    original_video_url TEXT,
    position TEXT NOT NULL,
    left_depth REAL NOT NULL,
    center_depth REAL NOT NULL,
    right_depth REAL NOT NULL,
    brand TEXT NOT NULL,
    model TEXT NOT NULL,
    size TEXT NOT NULL,
    load_index TEXT,
    speed_rating TEXT,
    vehicle_make TEXT,
    vehicle_model TEXT,
    vehicle_year INTEGER,
    weather_condition TEXT,
    weather_temperature REAL,
    tire_cleanliness TEXT,
    lighting_condition TEXT,
    damage_type TEXT,
    damage_description TEXT,
    measurement_device TEXT,
    location TEXT,
    notes TEXT,
    mileage REAL
);

CREATE TABLE IF NOT EXISTS frame_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tire_measurement_id INTEGER NOT NULL
        REFERENCES tire_measurements(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    frame_url TEXT NOT NULL,
    UNIQUE (tire_measurement_id, position)
);
"#;

/// 测量记录存储（SQLite）
///
/// 帧地址放在 `frame_images` 表中，`position` 列保存帧顺序。
pub struct MeasurementStore {
    conn: Mutex<Connection>,
}

impl MeasurementStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("📦 数据库已打开: {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Io(std::io::Error::other("数据库连接锁已损坏")))
    }

    /// 在一个事务中写入记录及其帧地址，返回新记录 id
    pub fn insert(&self, m: &Measurement) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO tire_measurements (
                timestamp, original_video_url, position, left_depth, center_depth, right_depth,
                brand, model, size, load_index, speed_rating,
                vehicle_make, vehicle_model, vehicle_year,
                weather_condition, weather_temperature, tire_cleanliness, lighting_condition,
                damage_type, damage_description, measurement_device, location, notes, mileage
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                m.timestamp,
                m.original_video_url,
                m.position,
                m.left_depth,
                m.center_depth,
                m.right_depth,
                m.brand,
                m.model,
                m.size,
                m.load_index,
                m.speed_rating,
                m.vehicle_make,
                m.vehicle_model,
                m.vehicle_year,
                m.weather_condition,
                m.weather_temperature,
                m.tire_cleanliness,
                m.lighting_condition,
                m.damage_type,
                m.damage_description,
                m.measurement_device,
                m.location,
                m.notes,
                m.mileage,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO frame_images (tire_measurement_id, position, frame_url) VALUES (?1, ?2, ?3)",
            )?;
            for (position, url) in m.frame_urls.iter().enumerate() {
                stmt.execute(params![id, position as i64, url])?;
            }
        }
        tx.commit()?;

        info!("✅ 测量记录已保存: id={}, 位置={}, 帧数={}", id, m.position.as_str(), m.frame_urls.len());
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<Measurement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM tire_measurements ORDER BY id")?;
        let mut records = stmt
            .query_map([], measurement_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut records {
            record.frame_urls = frame_urls(&conn, record.id)?;
        }
        debug!("读取测量记录 {} 条", records.len());
        Ok(records)
    }

    pub fn get(&self, id: i64) -> Result<Option<Measurement>> {
        let conn = self.conn()?;
        let record = conn
            .query_row("SELECT * FROM tire_measurements WHERE id = ?1", [id], measurement_from_row)
            .optional()?;
        match record {
            Some(mut record) => {
                record.frame_urls = frame_urls(&conn, id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// 删除记录，帧地址随外键级联删除；返回是否存在该记录
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM tire_measurements WHERE id = ?1", [id])?;
        if affected > 0 {
            info!("🗑️  测量记录已删除: id={}", id);
        }
        Ok(affected > 0)
    }
}

fn frame_urls(conn: &Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT frame_url FROM frame_images WHERE tire_measurement_id = ?1 ORDER BY position")?;
    let urls = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(urls)
}

fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    Ok(Measurement {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        position: row.get("position")?,
        left_depth: row.get("left_depth")?,
        center_depth: row.get("center_depth")?,
        right_depth: row.get("right_depth")?,
        brand: row.get("brand")?,
        model: row.get("model")?,
        size: row.get("size")?,
        load_index: row.get::<_, Option<String>>("load_index")?.unwrap_or_default(),
        speed_rating: row.get::<_, Option<String>>("speed_rating")?.unwrap_or_default(),
        vehicle_make: row.get::<_, Option<String>>("vehicle_make")?.unwrap_or_default(),
        vehicle_model: row.get::<_, Option<String>>("vehicle_model")?.unwrap_or_default(),
        vehicle_year: row.get::<_, Option<i32>>("vehicle_year")?.unwrap_or_default(),
        weather_condition: row.get::<_, Option<String>>("weather_condition")?.unwrap_or_default(),
        weather_temperature: row.get::<_, Option<f64>>("weather_temperature")?.unwrap_or_default(),
        tire_cleanliness: row.get::<_, Option<String>>("tire_cleanliness")?.unwrap_or_default(),
        lighting_condition: row.get::<_, Option<String>>("lighting_condition")?.unwrap_or_default(),
        damage_type: row.get::<_, Option<DamageType>>("damage_type")?.unwrap_or_default(),
        damage_description: row.get::<_, Option<String>>("damage_description")?.unwrap_or_default(),
        measurement_device: row.get::<_, Option<String>>("measurement_device")?.unwrap_or_default(),
        location: row.get("location")?,
        notes: row.get("notes")?,
        mileage: row.get("mileage")?,
        original_video_url: row.get("original_video_url")?,
        frame_urls: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{FrameRef, NewMeasurement, TirePosition};

    fn measurement(position: TirePosition, urls: &[&str]) -> Measurement {
        NewMeasurement {
            position: Some(position),
            brand: Some("Michelin".into()),
            frames: urls.iter().map(|u| FrameRef { url: u.to_string() }).collect(),
            original_video_url: Some("https://media.test/v.mp4".into()),
            ..Default::default()
        }
        .resolve(chrono::Utc::now())
        .unwrap()
    }

    #[test]
    fn test_insert_and_get_preserves_frame_order() {
        let store = MeasurementStore::open_in_memory().unwrap();
        let urls = ["u/3.jpg", "u/1.jpg", "u/2.jpg"];
        let id = store.insert(&measurement(TirePosition::FL, &urls)).unwrap();

        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.position, TirePosition::FL);
        assert_eq!(loaded.brand, "Michelin");
        assert_eq!(loaded.frame_urls, urls);
        assert_eq!(loaded.original_video_url.as_deref(), Some("https://media.test/v.mp4"));
    }

    #[test]
    fn test_list_returns_all_records() {
        let store = MeasurementStore::open_in_memory().unwrap();
        store.insert(&measurement(TirePosition::FL, &["a.jpg"])).unwrap();
        store.insert(&measurement(TirePosition::RR, &[])).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].frame_urls, vec!["a.jpg"]);
        assert_eq!(all[1].position, TirePosition::RR);
        assert!(all[1].frame_urls.is_empty());
    }

    #[test]
    fn test_delete_cascades_frames() {
        let store = MeasurementStore::open_in_memory().unwrap();
        let id = store.insert(&measurement(TirePosition::FR, &["a.jpg", "b.jpg"])).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());

        let conn = store.conn().unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM frame_images", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tire-data.db");
        let id = {
            let store = MeasurementStore::open(&path).unwrap();
            store.insert(&measurement(TirePosition::RL, &["x.jpg"])).unwrap()
        };
        let reopened = MeasurementStore::open(&path).unwrap();
        assert_eq!(reopened.get(id).unwrap().unwrap().frame_urls, vec!["x.jpg"]);
    }
}

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{PipelineError, Result};

/// 轮胎位置：左前、右前、左后、右后
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TirePosition {
    FL,
    FR,
    RL,
    RR,
}

impl TirePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TirePosition::FL => "FL",
            TirePosition::FR => "FR",
            TirePosition::RL => "RL",
            TirePosition::RR => "RR",
        }
    }
}

impl FromStr for TirePosition {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FL" => Ok(TirePosition::FL),
            "FR" => Ok(TirePosition::FR),
            "RL" => Ok(TirePosition::RL),
            "RR" => Ok(TirePosition::RR),
            other => Err(PipelineError::Rejected(format!("未知轮胎位置: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    #[default]
    None,
    Surface,
    Structural,
    Wear,
}

impl DamageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageType::None => "none",
            DamageType::Surface => "surface",
            DamageType::Structural => "structural",
            DamageType::Wear => "wear",
        }
    }
}

impl FromStr for DamageType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "" => Ok(DamageType::None),
            "surface" => Ok(DamageType::Surface),
            "structural" => Ok(DamageType::Structural),
            "wear" => Ok(DamageType::Wear),
            other => Err(PipelineError::Rejected(format!("未知损伤类型: {}", other))),
        }
    }
}

// 枚举以文本形式存入 SQLite
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
            }
        }
    };
}

sql_text_enum!(TirePosition);
sql_text_enum!(DamageType);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weather {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRef {
    pub url: String,
}

/// 客户端提交的测量数据，除 `position` 外都可以省略
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMeasurement {
    pub position: Option<TirePosition>,
    pub left_region_depth: Option<f64>,
    pub center_region_depth: Option<f64>,
    pub right_region_depth: Option<f64>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub custom_brand: Option<String>,
    pub custom_model: Option<String>,
    pub size: Option<String>,
    pub load_index: Option<String>,
    pub speed_rating: Option<String>,
    #[serde(default)]
    pub vehicle: Vehicle,
    #[serde(default)]
    pub weather: Weather,
    pub tire_cleanliness: Option<String>,
    pub lighting_condition: Option<String>,
    pub damage_type: Option<DamageType>,
    pub damage_description: Option<String>,
    pub measurement_device: Option<String>,
    pub timestamp: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub mileage: Option<f64>,
    #[serde(default)]
    pub frames: Vec<FrameRef>,
    pub original_video_url: Option<String>,
}

/// 已落库的测量记录
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub id: i64,
    pub timestamp: String,
    pub position: TirePosition,
    pub left_depth: f64,
    pub center_depth: f64,
    pub right_depth: f64,
    pub brand: String,
    pub model: String,
    pub size: String,
    pub load_index: String,
    pub speed_rating: String,
    pub vehicle_make: String,
    pub vehicle_model: String,
    pub vehicle_year: i32,
    pub weather_condition: String,
    pub weather_temperature: f64,
    pub tire_cleanliness: String,
    pub lighting_condition: String,
    pub damage_type: DamageType,
    pub damage_description: String,
    pub measurement_device: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub mileage: Option<f64>,
    pub original_video_url: Option<String>,
    /// 按帧顺序排列
    pub frame_urls: Vec<String>,
}

/// 空串视为未填写
fn filled(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// 品牌/型号选择 "other" 时使用自定义输入
fn resolve_choice(choice: Option<String>, custom: Option<String>) -> String {
    match filled(choice) {
        Some(c) if c.eq_ignore_ascii_case("other") => filled(custom).unwrap_or(c),
        Some(c) => c,
        None => String::new(),
    }
}

impl NewMeasurement {
    /// 校验并补齐默认值，`id` 由存储层分配
    pub fn resolve(self, now: DateTime<Utc>) -> Result<Measurement> {
        let position = self
            .position
            .ok_or_else(|| PipelineError::Rejected("缺少轮胎位置 (position)".into()))?;

        Ok(Measurement {
            id: 0,
            timestamp: filled(self.timestamp)
                .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            position,
            left_depth: self.left_region_depth.unwrap_or(0.0),
            center_depth: self.center_region_depth.unwrap_or(0.0),
            right_depth: self.right_region_depth.unwrap_or(0.0),
            brand: resolve_choice(self.brand, self.custom_brand),
            model: resolve_choice(self.model, self.custom_model),
            size: filled(self.size).unwrap_or_default(),
            load_index: filled(self.load_index).unwrap_or_default(),
            speed_rating: filled(self.speed_rating).unwrap_or_default(),
            vehicle_make: filled(self.vehicle.make).unwrap_or_default(),
            vehicle_model: filled(self.vehicle.model).unwrap_or_default(),
            vehicle_year: self.vehicle.year.filter(|y| *y > 0).unwrap_or_else(|| now.year()),
            weather_condition: filled(self.weather.condition).unwrap_or_else(|| "Dry".into()),
            weather_temperature: self.weather.temperature.unwrap_or(20.0),
            tire_cleanliness: filled(self.tire_cleanliness).unwrap_or_else(|| "Clean".into()),
            lighting_condition: filled(self.lighting_condition).unwrap_or_else(|| "Good".into()),
            damage_type: self.damage_type.unwrap_or_default(),
            damage_description: filled(self.damage_description).unwrap_or_default(),
            measurement_device: filled(self.measurement_device).unwrap_or_default(),
            location: filled(self.location),
            notes: filled(self.notes),
            mileage: self.mileage,
            original_video_url: filled(self.original_video_url),
            frame_urls: self.frames.into_iter().map(|f| f.url).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_missing_position_rejected() {
        let err = NewMeasurement::default().resolve(now()).unwrap_err();
        assert!(matches!(err, PipelineError::Rejected(_)));
    }

    #[test]
    fn test_defaults_applied() {
        let m = NewMeasurement {
            position: Some(TirePosition::RL),
            ..Default::default()
        }
        .resolve(now())
        .unwrap();

        assert_eq!(m.weather_condition, "Dry");
        assert_eq!(m.weather_temperature, 20.0);
        assert_eq!(m.tire_cleanliness, "Clean");
        assert_eq!(m.lighting_condition, "Good");
        assert_eq!(m.damage_type, DamageType::None);
        assert_eq!(m.vehicle_year, 2024);
        assert_eq!(m.timestamp, "2024-03-01T08:30:00.000Z");
        assert!(m.frame_urls.is_empty());
    }

    #[test]
    fn test_other_brand_uses_custom_value() {
        let m = NewMeasurement {
            position: Some(TirePosition::FL),
            brand: Some("other".into()),
            custom_brand: Some("Nokian".into()),
            model: Some("Pilot Sport 4".into()),
            custom_model: Some("ignored".into()),
            ..Default::default()
        }
        .resolve(now())
        .unwrap();
        assert_eq!(m.brand, "Nokian");
        assert_eq!(m.model, "Pilot Sport 4");
    }

    #[test]
    fn test_deserialize_client_payload() {
        let raw = r#"{
            "position": "FR",
            "leftRegionDepth": 6.5,
            "centerRegionDepth": 7.0,
            "rightRegionDepth": 6.8,
            "brand": "Michelin",
            "vehicle": {"make": "Toyota", "model": "Camry", "year": 2020},
            "weather": {"condition": "Wet", "temperature": 12},
            "damageType": "wear",
            "frames": [{"url": "https://media.test/a.jpg"}, {"url": "https://media.test/b.jpg"}]
        }"#;
        let m = serde_json::from_str::<NewMeasurement>(raw).unwrap().resolve(now()).unwrap();
        assert_eq!(m.position, TirePosition::FR);
        assert_eq!(m.vehicle_year, 2020);
        assert_eq!(m.weather_condition, "Wet");
        assert_eq!(m.damage_type, DamageType::Wear);
        assert_eq!(m.frame_urls, vec!["https://media.test/a.jpg", "https://media.test/b.jpg"]);
    }

    #[test]
    fn test_position_parse() {
        assert_eq!("RR".parse::<TirePosition>().unwrap(), TirePosition::RR);
        assert!("XX".parse::<TirePosition>().is_err());
    }
}

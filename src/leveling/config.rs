use crate::db;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const SETTINGS_KEY: &str = "setup.leveling";
pub const MAX_SECTIONS: usize = 12;
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeWeights {
    pub test: f64,
    pub grades: f64,
    pub anecdotal: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            test: 0.3,
            grades: 0.4,
            anecdotal: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyFloor {
    /// Fewer correct words than this forces the lowest section.
    pub min_correct: f64,
    /// Accuracy (correct / attempted) below this forces the lowest section.
    pub min_accuracy: f64,
}

impl Default for SafetyFloor {
    fn default() -> Self {
        Self {
            min_correct: 4.0,
            min_accuracy: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelingConfig {
    pub weights: CompositeWeights,
    /// Ordered lowest to highest.
    pub sections: Vec<String>,
    pub safety_floor: SafetyFloor,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            weights: CompositeWeights::default(),
            sections: (1..=6).map(|n| format!("Level {}", n)).collect(),
            safety_floor: SafetyFloor::default(),
        }
    }
}

impl LevelingConfig {
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn lowest_section(&self) -> &str {
        self.sections.first().map(String::as_str).unwrap_or("")
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }

    /// Applies a patch all or nothing: on the first invalid field `self` is
    /// left untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            next.apply_field(k, v)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_field(&mut self, key: &str, v: &Value) -> Result<(), String> {
        match key {
            "weights" => {
                self.weights = parse_weights(v)?;
            }
            "sections" => {
                self.sections = parse_sections(v)?;
            }
            "safetyFloor" => {
                let Some(obj) = v.as_object() else {
                    return Err("safetyFloor must be an object".to_string());
                };
                let mut floor = self.safety_floor;
                for (fk, fv) in obj {
                    match fk.as_str() {
                        "minCorrect" => {
                            floor.min_correct = parse_f64_range(fv, "safetyFloor.minCorrect", 0.0, 1000.0)?;
                        }
                        "minAccuracy" => {
                            floor.min_accuracy = parse_f64_range(fv, "safetyFloor.minAccuracy", 0.0, 1.0)?;
                        }
                        _ => return Err(format!("unknown safetyFloor field: {}", fk)),
                    }
                }
                self.safety_floor = floor;
            }
            _ => return Err(format!("unknown leveling field: {}", key)),
        }
        Ok(())
    }

    /// Defaults overlaid with whatever stored fields still validate.
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? {
            if let Some(obj) = saved.as_object() {
                for (k, v) in obj {
                    if let Err(msg) = cfg.apply_field(k, v) {
                        tracing::warn!(field = %k, error = %msg, "ignoring stored leveling setting");
                    }
                }
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &self.to_json())
    }
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !n.is_finite() || n < min || n > max {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_weights(v: &Value) -> Result<CompositeWeights, String> {
    let Some(obj) = v.as_object() else {
        return Err("weights must be an object".to_string());
    };
    for k in obj.keys() {
        if !matches!(k.as_str(), "test" | "grades" | "anecdotal") {
            return Err(format!("unknown weights field: {}", k));
        }
    }
    let field = |name: &str| -> Result<f64, String> {
        let raw = obj
            .get(name)
            .ok_or_else(|| format!("weights.{} is required", name))?;
        parse_f64_range(raw, &format!("weights.{}", name), 0.0, 1.0)
    };
    let weights = CompositeWeights {
        test: field("test")?,
        grades: field("grades")?,
        anecdotal: field("anecdotal")?,
    };
    let sum = weights.test + weights.grades + weights.anecdotal;
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(format!("weights must sum to 1 (got {})", sum));
    }
    Ok(weights)
}

fn parse_sections(v: &Value) -> Result<Vec<String>, String> {
    let Some(arr) = v.as_array() else {
        return Err("sections must be an array of strings".to_string());
    };
    if arr.is_empty() || arr.len() > MAX_SECTIONS {
        return Err(format!("sections must have 1..={} entries", MAX_SECTIONS));
    }
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let Some(s) = item.as_str() else {
            return Err("sections must be an array of strings".to_string());
        };
        let name = s.trim();
        if name.is_empty() {
            return Err("section names must not be blank".to_string());
        }
        if out.iter().any(|existing| existing == name) {
            return Err(format!("duplicate section name: {}", name));
        }
        out.push(name.to_string());
    }
    Ok(out)
}

//! Bridge WASM <-> JavaScript: nạp dữ liệu một lần, render từng tab thành JSON.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chartviz_core::{ChartError, EngineConfig, PanelSlot, PatientHistory, TaxonomyCatalog};
use chartviz_engine::{Dashboard, MemoryStore, Neighbor, NeighborTable, TabRequest};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

/// Cấu hình từ JS; trường nào có mặt thì ghi đè giá trị mặc định.
#[derive(Deserialize, Default)]
struct JsEngineConfig {
    #[serde(default)]
    epoch: Option<NaiveDate>,
    #[serde(default)]
    grid_points: Option<usize>,
    #[serde(default)]
    final_intensity_cutoff: Option<f64>,
    #[serde(default)]
    relevance_threshold: Option<f64>,
    #[serde(default)]
    api_relevance_threshold: Option<f64>,
    #[serde(default)]
    recent_window_days: Option<i64>,
    #[serde(default)]
    neighbor_count: Option<usize>,
    #[serde(default)]
    bandwidth_days: Option<f64>,
    #[serde(default)]
    chem_panel: Option<Vec<PanelSlot>>,
    #[serde(default)]
    cbc_panel: Option<Vec<PanelSlot>>,
    #[serde(default)]
    always_include_labs: Option<BTreeSet<String>>,
    #[serde(default)]
    relevance_cache_capacity: Option<u64>,
    #[serde(default)]
    excluded_chapter: Option<String>,
    #[serde(default)]
    note_search_radius_days: Option<i64>,
    #[serde(default)]
    dateshift_min_offset_days: Option<i64>,
}

impl From<JsEngineConfig> for EngineConfig {
    fn from(cfg: JsEngineConfig) -> Self {
        let mut base = EngineConfig::default();
        if let Some(epoch) = cfg.epoch {
            base.epoch = epoch;
        }
        if let Some(points) = cfg.grid_points {
            base.grid_points = points;
        }
        if let Some(cutoff) = cfg.final_intensity_cutoff {
            base.final_intensity_cutoff = cutoff;
        }
        if let Some(threshold) = cfg.relevance_threshold {
            base.relevance_threshold = threshold;
        }
        if let Some(threshold) = cfg.api_relevance_threshold {
            base.api_relevance_threshold = threshold;
        }
        if let Some(days) = cfg.recent_window_days {
            base.recent_window_days = days;
        }
        if let Some(count) = cfg.neighbor_count {
            base.neighbor_count = count;
        }
        if cfg.bandwidth_days.is_some() {
            base.bandwidth_days = cfg.bandwidth_days;
        }
        if let Some(panel) = cfg.chem_panel {
            base.chem_panel = panel;
        }
        if let Some(panel) = cfg.cbc_panel {
            base.cbc_panel = panel;
        }
        if let Some(labs) = cfg.always_include_labs {
            base.always_include_labs = labs;
        }
        if let Some(capacity) = cfg.relevance_cache_capacity {
            base.relevance_cache_capacity = capacity;
        }
        if let Some(chapter) = cfg.excluded_chapter {
            base.excluded_chapter = chapter;
        }
        if let Some(days) = cfg.note_search_radius_days {
            base.note_search_radius_days = days;
        }
        if let Some(days) = cfg.dateshift_min_offset_days {
            base.dateshift_min_offset_days = days;
        }
        base
    }
}

/// Engine giữ kho dữ liệu và bộ nhớ đệm láng giềng giữa các lần render.
#[wasm_bindgen]
pub struct ChartEngine {
    dashboard: Dashboard,
}

#[wasm_bindgen]
impl ChartEngine {
    /// `neighbors` có dạng `{ "<KIND>: <code>": [[token, score], ...] }`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        taxonomy: JsValue,
        histories: JsValue,
        neighbors: JsValue,
        config: Option<JsValue>,
    ) -> Result<ChartEngine, JsValue> {
        #[cfg(target_arch = "wasm32")]
        console_error_panic_hook::set_once();

        let taxonomy: TaxonomyCatalog = from_value(taxonomy)
            .map_err(|err| JsValue::from_str(&format!("Không đọc được danh mục mã: {err}")))?;
        let histories: Vec<PatientHistory> = from_value(histories)
            .map_err(|err| JsValue::from_str(&format!("Không đọc được hồ sơ bệnh nhân: {err}")))?;
        let neighbors: HashMap<String, Vec<(String, f64)>> = from_value(neighbors)
            .map_err(|err| JsValue::from_str(&format!("Không đọc được bảng láng giềng: {err}")))?;
        let cfg = read_config(config)?;

        let store = Arc::new(MemoryStore::new(taxonomy, histories).map_err(js_error)?);
        let index = NeighborTable::new(
            neighbors
                .into_iter()
                .map(|(token, hits)| {
                    let hits = hits
                        .into_iter()
                        .map(|(t, score)| Neighbor::new(t, score))
                        .collect();
                    (token, hits)
                })
                .collect(),
        );

        Ok(ChartEngine {
            dashboard: Dashboard::new(store.clone(), store, Arc::new(index), cfg),
        })
    }

    /// Render một tab, ví dụ `{ tab: "overview", patient_id: 1, today: "2020-01-15" }`.
    pub fn render(&self, request: JsValue) -> Result<JsValue, JsValue> {
        let request: TabRequest = from_value(request)
            .map_err(|err| JsValue::from_str(&format!("Yêu cầu tab không hợp lệ: {err}")))?;
        let value = self.dashboard.render(&request).map_err(js_error)?;
        to_value(&value).map_err(|err| JsValue::from_str(&format!("Không serialize tab: {err}")))
    }
}

fn read_config(config: Option<JsValue>) -> Result<EngineConfig, JsValue> {
    match config {
        Some(js_cfg) if !js_cfg.is_undefined() && !js_cfg.is_null() => {
            let cfg: JsEngineConfig = from_value(js_cfg)
                .map_err(|err| JsValue::from_str(&format!("Không đọc được config: {err}")))?;
            Ok(EngineConfig::from(cfg))
        }
        _ => Ok(EngineConfig::default()),
    }
}

fn js_error(err: ChartError) -> JsValue {
    JsValue::from_str(&format_chart_error(err))
}

fn format_chart_error(err: ChartError) -> String {
    format!("Chart error: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_overrides_defaults() {
        let js: JsEngineConfig =
            serde_json::from_str(r#"{ "final_intensity_cutoff": 0.01, "epoch": "2010-01-01" }"#)
                .expect("config hợp lệ");
        let cfg = EngineConfig::from(js);
        assert_eq!(cfg.final_intensity_cutoff, 0.01);
        assert_eq!(cfg.epoch, NaiveDate::from_ymd_opt(2010, 1, 1).unwrap());
        assert_eq!(cfg.grid_points, 100);
        assert_eq!(cfg.api_relevance_threshold, 0.2);
    }

    #[test]
    fn every_config_field_can_be_overridden() {
        let js: JsEngineConfig = serde_json::from_str(
            r#"{
                "excluded_chapter": "Other",
                "note_search_radius_days": 9,
                "relevance_cache_capacity": 5,
                "dateshift_min_offset_days": 60
            }"#,
        )
        .expect("config hợp lệ");
        let cfg = EngineConfig::from(js);
        assert_eq!(cfg.excluded_chapter, "Other");
        assert_eq!(cfg.note_search_radius_days, 9);
        assert_eq!(cfg.relevance_cache_capacity, 5);
        assert_eq!(cfg.dateshift_min_offset_days, 60);
        assert_eq!(cfg.neighbor_count, 1000);
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(
            EngineConfig::from(JsEngineConfig::default()),
            EngineConfig::default()
        );
    }

    #[test]
    fn errors_carry_prefix() {
        let message = format_chart_error(ChartError::UnknownPhecode("999".into()));
        assert!(message.starts_with("Chart error: "));
        assert!(message.contains("999"));
    }
}

//! Logic lõi: mô hình dữ liệu, lưới thời gian và ước lượng cường độ hoạt động lâm sàng.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod grid;
pub mod intensity;
pub mod model;

pub use grid::{within, DateRange, TimeGrid};
pub use intensity::{area_under_curve, infer_intensity, IntensityCurve, IntensityEstimator};
pub use model::*;

/// Mốc bắt đầu mặc định của lưới thời gian.
pub const DEFAULT_EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(2000, 1, 1) {
    Some(date) => date,
    None => panic!("ngày mốc không hợp lệ"),
};

/// Cấu hình các hằng số thực nghiệm của engine.
///
/// Mọi trường đều có giá trị mặc định nên có thể nạp từ JSON chỉ chứa một phần.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Mốc đầu tiên của lưới thời gian.
    pub epoch: NaiveDate,
    /// Số điểm của lưới thời gian.
    pub grid_points: usize,
    /// Ngưỡng cường độ cuối để một phecode lọt vào danh sách vấn đề.
    pub final_intensity_cutoff: f64,
    /// Ngưỡng liên quan mặc định cho tab bệnh lý.
    pub relevance_threshold: f64,
    /// Ngưỡng liên quan áp dụng cho yêu cầu từ lớp API (wasm, CLI).
    pub api_relevance_threshold: f64,
    /// Cửa sổ (ngày) coi là "gần đây" cho thuốc và xét nghiệm ở tab tổng quan.
    pub recent_window_days: i64,
    /// Số láng giềng tối đa lấy từ chỉ mục embedding.
    pub neighbor_count: usize,
    /// Số mục tối đa của bộ nhớ đệm láng giềng.
    pub relevance_cache_capacity: u64,
    /// Băng thông kernel cố định (ngày). `None` thì suy ra từ bước lưới.
    pub bandwidth_days: Option<f64>,
    /// Bảng sinh hóa luôn hiển thị, theo thứ tự cấu hình.
    pub chem_panel: Vec<PanelSlot>,
    /// Bảng công thức máu luôn hiển thị, theo thứ tự cấu hình.
    pub cbc_panel: Vec<PanelSlot>,
    /// Mã xét nghiệm luôn được gộp vào nhóm LAB khi mở rộng liên quan.
    pub always_include_labs: BTreeSet<String>,
    /// Chương giả bị loại khỏi cây hệ cơ quan.
    pub excluded_chapter: String,
    /// Bán kính (ngày) tối đa khi nới rộng tìm ghi chú lâm sàng.
    pub note_search_radius_days: i64,
    /// Chỉ dời ngày khi hoạt động gần nhất cũ hơn số ngày này.
    pub dateshift_min_offset_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epoch: DEFAULT_EPOCH,
            grid_points: 100,
            final_intensity_cutoff: 0.0018,
            relevance_threshold: 0.75,
            api_relevance_threshold: 0.2,
            recent_window_days: 7,
            neighbor_count: 1000,
            relevance_cache_capacity: 1024,
            bandwidth_days: None,
            chem_panel: Vec::new(),
            cbc_panel: Vec::new(),
            always_include_labs: BTreeSet::new(),
            excluded_chapter: "Procedures".to_string(),
            note_search_radius_days: 3,
            dateshift_min_offset_days: 30,
        }
    }
}

impl EngineConfig {
    /// Dựng lưới thời gian từ `epoch` tới `today`.
    pub fn grid(&self, today: NaiveDate) -> Result<TimeGrid, ChartError> {
        TimeGrid::build(
            self.epoch.and_time(chrono::NaiveTime::MIN),
            today.and_time(chrono::NaiveTime::MIN),
            self.grid_points,
        )
    }

    /// Bộ ước lượng cường độ theo băng thông đã cấu hình.
    pub fn estimator(&self) -> IntensityEstimator {
        IntensityEstimator {
            bandwidth_days: self.bandwidth_days,
        }
    }
}

/// Một ô cố định trong bảng xét nghiệm (sinh hóa, công thức máu).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PanelSlot {
    pub code: String,
    pub description: String,
}

/// Lỗi chung của engine.
#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("Lưới thời gian không hợp lệ: epoch {epoch} sau thời điểm {now}")]
    InvalidGrid {
        epoch: chrono::NaiveDateTime,
        now: chrono::NaiveDateTime,
    },
    #[error("Đường cường độ dài {curve} không khớp lưới dài {grid}")]
    CurveLengthMismatch { curve: usize, grid: usize },
    #[error("Không tìm thấy bệnh nhân {0}")]
    UnknownPatient(PatientId),
    #[error("Không tìm thấy phecode {0}")]
    UnknownPhecode(String),
    #[error("Không tìm thấy mã {kind} {code}")]
    UnknownCode { kind: EventKind, code: String },
    #[error("Token từ vựng không hợp lệ: {0}")]
    UnknownToken(String),
    #[error("Lỗi kho dữ liệu: {0}")]
    Store(String),
    #[error("Lỗi chỉ mục embedding: {0}")]
    Index(String),
    #[error("Không đọc được dữ liệu: {0}")]
    Parse(String),
}

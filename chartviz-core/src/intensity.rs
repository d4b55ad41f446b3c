//! Ước lượng cường độ hoạt động từ tập ngày sự kiện thưa, trên lưới thời gian chung.
//!
//! Dùng tổng kernel Gauss với băng thông cố định trên trục ngày tính từ điểm đầu lưới.
//! Đơn vị của đường cong là số sự kiện mỗi ngày. Vì mỗi sự kiện đóng góp một lượng
//! không âm, thêm sự kiện không bao giờ làm giảm đường cong tại bất kỳ điểm nào.

use std::collections::BTreeSet;
use std::f64::consts::PI;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::{ChartError, TimeGrid};

/// Băng thông tối thiểu (ngày) khi suy ra từ lưới.
const MIN_BANDWIDTH_DAYS: f64 = 1.0;

/// Đường cường độ, thẳng hàng 1:1 với lưới thời gian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct IntensityCurve(Vec<f64>);

impl IntensityCurve {
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Giá trị tại điểm lưới cuối cùng, dùng làm thước đo "còn hoạt động".
    pub fn final_intensity(&self) -> f64 {
        self.0.last().copied().unwrap_or(0.0)
    }
}

/// Bộ ước lượng kernel. `bandwidth_days = None` thì lấy bằng bước lưới.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntensityEstimator {
    pub bandwidth_days: Option<f64>,
}

impl IntensityEstimator {
    pub fn bandwidth(&self, grid: &TimeGrid) -> f64 {
        self.bandwidth_days
            .filter(|b| b.is_finite() && *b > 0.0)
            .unwrap_or_else(|| grid.step_days())
            .max(MIN_BANDWIDTH_DAYS)
    }

    /// Tính đường cường độ cho một tập ngày (trùng lặp bị loại).
    pub fn estimate<I>(&self, dates: I, grid: &TimeGrid) -> IntensityCurve
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        let unique: BTreeSet<NaiveDate> = dates.into_iter().collect();
        if unique.is_empty() {
            return IntensityCurve::zeros(grid.len());
        }

        let h = self.bandwidth(grid);
        let norm = 1.0 / (h * (2.0 * PI).sqrt());
        let events: Vec<f64> = unique
            .iter()
            .map(|d| grid.offset_days(d.and_time(NaiveTime::MIN)))
            .collect();

        let values: Vec<f64> = grid
            .offsets()
            .into_iter()
            .map(|t| {
                events
                    .iter()
                    .map(|x| {
                        let z = (t - x) / h;
                        norm * (-0.5 * z * z).exp()
                    })
                    .sum::<f64>()
            })
            .collect();
        IntensityCurve(values)
    }
}

/// Cường độ với băng thông mặc định.
pub fn infer_intensity<I>(dates: I, grid: &TimeGrid) -> IntensityCurve
where
    I: IntoIterator<Item = NaiveDate>,
{
    IntensityEstimator::default().estimate(dates, grid)
}

/// Diện tích dưới đường cong theo quy tắc hình thang trên trục ngày của lưới.
pub fn area_under_curve(curve: &IntensityCurve, grid: &TimeGrid) -> Result<f64, ChartError> {
    if curve.len() != grid.len() {
        return Err(ChartError::CurveLengthMismatch {
            curve: curve.len(),
            grid: grid.len(),
        });
    }
    let xs = grid.offsets();
    let area = xs
        .windows(2)
        .zip(curve.values().windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum();
    Ok(area)
}

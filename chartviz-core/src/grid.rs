//! Lưới thời gian dùng chung cho mọi đường cường độ.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::ChartError;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Dãy mốc thời gian cách đều nhau từ `epoch` tới "hiện tại" (bao gồm hai đầu).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TimeGrid {
    points: Vec<NaiveDateTime>,
}

impl TimeGrid {
    /// Dựng lưới `n` điểm. Lỗi khi `epoch > now`.
    ///
    /// `n == 1` cho lưới chỉ gồm `epoch`; `epoch == now` cho lưới suy biến gồm các điểm trùng nhau.
    pub fn build(epoch: NaiveDateTime, now: NaiveDateTime, n: usize) -> Result<Self, ChartError> {
        if epoch > now {
            return Err(ChartError::InvalidGrid { epoch, now });
        }
        let span_ms = (now - epoch).num_milliseconds();
        let points = match n {
            0 => Vec::new(),
            1 => vec![epoch],
            _ => {
                let last = (n - 1) as i64;
                (0..n as i64)
                    .map(|i| epoch + Duration::milliseconds(span_ms * i / last))
                    .collect()
            }
        };
        Ok(Self { points })
    }

    pub fn points(&self) -> &[NaiveDateTime] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Điểm đầu (lưới rỗng coi như bắt đầu tại mốc Unix).
    pub fn start(&self) -> NaiveDateTime {
        self.points.first().copied().unwrap_or_default()
    }

    pub fn end(&self) -> NaiveDateTime {
        self.points.last().copied().unwrap_or_default()
    }

    /// Khoảng ngày mà lưới bao phủ, dùng để lọc sự kiện.
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start().date(), self.end().date())
    }

    /// Độ lệch (ngày, số thực) của một thời điểm so với điểm đầu lưới.
    pub fn offset_days(&self, at: NaiveDateTime) -> f64 {
        (at - self.start()).num_seconds() as f64 / SECONDS_PER_DAY
    }

    /// Độ lệch (ngày) của từng điểm lưới.
    pub fn offsets(&self) -> Vec<f64> {
        self.points.iter().map(|p| self.offset_days(*p)).collect()
    }

    /// Khoảng cách (ngày) giữa hai điểm liền kề.
    pub fn step_days(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        self.offset_days(self.end()) / (self.points.len() - 1) as f64
    }
}

/// Khoảng ngày đóng `[start, end]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Cửa sổ `days` ngày kết thúc tại `end`.
    pub fn trailing(end: NaiveDate, days: i64) -> Self {
        Self::new(end - Duration::days(days), end)
    }

    /// Nới rộng đối xứng thêm `days` ngày mỗi phía.
    pub fn widened(self, days: i64) -> Self {
        Self::new(
            self.start - Duration::days(days),
            self.end + Duration::days(days),
        )
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Lọc theo khoảng tùy chọn; `None` nghĩa là không giới hạn.
pub fn within(range: Option<DateRange>, date: NaiveDate) -> bool {
    range.map_or(true, |r| r.contains(date))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn grid_is_strictly_increasing_and_inclusive() {
        let grid = TimeGrid::build(at(2000, 1, 1), at(2020, 1, 1), 100).unwrap();
        assert_eq!(grid.len(), 100);
        assert_eq!(grid.start(), at(2000, 1, 1));
        assert_eq!(grid.end(), at(2020, 1, 1));
        assert!(grid.points().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn grid_rejects_epoch_after_now() {
        let err = TimeGrid::build(at(2021, 1, 1), at(2020, 1, 1), 10).unwrap_err();
        assert!(matches!(err, ChartError::InvalidGrid { .. }));
    }

    #[test]
    fn small_grids() {
        assert!(TimeGrid::build(at(2000, 1, 1), at(2001, 1, 1), 0)
            .unwrap()
            .is_empty());
        let single = TimeGrid::build(at(2000, 1, 1), at(2001, 1, 1), 1).unwrap();
        assert_eq!(single.points(), &[at(2000, 1, 1)]);
        assert_eq!(single.step_days(), 0.0);
    }

    #[test]
    fn offsets_measure_days_from_start() {
        let grid = TimeGrid::build(at(2000, 1, 1), at(2000, 1, 11), 11).unwrap();
        assert_eq!(grid.step_days(), 1.0);
        assert_eq!(grid.offsets()[10], 10.0);
        assert_eq!(grid.range().end, NaiveDate::from_ymd_opt(2000, 1, 11).unwrap());
    }

    #[test]
    fn date_range_windows() {
        let end = NaiveDate::from_ymd_opt(2020, 3, 10).unwrap();
        let week = DateRange::trailing(end, 7);
        assert!(week.contains(NaiveDate::from_ymd_opt(2020, 3, 3).unwrap()));
        assert!(!week.contains(NaiveDate::from_ymd_opt(2020, 3, 2).unwrap()));
        let wide = DateRange::new(end, end).widened(2);
        assert!(wide.contains(NaiveDate::from_ymd_opt(2020, 3, 12).unwrap()));
        assert!(within(None, end));
    }
}

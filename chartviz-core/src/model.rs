//! Mô hình dữ liệu: sự kiện lâm sàng, danh mục mã và các dòng truy vấn đã chuẩn hóa.

use std::fmt;
use std::sync::LazyLock;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Định danh bệnh nhân.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PatientId(pub u64);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Loại sự kiện lâm sàng.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    #[serde(rename = "ICD")]
    Icd,
    #[serde(rename = "LAB")]
    Lab,
    #[serde(rename = "MED")]
    Med,
    #[serde(rename = "CPT")]
    Cpt,
    #[serde(rename = "VITAL")]
    Vital,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Icd => "ICD",
            EventKind::Lab => "LAB",
            EventKind::Med => "MED",
            EventKind::Cpt => "CPT",
            EventKind::Vital => "VITAL",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Một sự kiện bất biến trong lịch sử bệnh nhân.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub patient_id: PatientId,
    pub kind: EventKind,
    pub code: String,
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

// Danh mục mã tham chiếu

/// Chương ICD (nhóm cao nhất của phecode).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub first_parent: Option<String>,
    #[serde(default)]
    pub last_parent: Option<String>,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phecode {
    pub code: String,
    pub description: String,
}

/// Mã chẩn đoán ICD cùng tham chiếu tới phecode và chương.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcdCode {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub phecode: Option<String>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub rank: Option<i64>,
}

impl IcdCode {
    /// Mã cha cấp cao nhất (phần trước dấu chấm đầu tiên).
    pub fn parent(&self) -> &str {
        icd_parent(&self.code)
    }
}

pub fn icd_parent(code: &str) -> &str {
    code.split('.').next().unwrap_or(code)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabCode {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CptCode {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
}

/// Toàn bộ danh mục mã, chỉ đọc.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TaxonomyCatalog {
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub phecodes: Vec<Phecode>,
    #[serde(default)]
    pub icds: Vec<IcdCode>,
    #[serde(default)]
    pub labs: Vec<LabCode>,
    #[serde(default)]
    pub cpts: Vec<CptCode>,
}

/// Dải bách phân vị của một mã xét nghiệm, tính trên toàn bộ dữ liệu.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct PercentileBand {
    #[serde(default)]
    pub perc_10: Option<f64>,
    #[serde(default)]
    pub perc_25: Option<f64>,
    #[serde(default)]
    pub perc_50: Option<f64>,
    #[serde(default)]
    pub perc_75: Option<f64>,
    #[serde(default)]
    pub perc_90: Option<f64>,
}

impl PercentileBand {
    pub fn new(p10: f64, p25: f64, p50: f64, p75: f64, p90: f64) -> Self {
        Self {
            perc_10: Some(p10),
            perc_25: Some(p25),
            perc_50: Some(p50),
            perc_75: Some(p75),
            perc_90: Some(p90),
        }
    }

    pub fn values(&self) -> [Option<f64>; 5] {
        [
            self.perc_10,
            self.perc_25,
            self.perc_50,
            self.perc_75,
            self.perc_90,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.values().iter().all(Option::is_none)
    }

    /// Các giá trị có mặt phải không giảm theo thứ tự p10..p90.
    pub fn is_ordered(&self) -> bool {
        let present: Vec<f64> = self.values().into_iter().flatten().collect();
        present.windows(2).all(|pair| pair[0] <= pair[1])
    }

    /// Bỏ các giá trị vô cực; dải không đơn điệu bị loại bỏ hoàn toàn.
    pub fn normalized(&self) -> Self {
        let band = Self {
            perc_10: finite(self.perc_10),
            perc_25: finite(self.perc_25),
            perc_50: finite(self.perc_50),
            perc_75: finite(self.perc_75),
            perc_90: finite(self.perc_90),
        };
        if band.is_ordered() {
            band
        } else {
            tracing::warn!(?band, "Bỏ dải bách phân vị không đơn điệu");
            Self::default()
        }
    }

    /// Bách phân vị rời rạc: giá trị nhỏ nhất có tỷ lệ tích lũy đạt p.
    pub fn discrete(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let pick = |p: f64| {
            let rank = (p * n as f64 - 1e-9).ceil().max(1.0) as usize;
            Some(sorted[rank.min(n) - 1])
        };
        Self {
            perc_10: pick(0.10),
            perc_25: pick(0.25),
            perc_50: pick(0.50),
            perc_75: pick(0.75),
            perc_90: pick(0.90),
        }
    }
}

/// Giá trị ±vô cực (giá trị canh gác từ kho dữ liệu) được coi là vắng mặt.
pub fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

// Hồ sơ bệnh nhân (tài liệu nguồn)

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcdInstance {
    pub code: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabInstance {
    pub code: String,
    pub datetime: NaiveDateTime,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub normal_min: Option<f64>,
    #[serde(default)]
    pub normal_max: Option<f64>,
    #[serde(default)]
    pub percentiles: Option<PercentileBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CptInstance {
    pub code: String,
    pub date: NaiveDate,
}

/// Một lần dùng thuốc. `description` và `strength_num` là cột tính toán.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Medication {
    pub date: NaiveDate,
    pub name: String,
    pub strength: String,
    pub route: String,
    pub frequency: String,
    #[serde(default)]
    pub dose: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub strength_num: Option<f64>,
}

static STRENGTH_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.?\d*").expect("biểu thức hằng hợp lệ"));

impl Medication {
    /// Điền các cột tính toán còn thiếu.
    pub fn fill_computed(&mut self) {
        if self.description.is_none() {
            self.description = Some(format!(
                "{} {} {} {}",
                self.name, self.strength, self.route, self.frequency
            ));
        }
        if self.strength_num.is_none() {
            self.strength_num = parse_strength_num(&self.strength);
        }
    }
}

/// Số thập phân đầu tiên trong chuỗi hàm lượng, ví dụ `"12.5 mg"` -> `12.5`.
pub fn parse_strength_num(strength: &str) -> Option<f64> {
    STRENGTH_NUMBER
        .find(strength)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HeartRateKind {
    Pulse,
    RespRt,
}

impl HeartRateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartRateKind::Pulse => "Pulse",
            HeartRateKind::RespRt => "RespRt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartRate {
    pub entry_date: NaiveDateTime,
    pub name: HeartRateKind,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bmi {
    pub weight: f64,
    pub weight_date: NaiveDateTime,
    pub height: f64,
    pub height_date: NaiveDateTime,
    pub bmi: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodPressure {
    pub entry_date: NaiveDateTime,
    pub value: String,
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    pub systolic: i64,
    pub diastolic: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClinicalNote {
    pub date: NaiveDate,
    pub doc_type: String,
    pub sub_type: String,
    #[serde(default)]
    pub content: String,
}

/// Hồ sơ đầy đủ của một bệnh nhân như kho dữ liệu cung cấp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientHistory {
    pub id: PatientId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub mrn: String,
    #[serde(default)]
    pub birthdate: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default)]
    pub icds: Vec<IcdInstance>,
    #[serde(default)]
    pub labs: Vec<LabInstance>,
    #[serde(default)]
    pub cpts: Vec<CptInstance>,
    #[serde(default)]
    pub meds: Vec<Medication>,
    #[serde(default)]
    pub heart_rates: Vec<HeartRate>,
    #[serde(default)]
    pub bmis: Vec<Bmi>,
    #[serde(default)]
    pub blood_pressures: Vec<BloodPressure>,
    #[serde(default)]
    pub notes: Vec<ClinicalNote>,
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

impl PatientHistory {
    /// Trải phẳng mọi bản ghi thành dạng sự kiện chung.
    pub fn events(&self) -> Vec<Event> {
        let id = self.id;
        let event = |kind, code: &str, timestamp, value, unit: Option<&str>| Event {
            patient_id: id,
            kind,
            code: code.to_string(),
            timestamp,
            value,
            unit: unit.map(str::to_string),
        };

        let mut events = Vec::new();
        events.extend(
            self.icds
                .iter()
                .map(|i| event(EventKind::Icd, &i.code, midnight(i.date), None, None)),
        );
        events.extend(self.labs.iter().map(|l| {
            event(
                EventKind::Lab,
                &l.code,
                l.datetime,
                finite(l.value),
                Some(l.unit.as_str()),
            )
        }));
        events.extend(self.meds.iter().map(|m| {
            event(
                EventKind::Med,
                &m.name,
                midnight(m.date),
                m.strength_num,
                None,
            )
        }));
        events.extend(
            self.cpts
                .iter()
                .map(|c| event(EventKind::Cpt, &c.code, midnight(c.date), None, None)),
        );
        events.extend(self.heart_rates.iter().map(|hr| {
            event(
                EventKind::Vital,
                hr.name.as_str(),
                hr.entry_date,
                Some(hr.value as f64),
                Some("BPM"),
            )
        }));
        events.extend(
            self.bmis
                .iter()
                .map(|b| event(EventKind::Vital, "BMI", b.weight_date, Some(b.bmi), None)),
        );
        events.extend(self.blood_pressures.iter().map(|bp| {
            event(
                EventKind::Vital,
                "BP",
                bp.entry_date,
                Some(bp.systolic as f64),
                Some("mmHg"),
            )
        }));
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Ngày hoạt động gần nhất trên mọi loại bản ghi (kể cả ghi chú).
    pub fn latest_activity(&self) -> Option<NaiveDate> {
        let from_events = self.events().last().map(|e| e.timestamp.date());
        let from_notes = self.notes.iter().map(|n| n.date).max();
        from_events.max(from_notes)
    }

    /// Dời mọi ngày trong hồ sơ thêm `days` ngày.
    pub fn shift_dates(&mut self, days: i64) {
        let offset = Duration::days(days);
        self.icds.iter_mut().for_each(|i| i.date += offset);
        self.labs.iter_mut().for_each(|l| l.datetime += offset);
        self.cpts.iter_mut().for_each(|c| c.date += offset);
        self.meds.iter_mut().for_each(|m| m.date += offset);
        self.notes.iter_mut().for_each(|n| n.date += offset);
        self.heart_rates
            .iter_mut()
            .for_each(|hr| hr.entry_date += offset);
        self.bmis.iter_mut().for_each(|b| {
            b.weight_date += offset;
            b.height_date += offset;
        });
        self.blood_pressures
            .iter_mut()
            .for_each(|bp| bp.entry_date += offset);
    }

    /// Dời hồ sơ để hoạt động gần nhất rơi vào `today`.
    ///
    /// Trả về số ngày đã dời, hoặc `None` khi hồ sơ trống hay đủ mới.
    pub fn dateshift(&mut self, today: NaiveDate, min_offset_days: i64) -> Option<i64> {
        let latest = self.latest_activity()?;
        let offset = (today - latest).num_days();
        if offset < min_offset_days {
            tracing::debug!(patient = %self.id, offset, "Hồ sơ đủ mới, không dời ngày");
            return None;
        }
        self.shift_dates(offset);
        tracing::info!(patient = %self.id, offset, "Đã dời ngày hồ sơ");
        Some(offset)
    }
}

// Dòng truy vấn đã chuẩn hóa

/// Phecode gắn với một dòng ICD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhecodeRef {
    pub code: String,
    pub description: String,
}

/// Sự kiện ICD đã nối với danh mục.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcdRow {
    pub date: NaiveDate,
    pub code: String,
    pub description: String,
    pub phecode: Option<PhecodeRef>,
    pub chapter: Option<String>,
}

/// Kết quả xét nghiệm đã nối với danh mục.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabRow {
    pub code: String,
    pub description: String,
    pub datetime: NaiveDateTime,
    pub value: Option<f64>,
    pub unit: String,
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
    pub band: PercentileBand,
}

/// Thủ thuật CPT đã nối với danh mục.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CptRow {
    pub date: NaiveDate,
    pub code: String,
    pub description: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn history() -> PatientHistory {
        PatientHistory {
            id: PatientId(7),
            first_name: "An".into(),
            last_name: "Nguyen".into(),
            mrn: "MRN7".into(),
            birthdate: None,
            gender: None,
            is_sample: true,
            icds: vec![IcdInstance {
                code: "250.00".into(),
                date: date(2019, 3, 1),
            }],
            labs: vec![LabInstance {
                code: "Na".into(),
                datetime: date(2019, 5, 2).and_hms_opt(8, 30, 0).unwrap(),
                value: Some(f64::INFINITY),
                unit: "mmol/L".into(),
                normal_min: None,
                normal_max: None,
                percentiles: None,
            }],
            cpts: Vec::new(),
            meds: Vec::new(),
            heart_rates: Vec::new(),
            bmis: Vec::new(),
            blood_pressures: Vec::new(),
            notes: vec![ClinicalNote {
                date: date(2019, 6, 1),
                doc_type: "HP".into(),
                sub_type: "Admission".into(),
                content: String::new(),
            }],
        }
    }

    #[test]
    fn icd_parent_strips_after_first_dot() {
        assert_eq!(icd_parent("250.01"), "250");
        assert_eq!(icd_parent("V58.67.1"), "V58");
        assert_eq!(icd_parent("401"), "401");
    }

    #[test]
    fn medication_computed_columns() {
        let mut med = Medication {
            date: date(2020, 1, 1),
            name: "metformin".into(),
            strength: "500.5 mg".into(),
            route: "oral".into(),
            frequency: "BID".into(),
            dose: None,
            duration: None,
            description: None,
            strength_num: None,
        };
        med.fill_computed();
        assert_eq!(med.description.as_deref(), Some("metformin 500.5 mg oral BID"));
        assert_eq!(med.strength_num, Some(500.5));
        assert_eq!(parse_strength_num("as directed"), None);
    }

    #[test]
    fn discrete_percentiles_follow_cumulative_share() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let band = PercentileBand::discrete(&values);
        assert_eq!(band, PercentileBand::new(1.0, 3.0, 5.0, 8.0, 9.0));
        assert!(PercentileBand::discrete(&[f64::NAN, f64::INFINITY]).is_empty());
    }

    #[test]
    fn normalized_band_drops_infinities_and_disorder() {
        let band = PercentileBand {
            perc_10: Some(f64::NEG_INFINITY),
            ..PercentileBand::new(0.0, 1.0, 2.0, 3.0, f64::INFINITY)
        };
        let normalized = band.normalized();
        assert_eq!(normalized.perc_10, None);
        assert_eq!(normalized.perc_90, None);
        assert_eq!(normalized.perc_50, Some(2.0));

        let disordered = PercentileBand::new(5.0, 4.0, 3.0, 2.0, 1.0);
        assert!(disordered.normalized().is_empty());
    }

    #[test]
    fn events_hide_infinite_values() {
        let events = history().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Lab);
        assert_eq!(events[1].value, None);
    }

    #[test]
    fn dateshift_moves_latest_activity_to_today() {
        let mut patient = history();
        let today = date(2024, 6, 1);
        let offset = patient.dateshift(today, 30).expect("cần dời ngày");
        assert_eq!(offset, (today - date(2019, 6, 1)).num_days());
        assert_eq!(patient.latest_activity(), Some(today));
        assert_eq!(patient.icds[0].date, date(2019, 3, 1) + Duration::days(offset));

        assert_eq!(patient.dateshift(today, 30), None);
    }
}

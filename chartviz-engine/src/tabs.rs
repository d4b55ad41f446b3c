//! Per-view assembly of dashboard payloads, plus request dispatch for the outer surfaces.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chartviz_core::{
    ChartError, DateRange, EngineConfig, EventKind, HeartRateKind, IntensityCurve, PatientId,
    Phecode, TimeGrid,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingIndex;
use crate::problems::{problem_list, Problem};
use crate::relevance::RelevanceExpander;
use crate::rollup::{
    rollup_chapters, rollup_cpts, rollup_labs, rollup_meds, ChapterRollup, CptRollup, LabRollup,
    MedRollup,
};
use crate::store::{HistoryStore, TaxonomyStore};

/// A tab payload with the shared time grid alongside.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Tab<T> {
    #[serde(flatten)]
    pub body: T,
    pub dategrid: TimeGrid,
}

/// Most recent vital readings. Missing readings serialize as `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LatestVitals {
    pub weight: Option<f64>,
    pub weight_date: Option<NaiveDateTime>,
    pub height: Option<f64>,
    pub height_date: Option<NaiveDateTime>,
    pub bmi: Option<f64>,
    pub pulse: Option<i64>,
    pub pulse_date: Option<NaiveDateTime>,
    pub resp: Option<i64>,
    pub resp_date: Option<NaiveDateTime>,
    pub blood_pressure: Option<String>,
    pub bp_date: Option<NaiveDateTime>,
    pub bp_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Overview {
    pub phecodes: Vec<Problem>,
    pub labs: LabRollup,
    pub lab_range: Option<DateRange>,
    pub meds: Vec<MedRollup>,
    pub med_range: Option<DateRange>,
    pub vitals: LatestVitals,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Systems {
    pub chapters: Vec<ChapterRollup>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Labs {
    pub labs: LabRollup,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Meds {
    pub meds: Vec<MedRollup>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Cpts {
    pub cpts: Vec<CptRollup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VitalPoint {
    pub date: NaiveDateTime,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodPressurePoint {
    pub date: NaiveDateTime,
    pub status: String,
    pub systolic: i64,
    pub diastolic: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BmiPoint {
    pub date: NaiveDateTime,
    pub value: f64,
    pub weight_date: NaiveDateTime,
    pub weight: f64,
    pub height_date: NaiveDateTime,
    pub height: f64,
}

/// Full vital series, each ordered by date.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vitals {
    pub heart_rate: Vec<VitalPoint>,
    pub respiratory_rate: Vec<VitalPoint>,
    pub blood_pressure: Vec<BloodPressurePoint>,
    pub bmi: Vec<BmiPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteRef {
    pub date: NaiveDate,
    pub doc_type: String,
    pub sub_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notes {
    pub notes: Vec<NoteRef>,
}

/// An ICD code shown on the condition tab with its dates and relevance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelatedIcd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phecode: Option<String>,
    pub code: String,
    pub description: String,
    pub dates: Vec<NaiveDate>,
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Condition {
    pub phecode: Phecode,
    pub base_icds: Vec<RelatedIcd>,
    pub intensity: IntensityCurve,
    pub labs: LabRollup,
    pub meds: Vec<MedRollup>,
    pub extra_icds: Vec<RelatedIcd>,
}

/// A tab request as sent by the wasm bridge or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tab", rename_all = "snake_case")]
pub enum TabRequest {
    Overview {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Systems {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Labs {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Meds {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Cpts {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Vitals {
        patient_id: PatientId,
        today: NaiveDate,
    },
    Notes {
        patient_id: PatientId,
        today: NaiveDate,
        date: NaiveDate,
    },
    Condition {
        patient_id: PatientId,
        today: NaiveDate,
        phecode: String,
        #[serde(default)]
        relevance: Option<f64>,
    },
}

/// Assembles every dashboard tab from the stores and the embedding index.
pub struct Dashboard {
    history: Arc<dyn HistoryStore>,
    taxonomy: Arc<dyn TaxonomyStore>,
    expander: RelevanceExpander,
    config: EngineConfig,
}

impl Dashboard {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        taxonomy: Arc<dyn TaxonomyStore>,
        index: Arc<dyn EmbeddingIndex>,
        config: EngineConfig,
    ) -> Self {
        let expander = RelevanceExpander::new(index, Arc::clone(&taxonomy), &config);
        Self {
            history,
            taxonomy,
            expander,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn expander(&self) -> &RelevanceExpander {
        &self.expander
    }

    fn wrap<T>(body: T, grid: TimeGrid) -> Tab<T> {
        Tab {
            body,
            dategrid: grid,
        }
    }

    pub fn overview(
        &self,
        patient: PatientId,
        today: NaiveDate,
    ) -> Result<Tab<Overview>, ChartError> {
        let grid = self.config.grid(today)?;
        let window = self.config.recent_window_days;

        let icds = self.history.icd_rows(patient, Some(grid.range()))?;
        let phecodes = problem_list(
            &icds,
            &grid,
            &self.config.estimator(),
            self.config.final_intensity_cutoff,
        )?;

        let med_range = self
            .history
            .latest_med_date(patient)?
            .map(|latest| DateRange::trailing(latest, window));
        let meds = match med_range {
            Some(range) => rollup_meds(&self.history.med_rows(patient, Some(range))?),
            None => Vec::new(),
        };

        // Recent lab codes are shown with their whole history.
        let lab_range = self
            .history
            .latest_lab_datetime(patient)?
            .map(|latest| DateRange::trailing(latest.date(), window));
        let labs = match lab_range {
            Some(range) => {
                let recent: BTreeSet<String> = self
                    .history
                    .lab_rows(patient, Some(range))?
                    .into_iter()
                    .map(|row| row.code)
                    .collect();
                let rows: Vec<_> = self
                    .history
                    .lab_rows(patient, None)?
                    .into_iter()
                    .filter(|row| recent.contains(&row.code))
                    .collect();
                rollup_labs(&rows, &self.config.chem_panel, &self.config.cbc_panel)
            }
            None => rollup_labs(&[], &self.config.chem_panel, &self.config.cbc_panel),
        };

        let vitals = self.latest_vitals(patient)?;
        tracing::debug!(
            %patient,
            problems = phecodes.len(),
            meds = meds.len(),
            "Assembled overview"
        );
        Ok(Self::wrap(
            Overview {
                phecodes,
                labs,
                lab_range,
                meds,
                med_range,
                vitals,
            },
            grid,
        ))
    }

    fn latest_vitals(&self, patient: PatientId) -> Result<LatestVitals, ChartError> {
        let mut vitals = LatestVitals::default();
        if let Some(bmi) = self.history.latest_bmi(patient)? {
            vitals.weight = Some(bmi.weight);
            vitals.weight_date = Some(bmi.weight_date);
            vitals.height = Some(bmi.height);
            vitals.height_date = Some(bmi.height_date);
            vitals.bmi = Some(bmi.bmi);
        }
        if let Some(pulse) = self.history.latest_heart_rate(patient, HeartRateKind::Pulse)? {
            vitals.pulse = Some(pulse.value);
            vitals.pulse_date = Some(pulse.entry_date);
        }
        if let Some(resp) = self.history.latest_heart_rate(patient, HeartRateKind::RespRt)? {
            vitals.resp = Some(resp.value);
            vitals.resp_date = Some(resp.entry_date);
        }
        if let Some(bp) = self.history.latest_blood_pressure(patient)? {
            vitals.blood_pressure = Some(bp.value);
            vitals.bp_date = Some(bp.entry_date);
            vitals.bp_status = Some(bp.status);
        }
        Ok(vitals)
    }

    pub fn systems(
        &self,
        patient: PatientId,
        today: NaiveDate,
    ) -> Result<Tab<Systems>, ChartError> {
        let grid = self.config.grid(today)?;
        let rows = self.history.icd_rows(patient, Some(grid.range()))?;
        let chapters = rollup_chapters(
            &rows,
            &self.taxonomy.chapters()?,
            &self.config.excluded_chapter,
            &grid,
            &self.config.estimator(),
        )?;
        Ok(Self::wrap(Systems { chapters }, grid))
    }

    pub fn labs(&self, patient: PatientId, today: NaiveDate) -> Result<Tab<Labs>, ChartError> {
        let grid = self.config.grid(today)?;
        let rows = self.history.lab_rows(patient, Some(grid.range()))?;
        let labs = rollup_labs(&rows, &self.config.chem_panel, &self.config.cbc_panel);
        Ok(Self::wrap(Labs { labs }, grid))
    }

    pub fn meds(&self, patient: PatientId, today: NaiveDate) -> Result<Tab<Meds>, ChartError> {
        let grid = self.config.grid(today)?;
        let meds = rollup_meds(&self.history.med_rows(patient, Some(grid.range()))?);
        Ok(Self::wrap(Meds { meds }, grid))
    }

    pub fn cpts(&self, patient: PatientId, today: NaiveDate) -> Result<Tab<Cpts>, ChartError> {
        let grid = self.config.grid(today)?;
        let cpts = rollup_cpts(&self.history.cpt_rows(patient, Some(grid.range()))?);
        Ok(Self::wrap(Cpts { cpts }, grid))
    }

    pub fn vitals(&self, patient: PatientId, today: NaiveDate) -> Result<Tab<Vitals>, ChartError> {
        let grid = self.config.grid(today)?;
        let records = self.history.vitals(patient)?;
        let series = |kind: HeartRateKind| {
            records
                .heart_rates
                .iter()
                .filter(|hr| hr.name == kind)
                .map(|hr| VitalPoint {
                    date: hr.entry_date,
                    value: hr.value,
                })
                .collect::<Vec<_>>()
        };
        let vitals = Vitals {
            heart_rate: series(HeartRateKind::Pulse),
            respiratory_rate: series(HeartRateKind::RespRt),
            blood_pressure: records
                .blood_pressures
                .iter()
                .map(|bp| BloodPressurePoint {
                    date: bp.entry_date,
                    status: bp.status.clone(),
                    systolic: bp.systolic,
                    diastolic: bp.diastolic,
                })
                .collect(),
            bmi: records
                .bmis
                .iter()
                .map(|b| BmiPoint {
                    date: b.weight_date,
                    value: b.bmi,
                    weight_date: b.weight_date,
                    weight: b.weight,
                    height_date: b.height_date,
                    height: b.height,
                })
                .collect(),
        };
        Ok(Self::wrap(vitals, grid))
    }

    /// Notes on `date`, or in the nearest symmetric window around it that has any.
    pub fn notes(
        &self,
        patient: PatientId,
        today: NaiveDate,
        date: NaiveDate,
    ) -> Result<Tab<Notes>, ChartError> {
        let grid = self.config.grid(today)?;
        let exact = DateRange::new(date, date);
        let mut notes = self.history.notes(patient, exact)?;
        for radius in 1..=self.config.note_search_radius_days {
            if !notes.is_empty() {
                break;
            }
            notes = self.history.notes(patient, exact.widened(radius))?;
        }
        let notes = notes
            .into_iter()
            .map(|note| NoteRef {
                date: note.date,
                doc_type: note.doc_type,
                sub_type: note.sub_type,
            })
            .collect();
        Ok(Self::wrap(Notes { notes }, grid))
    }

    /// Everything shown for one phecode: its ICD codes and what the embedding relates to them.
    ///
    /// `threshold` defaults to `relevance_threshold` from the config.
    pub fn condition(
        &self,
        patient: PatientId,
        today: NaiveDate,
        phecode: &str,
        threshold: Option<f64>,
    ) -> Result<Tab<Condition>, ChartError> {
        let grid = self.config.grid(today)?;
        let range = Some(grid.range());
        let threshold = threshold.unwrap_or(self.config.relevance_threshold);
        let phecode = self
            .taxonomy
            .phecode(phecode)?
            .ok_or_else(|| ChartError::UnknownPhecode(phecode.to_string()))?;

        let icd_rows = self.history.icd_rows(patient, range)?;
        let mut base: BTreeMap<(&str, &str), BTreeSet<NaiveDate>> = BTreeMap::new();
        for row in &icd_rows {
            if row.phecode.as_ref().is_some_and(|p| p.code == phecode.code) {
                base.entry((row.code.as_str(), row.description.as_str()))
                    .or_default()
                    .insert(row.date);
            }
        }
        let base_codes: BTreeSet<&str> = base.keys().map(|(code, _)| *code).collect();
        let base_dates: BTreeSet<NaiveDate> = base.values().flatten().copied().collect();
        let intensity = self.config.estimator().estimate(base_dates, &grid);

        let expansion = self.expander.expand(base_codes.iter().copied(), threshold)?;

        let lab_codes = expansion.codes_of(EventKind::Lab);
        let lab_rows: Vec<_> = self
            .history
            .lab_rows(patient, range)?
            .into_iter()
            .filter(|row| lab_codes.contains(&row.code))
            .collect();
        let mut labs = rollup_labs(&lab_rows, &self.config.chem_panel, &self.config.cbc_panel);
        for group in labs.groups_mut() {
            group.relevance = Some(expansion.score(&group.code));
        }

        let med_names = expansion.codes_of(EventKind::Med);
        let med_rows: Vec<_> = self
            .history
            .med_rows(patient, range)?
            .into_iter()
            .filter(|row| med_names.contains(&row.name))
            .collect();
        let mut meds = rollup_meds(&med_rows);
        for med in &mut meds {
            med.relevance = Some(expansion.score(&med.name));
        }

        let extra_codes = expansion.codes_of(EventKind::Icd);
        let mut extras: BTreeMap<(&str, &str, &str), BTreeSet<NaiveDate>> = BTreeMap::new();
        for row in &icd_rows {
            let Some(phecode_ref) = row.phecode.as_ref() else {
                continue;
            };
            if extra_codes.contains(&row.code) && !base_codes.contains(row.code.as_str()) {
                extras
                    .entry((
                        phecode_ref.code.as_str(),
                        row.code.as_str(),
                        row.description.as_str(),
                    ))
                    .or_default()
                    .insert(row.date);
            }
        }

        let base_icds = base
            .into_iter()
            .map(|((code, description), dates)| RelatedIcd {
                phecode: None,
                code: code.to_string(),
                description: description.to_string(),
                dates: dates.into_iter().collect(),
                relevance: 1.0,
            })
            .collect();
        let extra_icds = extras
            .into_iter()
            .map(|((phecode, code, description), dates)| RelatedIcd {
                phecode: Some(phecode.to_string()),
                code: code.to_string(),
                description: description.to_string(),
                dates: dates.into_iter().collect(),
                relevance: expansion.score(code),
            })
            .collect();

        tracing::debug!(
            %patient,
            phecode = %phecode.code,
            threshold,
            labs = lab_rows.len(),
            meds = med_rows.len(),
            "Assembled condition tab"
        );
        Ok(Self::wrap(
            Condition {
                phecode,
                base_icds,
                intensity,
                labs,
                meds,
                extra_icds,
            },
            grid,
        ))
    }

    /// Render one request to JSON.
    ///
    /// Condition requests without a threshold use `api_relevance_threshold`.
    pub fn render(&self, request: &TabRequest) -> Result<serde_json::Value, ChartError> {
        match request {
            TabRequest::Overview { patient_id, today } => {
                to_json(&self.overview(*patient_id, *today)?)
            }
            TabRequest::Systems { patient_id, today } => {
                to_json(&self.systems(*patient_id, *today)?)
            }
            TabRequest::Labs { patient_id, today } => {
                to_json(&self.labs(*patient_id, *today)?)
            }
            TabRequest::Meds { patient_id, today } => {
                to_json(&self.meds(*patient_id, *today)?)
            }
            TabRequest::Cpts { patient_id, today } => {
                to_json(&self.cpts(*patient_id, *today)?)
            }
            TabRequest::Vitals { patient_id, today } => {
                to_json(&self.vitals(*patient_id, *today)?)
            }
            TabRequest::Notes {
                patient_id,
                today,
                date,
            } => to_json(&self.notes(*patient_id, *today, *date)?),
            TabRequest::Condition {
                patient_id,
                today,
                phecode,
                relevance,
            } => {
                let threshold = relevance.unwrap_or(self.config.api_relevance_threshold);
                to_json(&self.condition(*patient_id, *today, phecode, Some(threshold))?)
            }
        }
    }
}

fn to_json<T: Serialize>(tab: &T) -> Result<serde_json::Value, ChartError> {
    serde_json::to_value(tab).map_err(|err| ChartError::Parse(err.to_string()))
}

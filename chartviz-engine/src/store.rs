//! Read seams for the patient history and taxonomy stores, plus an in-memory implementation
//! loaded from JSON documents.

use std::collections::{BTreeMap, HashMap};

use chartviz_core::{
    within, BloodPressure, Bmi, ChartError, Chapter, ClinicalNote, CptCode, CptRow, DateRange,
    EventKind, HeartRate, HeartRateKind, IcdCode, IcdRow, LabCode, LabRow, Medication,
    PatientHistory, PatientId, PercentileBand, Phecode, PhecodeRef, TaxonomyCatalog,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Typed, per-patient reads. Every batch is returned in full.
pub trait HistoryStore: Send + Sync {
    fn icd_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<IcdRow>, ChartError>;

    fn lab_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<LabRow>, ChartError>;

    fn med_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<Medication>, ChartError>;

    fn cpt_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<CptRow>, ChartError>;

    fn latest_med_date(&self, patient: PatientId) -> Result<Option<NaiveDate>, ChartError>;

    fn latest_lab_datetime(&self, patient: PatientId)
        -> Result<Option<NaiveDateTime>, ChartError>;

    fn latest_bmi(&self, patient: PatientId) -> Result<Option<Bmi>, ChartError>;

    fn latest_heart_rate(
        &self,
        patient: PatientId,
        kind: HeartRateKind,
    ) -> Result<Option<HeartRate>, ChartError>;

    fn latest_blood_pressure(&self, patient: PatientId)
        -> Result<Option<BloodPressure>, ChartError>;

    /// Every vital reading, each list sorted by its entry date.
    fn vitals(&self, patient: PatientId) -> Result<VitalRecords, ChartError>;

    fn notes(&self, patient: PatientId, range: DateRange)
        -> Result<Vec<ClinicalNote>, ChartError>;
}

/// Read-only reference taxonomy.
pub trait TaxonomyStore: Send + Sync {
    fn chapters(&self) -> Result<Vec<Chapter>, ChartError>;

    fn phecode(&self, code: &str) -> Result<Option<Phecode>, ChartError>;

    /// ICD codes under `parent` with a rank, ascending by rank.
    fn ranked_icds_with_parent(&self, parent: &str) -> Result<Vec<IcdCode>, ChartError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VitalRecords {
    pub heart_rates: Vec<HeartRate>,
    pub bmis: Vec<Bmi>,
    pub blood_pressures: Vec<BloodPressure>,
}

#[derive(Debug, Default)]
struct PatientRecord {
    icds: Vec<IcdRow>,
    labs: Vec<LabRow>,
    meds: Vec<Medication>,
    cpts: Vec<CptRow>,
    vitals: VitalRecords,
    notes: Vec<ClinicalNote>,
}

/// History and taxonomy held in memory, joined once at load time.
#[derive(Debug)]
pub struct MemoryStore {
    taxonomy: TaxonomyCatalog,
    phecodes: HashMap<String, usize>,
    patients: BTreeMap<PatientId, PatientRecord>,
}

impl MemoryStore {
    pub fn new(
        taxonomy: TaxonomyCatalog,
        histories: Vec<PatientHistory>,
    ) -> Result<Self, ChartError> {
        let phecodes = index_by_code(&taxonomy.phecodes, |p| &p.code);
        let icds = index_by_code(&taxonomy.icds, |i| &i.code);
        let labs = index_by_code(&taxonomy.labs, |l| &l.code);
        let cpts = index_by_code(&taxonomy.cpts, |c| &c.code);
        let bands = code_bands(&histories);

        let mut patients = BTreeMap::new();
        for history in histories {
            let id = history.id;
            if patients.contains_key(&id) {
                return Err(ChartError::Store(format!("duplicate patient {id}")));
            }

            let mut record = PatientRecord::default();
            for instance in &history.icds {
                let icd: &IcdCode = lookup(&taxonomy.icds, &icds, EventKind::Icd, &instance.code)?;
                let phecode = match &icd.phecode {
                    Some(code) => {
                        let idx = phecodes
                            .get(code)
                            .ok_or_else(|| ChartError::UnknownPhecode(code.clone()))?;
                        let phecode = &taxonomy.phecodes[*idx];
                        Some(PhecodeRef {
                            code: phecode.code.clone(),
                            description: phecode.description.clone(),
                        })
                    }
                    None => None,
                };
                record.icds.push(IcdRow {
                    date: instance.date,
                    code: icd.code.clone(),
                    description: icd.description.clone(),
                    phecode,
                    chapter: icd.chapter.clone(),
                });
            }

            for instance in &history.labs {
                let lab: &LabCode = lookup(&taxonomy.labs, &labs, EventKind::Lab, &instance.code)?;
                let band = bands.get(&lab.code).copied().unwrap_or_default();
                record.labs.push(LabRow {
                    code: lab.code.clone(),
                    description: lab.description.clone(),
                    datetime: instance.datetime,
                    value: instance.value,
                    unit: instance.unit.clone(),
                    normal_min: instance.normal_min,
                    normal_max: instance.normal_max,
                    band,
                });
            }

            for instance in &history.cpts {
                let cpt: &CptCode = lookup(&taxonomy.cpts, &cpts, EventKind::Cpt, &instance.code)?;
                record.cpts.push(CptRow {
                    date: instance.date,
                    code: cpt.code.clone(),
                    description: cpt.description.clone(),
                    category: cpt.category.clone(),
                    subcategory: cpt.subcategory.clone(),
                });
            }

            record.meds = history.meds.clone();
            record.meds.iter_mut().for_each(Medication::fill_computed);

            record.vitals = VitalRecords {
                heart_rates: history.heart_rates.clone(),
                bmis: history.bmis.clone(),
                blood_pressures: history.blood_pressures.clone(),
            };
            record.vitals.heart_rates.sort_by_key(|hr| hr.entry_date);
            record
                .vitals
                .bmis
                .sort_by_key(|b| (b.weight_date, b.height_date));
            record
                .vitals
                .blood_pressures
                .sort_by_key(|bp| bp.entry_date);
            record.notes = history.notes.clone();
            record.notes.sort_by_key(|n| n.date);

            patients.insert(id, record);
        }

        tracing::info!(
            patients = patients.len(),
            icd_codes = taxonomy.icds.len(),
            "Loaded in-memory history store"
        );

        Ok(Self {
            taxonomy,
            phecodes,
            patients,
        })
    }

    /// Build from a taxonomy JSON document and a JSON array of patient histories.
    pub fn from_json(taxonomy_json: &str, histories_json: &str) -> Result<Self, ChartError> {
        let taxonomy: TaxonomyCatalog = serde_json::from_str(taxonomy_json)
            .map_err(|err| ChartError::Parse(format!("taxonomy: {err}")))?;
        let histories: Vec<PatientHistory> = serde_json::from_str(histories_json)
            .map_err(|err| ChartError::Parse(format!("patient histories: {err}")))?;
        Self::new(taxonomy, histories)
    }

    pub fn patient_ids(&self) -> Vec<PatientId> {
        self.patients.keys().copied().collect()
    }

    fn patient(&self, id: PatientId) -> Result<&PatientRecord, ChartError> {
        self.patients
            .get(&id)
            .ok_or(ChartError::UnknownPatient(id))
    }
}

fn index_by_code<T>(items: &[T], code: impl Fn(&T) -> &String) -> HashMap<String, usize> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| (code(item).clone(), idx))
        .collect()
}

fn lookup<'a, T>(
    items: &'a [T],
    index: &HashMap<String, usize>,
    kind: EventKind,
    code: &str,
) -> Result<&'a T, ChartError> {
    index
        .get(code)
        .map(|idx| &items[*idx])
        .ok_or_else(|| ChartError::UnknownCode {
            kind,
            code: code.to_string(),
        })
}

/// One band per lab code, shared by every reading of that code. The first supplied band
/// wins; codes without one get a band computed from all their values.
fn code_bands(histories: &[PatientHistory]) -> HashMap<String, PercentileBand> {
    let mut supplied: HashMap<String, PercentileBand> = HashMap::new();
    let mut values: HashMap<String, Vec<f64>> = HashMap::new();
    for lab in histories.iter().flat_map(|h| h.labs.iter()) {
        if let Some(band) = lab.percentiles {
            supplied.entry(lab.code.clone()).or_insert(band);
        }
        if let Some(value) = lab.value {
            values.entry(lab.code.clone()).or_default().push(value);
        }
    }
    for (code, vals) in values {
        supplied
            .entry(code)
            .or_insert_with(|| PercentileBand::discrete(&vals));
    }
    supplied
}

impl HistoryStore for MemoryStore {
    fn icd_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<IcdRow>, ChartError> {
        Ok(self
            .patient(patient)?
            .icds
            .iter()
            .filter(|row| within(range, row.date))
            .cloned()
            .collect())
    }

    fn lab_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<LabRow>, ChartError> {
        Ok(self
            .patient(patient)?
            .labs
            .iter()
            .filter(|row| within(range, row.datetime.date()))
            .cloned()
            .collect())
    }

    fn med_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<Medication>, ChartError> {
        Ok(self
            .patient(patient)?
            .meds
            .iter()
            .filter(|row| within(range, row.date))
            .cloned()
            .collect())
    }

    fn cpt_rows(
        &self,
        patient: PatientId,
        range: Option<DateRange>,
    ) -> Result<Vec<CptRow>, ChartError> {
        Ok(self
            .patient(patient)?
            .cpts
            .iter()
            .filter(|row| within(range, row.date))
            .cloned()
            .collect())
    }

    fn latest_med_date(&self, patient: PatientId) -> Result<Option<NaiveDate>, ChartError> {
        Ok(self.patient(patient)?.meds.iter().map(|m| m.date).max())
    }

    fn latest_lab_datetime(
        &self,
        patient: PatientId,
    ) -> Result<Option<NaiveDateTime>, ChartError> {
        Ok(self.patient(patient)?.labs.iter().map(|l| l.datetime).max())
    }

    fn latest_bmi(&self, patient: PatientId) -> Result<Option<Bmi>, ChartError> {
        Ok(self.patient(patient)?.vitals.bmis.iter().max_by_key(|b| b.weight_date).cloned())
    }

    fn latest_heart_rate(
        &self,
        patient: PatientId,
        kind: HeartRateKind,
    ) -> Result<Option<HeartRate>, ChartError> {
        Ok(self
            .patient(patient)?
            .vitals
            .heart_rates
            .iter()
            .filter(|hr| hr.name == kind)
            .max_by_key(|hr| hr.entry_date)
            .cloned())
    }

    fn latest_blood_pressure(
        &self,
        patient: PatientId,
    ) -> Result<Option<BloodPressure>, ChartError> {
        Ok(self
            .patient(patient)?
            .vitals
            .blood_pressures
            .iter()
            .max_by_key(|bp| bp.entry_date)
            .cloned())
    }

    fn vitals(&self, patient: PatientId) -> Result<VitalRecords, ChartError> {
        Ok(self.patient(patient)?.vitals.clone())
    }

    fn notes(
        &self,
        patient: PatientId,
        range: DateRange,
    ) -> Result<Vec<ClinicalNote>, ChartError> {
        Ok(self
            .patient(patient)?
            .notes
            .iter()
            .filter(|n| range.contains(n.date))
            .cloned()
            .collect())
    }
}

impl TaxonomyStore for MemoryStore {
    fn chapters(&self) -> Result<Vec<Chapter>, ChartError> {
        Ok(self.taxonomy.chapters.clone())
    }

    fn phecode(&self, code: &str) -> Result<Option<Phecode>, ChartError> {
        Ok(self
            .phecodes
            .get(code)
            .map(|idx| self.taxonomy.phecodes[*idx].clone()))
    }

    fn ranked_icds_with_parent(&self, parent: &str) -> Result<Vec<IcdCode>, ChartError> {
        let mut ranked: Vec<IcdCode> = self
            .taxonomy
            .icds
            .iter()
            .filter(|icd| icd.rank.is_some() && icd.parent() == parent)
            .cloned()
            .collect();
        ranked.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.code.cmp(&b.code)));
        Ok(ranked)
    }
}

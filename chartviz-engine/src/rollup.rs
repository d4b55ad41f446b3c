//! Groups flat query rows into the hierarchical records the dashboard renders.
//!
//! Every grouping goes through an ordered map keyed by the full grouping tuple, so output
//! order follows the key and never the order rows arrived in.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chartviz_core::{
    area_under_curve, finite, ChartError, Chapter, CptRow, IcdRow, IntensityCurve,
    IntensityEstimator, LabRow, Medication, PanelSlot, PercentileBand, PhecodeRef, TimeGrid,
};
use chrono::{NaiveDate, NaiveDateTime};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

type BandKey = [Option<OrderedFloat<f64>>; 5];

fn band_key(band: &PercentileBand) -> BandKey {
    band.values().map(|v| v.map(OrderedFloat))
}

fn band_from_key(key: &BandKey) -> PercentileBand {
    let [p10, p25, p50, p75, p90] = (*key).map(|v| v.map(OrderedFloat::into_inner));
    PercentileBand {
        perc_10: p10,
        perc_25: p25,
        perc_50: p50,
        perc_75: p75,
        perc_90: p90,
    }
}

/// One lab result inside a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabReading {
    pub datetime: NaiveDateTime,
    pub value: Option<f64>,
    pub unit: String,
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabGroup {
    pub code: String,
    pub description: String,
    #[serde(flatten)]
    pub band: PercentileBand,
    pub events: Vec<LabReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

impl LabGroup {
    fn placeholder(slot: &PanelSlot) -> Self {
        Self {
            code: slot.code.clone(),
            description: slot.description.clone(),
            band: PercentileBand::default(),
            events: Vec::new(),
            relevance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LabRollup {
    pub chem: Vec<LabGroup>,
    pub cbc: Vec<LabGroup>,
    pub other: Vec<LabGroup>,
}

impl LabRollup {
    pub fn groups_mut(&mut self) -> impl Iterator<Item = &mut LabGroup> {
        self.chem
            .iter_mut()
            .chain(self.cbc.iter_mut())
            .chain(self.other.iter_mut())
    }

    pub fn groups(&self) -> impl Iterator<Item = &LabGroup> {
        self.chem.iter().chain(self.cbc.iter()).chain(self.other.iter())
    }
}

fn sort_readings(events: &mut Vec<LabReading>) {
    let key = |e: &LabReading| {
        (
            e.datetime,
            e.value.map(OrderedFloat),
            e.normal_min.map(OrderedFloat),
            e.normal_max.map(OrderedFloat),
        )
    };
    events.sort_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.unit.cmp(&b.unit)));
    events.dedup();
}

/// Group lab rows by `(code, description, band)`.
///
/// Panel codes land in their configured slot, in panel order. Slots without data keep an
/// empty placeholder group.
pub fn rollup_labs(
    rows: &[LabRow],
    chem_panel: &[PanelSlot],
    cbc_panel: &[PanelSlot],
) -> LabRollup {
    let mut groups: BTreeMap<(&str, &str, BandKey), Vec<LabReading>> = BTreeMap::new();
    for row in rows {
        let band = row.band.normalized();
        groups
            .entry((row.code.as_str(), row.description.as_str(), band_key(&band)))
            .or_default()
            .push(LabReading {
                datetime: row.datetime,
                value: finite(row.value),
                unit: row.unit.clone(),
                normal_min: finite(row.normal_min),
                normal_max: finite(row.normal_max),
            });
    }

    let mut chem: BTreeMap<&str, LabGroup> = BTreeMap::new();
    let mut cbc: BTreeMap<&str, LabGroup> = BTreeMap::new();
    let mut rollup = LabRollup::default();
    let in_panel = |panel: &[PanelSlot], code: &str| panel.iter().any(|slot| slot.code == code);

    for ((code, description, key), mut events) in groups {
        sort_readings(&mut events);
        let group = LabGroup {
            code: code.to_string(),
            description: description.to_string(),
            band: band_from_key(&key),
            events,
            relevance: None,
        };

        let slots = if in_panel(chem_panel, code) {
            Some(&mut chem)
        } else if in_panel(cbc_panel, code) {
            Some(&mut cbc)
        } else {
            None
        };
        match slots {
            Some(slots) => match slots.entry(code) {
                Entry::Vacant(slot) => {
                    slot.insert(group);
                }
                Entry::Occupied(mut slot) => {
                    tracing::warn!(code, "Panel code has more than one band, merging readings");
                    let merged = slot.get_mut();
                    merged.events.extend(group.events);
                    sort_readings(&mut merged.events);
                }
            },
            None => rollup.other.push(group),
        }
    }

    rollup.chem = chem_panel
        .iter()
        .map(|slot| {
            chem.remove(slot.code.as_str())
                .unwrap_or_else(|| LabGroup::placeholder(slot))
        })
        .collect();
    rollup.cbc = cbc_panel
        .iter()
        .map(|slot| {
            cbc.remove(slot.code.as_str())
                .unwrap_or_else(|| LabGroup::placeholder(slot))
        })
        .collect();

    tracing::debug!(
        rows = rows.len(),
        chem = rollup.chem.len(),
        cbc = rollup.cbc.len(),
        other = rollup.other.len(),
        "Rolled up labs"
    );
    rollup
}

/// Medications sharing one signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedRollup {
    pub name: String,
    pub strength: String,
    pub route: String,
    pub frequency: String,
    pub description: Option<String>,
    pub strength_num: Option<f64>,
    pub events: Vec<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

type MedSignature<'a> = (
    &'a str,
    &'a str,
    &'a str,
    &'a str,
    Option<&'a str>,
    Option<OrderedFloat<f64>>,
);

/// Group medications by their full signature. One date is kept per input row.
pub fn rollup_meds(rows: &[Medication]) -> Vec<MedRollup> {
    let mut groups: BTreeMap<MedSignature<'_>, Vec<NaiveDate>> = BTreeMap::new();
    for row in rows {
        let signature = (
            row.name.as_str(),
            row.strength.as_str(),
            row.route.as_str(),
            row.frequency.as_str(),
            row.description.as_deref(),
            finite(row.strength_num).map(OrderedFloat),
        );
        groups.entry(signature).or_default().push(row.date);
    }

    let meds: Vec<MedRollup> = groups
        .into_iter()
        .map(
            |((name, strength, route, frequency, description, strength_num), mut events)| {
                events.sort();
                MedRollup {
                    name: name.to_string(),
                    strength: strength.to_string(),
                    route: route.to_string(),
                    frequency: frequency.to_string(),
                    description: description.map(str::to_string),
                    strength_num: strength_num.map(OrderedFloat::into_inner),
                    events,
                    relevance: None,
                }
            },
        )
        .collect();
    tracing::debug!(rows = rows.len(), groups = meds.len(), "Rolled up medications");
    meds
}

/// Distinct dates of one ICD code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IcdBranch {
    pub code: String,
    pub description: String,
    pub events: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhecodeBranch {
    pub code: String,
    pub description: String,
    pub icds: Vec<IcdBranch>,
    /// Number of ICD events under this phecode.
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterRollup {
    pub code: String,
    pub description: String,
    pub color: String,
    pub phecodes: Vec<PhecodeBranch>,
    pub intensity: IntensityCurve,
    pub final_intensity: f64,
    pub auc: f64,
}

pub(crate) type IcdTree<'a> =
    BTreeMap<&'a PhecodeRef, BTreeMap<(&'a str, &'a str), BTreeSet<NaiveDate>>>;

/// Group ICD rows into phecode branches, each with ICD leaves of distinct dates.
pub(crate) fn phecode_tree(rows: &[IcdRow]) -> IcdTree<'_> {
    let mut tree: IcdTree<'_> = BTreeMap::new();
    for row in rows {
        let Some(phecode) = row.phecode.as_ref() else {
            continue;
        };
        tree.entry(phecode)
            .or_default()
            .entry((row.code.as_str(), row.description.as_str()))
            .or_default()
            .insert(row.date);
    }
    tree
}

pub(crate) fn icd_branches(
    icds: BTreeMap<(&str, &str), BTreeSet<NaiveDate>>,
) -> (Vec<IcdBranch>, BTreeSet<NaiveDate>) {
    let mut dates = BTreeSet::new();
    let branches = icds
        .into_iter()
        .map(|((code, description), events)| {
            dates.extend(events.iter().copied());
            IcdBranch {
                code: code.to_string(),
                description: description.to_string(),
                events: events.into_iter().collect(),
            }
        })
        .collect();
    (branches, dates)
}

/// Chapter -> phecode -> ICD tree with one intensity curve per chapter.
///
/// Every catalog chapter except `excluded_chapter` appears, sorted by chapter code. Rows
/// without a phecode or chapter are ignored.
pub fn rollup_chapters(
    rows: &[IcdRow],
    chapters: &[Chapter],
    excluded_chapter: &str,
    grid: &TimeGrid,
    estimator: &IntensityEstimator,
) -> Result<Vec<ChapterRollup>, ChartError> {
    let mut by_chapter: BTreeMap<&str, Vec<IcdRow>> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.phecode.is_some()) {
        if let Some(chapter) = row.chapter.as_deref() {
            by_chapter.entry(chapter).or_default().push(row.clone());
        }
    }

    let mut rollups = Vec::new();
    for chapter in chapters {
        let chapter_rows = by_chapter.remove(chapter.code.as_str()).unwrap_or_default();
        if chapter.description == excluded_chapter {
            continue;
        }

        let mut dates = BTreeSet::new();
        let phecodes: Vec<PhecodeBranch> = phecode_tree(&chapter_rows)
            .into_iter()
            .map(|(phecode, icds)| {
                let (icds, phecode_dates) = icd_branches(icds);
                let total = icds.iter().map(|icd| icd.events.len()).sum();
                dates.extend(phecode_dates);
                PhecodeBranch {
                    code: phecode.code.clone(),
                    description: phecode.description.clone(),
                    icds,
                    total,
                }
            })
            .collect();

        let intensity = estimator.estimate(dates, grid);
        let auc = area_under_curve(&intensity, grid)?;
        rollups.push(ChapterRollup {
            code: chapter.code.clone(),
            description: chapter.description.clone(),
            color: chapter.color.clone(),
            phecodes,
            final_intensity: intensity.final_intensity(),
            intensity,
            auc,
        });
    }

    for (chapter, orphans) in &by_chapter {
        tracing::warn!(
            chapter,
            rows = orphans.len(),
            "ICD rows reference a chapter missing from the catalog"
        );
    }

    rollups.sort_by(|a, b| a.code.cmp(&b.code));
    tracing::debug!(rows = rows.len(), chapters = rollups.len(), "Rolled up chapters");
    Ok(rollups)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CptRollup {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub code: String,
    pub description: String,
    pub events: Vec<NaiveDate>,
}

/// Group procedures by `(category, subcategory, code, description)`.
pub fn rollup_cpts(rows: &[CptRow]) -> Vec<CptRollup> {
    type CptKey<'a> = (Option<&'a str>, Option<&'a str>, &'a str, &'a str);
    let mut groups: BTreeMap<CptKey<'_>, BTreeSet<NaiveDate>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((
                row.category.as_deref(),
                row.subcategory.as_deref(),
                row.code.as_str(),
                row.description.as_str(),
            ))
            .or_default()
            .insert(row.date);
    }
    groups
        .into_iter()
        .map(|((category, subcategory, code, description), events)| CptRollup {
            category: category.map(str::to_string),
            subcategory: subcategory.map(str::to_string),
            code: code.to_string(),
            description: description.to_string(),
            events: events.into_iter().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sodium(day: u32, value: f64) -> LabRow {
        LabRow {
            code: "Na".into(),
            description: "SODIUM BLOOD".into(),
            datetime: date(2020, 1, day).and_hms_opt(8, 0, 0).unwrap(),
            value: Some(value),
            unit: "mmol/L".into(),
            normal_min: Some(135.0),
            normal_max: Some(f64::INFINITY),
            band: PercentileBand::new(135.0, 136.0, 140.0, 144.0, 150.0),
        }
    }

    fn med(day: u32, name: &str) -> Medication {
        let mut med = Medication {
            date: date(2020, 1, day),
            name: name.into(),
            strength: "500 mg".into(),
            route: "oral".into(),
            frequency: "BID".into(),
            dose: None,
            duration: None,
            description: None,
            strength_num: None,
        };
        med.fill_computed();
        med
    }

    fn icd(code: &str, phecode: Option<&str>, chapter: Option<&str>, d: NaiveDate) -> IcdRow {
        IcdRow {
            date: d,
            code: code.into(),
            description: format!("ICD {code}"),
            phecode: phecode.map(|p| PhecodeRef {
                code: p.into(),
                description: format!("Phecode {p}"),
            }),
            chapter: chapter.map(str::to_string),
        }
    }

    fn chapter(code: &str, description: &str) -> Chapter {
        Chapter {
            code: code.into(),
            description: description.into(),
            first_parent: None,
            last_parent: None,
            color: "#888888".into(),
        }
    }

    fn grid() -> TimeGrid {
        TimeGrid::build(
            date(2000, 1, 1).and_time(NaiveTime::MIN),
            date(2020, 2, 1).and_time(NaiveTime::MIN),
            100,
        )
        .unwrap()
    }

    #[test]
    fn sodium_group_is_time_ordered_regardless_of_input_order() {
        let forward = rollup_labs(&[sodium(1, 140.0), sodium(2, 142.0)], &[], &[]);
        let backward = rollup_labs(&[sodium(2, 142.0), sodium(1, 140.0)], &[], &[]);
        assert_eq!(forward, backward);

        assert_eq!(forward.other.len(), 1);
        let group = &forward.other[0];
        assert_eq!(group.code, "Na");
        assert_eq!(group.band, PercentileBand::new(135.0, 136.0, 140.0, 144.0, 150.0));
        let values: Vec<Option<f64>> = group.events.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Some(140.0), Some(142.0)]);
        assert!(group.events.iter().all(|e| e.normal_max.is_none()));
    }

    #[test]
    fn lab_output_never_carries_infinities() {
        let mut row = sodium(3, f64::NEG_INFINITY);
        row.band.perc_90 = Some(f64::INFINITY);
        let rollup = rollup_labs(&[row, sodium(4, 139.0)], &[], &[]);
        for group in rollup.groups() {
            assert!(group.band.is_ordered());
            assert!(group.band.values().iter().flatten().all(|v| v.is_finite()));
            for event in &group.events {
                for field in [event.value, event.normal_min, event.normal_max] {
                    assert!(field.map_or(true, f64::is_finite));
                }
            }
        }
    }

    #[test]
    fn panels_are_pre_seeded_in_configured_order() {
        let chem = vec![
            PanelSlot {
                code: "K".into(),
                description: "POTASSIUM".into(),
            },
            PanelSlot {
                code: "Na".into(),
                description: "SODIUM BLOOD".into(),
            },
        ];
        let cbc = vec![PanelSlot {
            code: "HGB".into(),
            description: "HEMOGLOBIN".into(),
        }];
        let rollup = rollup_labs(&[sodium(1, 140.0)], &chem, &cbc);
        assert_eq!(rollup.chem[0].code, "K");
        assert!(rollup.chem[0].events.is_empty());
        assert_eq!(rollup.chem[1].events.len(), 1);
        assert_eq!(rollup.cbc[0].code, "HGB");
        assert!(rollup.other.is_empty());
    }

    #[test]
    fn panel_code_with_two_bands_keeps_every_reading() {
        let chem = vec![PanelSlot {
            code: "Na".into(),
            description: "SODIUM BLOOD".into(),
        }];
        let mut bare = sodium(2, 142.0);
        bare.band = PercentileBand::default();
        let rollup = rollup_labs(&[sodium(1, 140.0), bare], &chem, &[]);

        assert_eq!(rollup.chem.len(), 1);
        let values: Vec<Option<f64>> = rollup.chem[0].events.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Some(140.0), Some(142.0)]);
        assert!(rollup.other.is_empty());
    }

    #[test]
    fn duplicate_readings_collapse_across_reference_ranges() {
        let mut wide = sodium(1, 140.0);
        wide.normal_min = Some(130.0);
        let rows = vec![sodium(1, 140.0), wide, sodium(1, 140.0)];
        let rollup = rollup_labs(&rows, &[], &[]);

        let events = &rollup.other[0].events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].normal_min, Some(130.0));
        assert_eq!(events[1].normal_min, Some(135.0));
    }

    #[test]
    fn meds_keep_every_row() {
        let rows = vec![
            med(3, "metformin"),
            med(1, "metformin"),
            med(1, "metformin"),
            med(2, "lisinopril"),
        ];
        let meds = rollup_meds(&rows);
        assert_eq!(meds.len(), 2);
        assert_eq!(meds[0].name, "lisinopril");
        assert_eq!(meds[1].events, vec![date(2020, 1, 1), date(2020, 1, 1), date(2020, 1, 3)]);
        assert_eq!(meds.iter().map(|m| m.events.len()).sum::<usize>(), rows.len());
        assert_eq!(meds[1].strength_num, Some(500.0));
    }

    #[test]
    fn chapters_are_pre_seeded_and_sorted() {
        let d = date(2019, 12, 20);
        let rows = vec![
            icd("250.00", Some("250.2"), Some("C03"), d),
            icd("250.00", Some("250.2"), Some("C03"), d),
            icd("250.02", Some("250.2"), Some("C03"), date(2019, 12, 21)),
            icd("V70.0", None, Some("C03"), d),
            icd("999.9", Some("999"), Some("C99"), d),
        ];
        let catalog = vec![
            chapter("C07", "Circulatory system"),
            chapter("C03", "Endocrine/metabolic"),
            chapter("C17", "Procedures"),
        ];
        let chapters =
            rollup_chapters(&rows, &catalog, "Procedures", &grid(), &IntensityEstimator::default())
                .unwrap();

        let codes: Vec<&str> = chapters.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["C03", "C07"]);

        let endocrine = &chapters[0];
        assert_eq!(endocrine.phecodes.len(), 1);
        assert_eq!(endocrine.phecodes[0].total, 2);
        assert_eq!(endocrine.phecodes[0].icds[0].events, vec![d]);
        assert!(endocrine.final_intensity > 0.0);

        let circulatory = &chapters[1];
        assert!(circulatory.phecodes.is_empty());
        assert_eq!(circulatory.intensity, IntensityCurve::zeros(100));
        assert_eq!(circulatory.auc, 0.0);
    }

    #[test]
    fn cpts_group_by_category_then_code() {
        let row = |code: &str, category: &str, d: NaiveDate| CptRow {
            date: d,
            code: code.into(),
            description: format!("CPT {code}"),
            category: Some(category.into()),
            subcategory: None,
        };
        let rows = vec![
            row("99213", "Evaluation", date(2020, 1, 5)),
            row("80053", "Pathology", date(2020, 1, 2)),
            row("99213", "Evaluation", date(2020, 1, 1)),
            row("99213", "Evaluation", date(2020, 1, 5)),
        ];
        let cpts = rollup_cpts(&rows);
        assert_eq!(cpts.len(), 2);
        assert_eq!(cpts[0].code, "99213");
        assert_eq!(cpts[0].events, vec![date(2020, 1, 1), date(2020, 1, 5)]);
        assert_eq!(cpts[1].category.as_deref(), Some("Pathology"));
    }
}

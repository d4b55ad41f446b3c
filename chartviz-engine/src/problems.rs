//! Ranks phecodes by how active they still are at the end of the grid.

use chartviz_core::{
    area_under_curve, ChartError, DateRange, IcdRow, IntensityCurve, IntensityEstimator, TimeGrid,
};
use serde::{Deserialize, Serialize};

use crate::rollup::{icd_branches, phecode_tree, IcdBranch};

/// One entry of the problem list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub code: String,
    pub description: String,
    pub icds: Vec<IcdBranch>,
    pub intensity: IntensityCurve,
    pub final_intensity: f64,
    pub auc: f64,
    pub date_range: DateRange,
    /// Days between the first and last event.
    pub date_spread: i64,
}

/// Phecodes whose final intensity exceeds `cutoff`, most active first.
///
/// Only rows carrying a phecode take part, so a phecode without events cannot appear.
pub fn problem_list(
    rows: &[IcdRow],
    grid: &TimeGrid,
    estimator: &IntensityEstimator,
    cutoff: f64,
) -> Result<Vec<Problem>, ChartError> {
    let mut problems = Vec::new();
    for (phecode, icds) in phecode_tree(rows) {
        let (icds, dates) = icd_branches(icds);
        let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
            continue;
        };
        let intensity = estimator.estimate(dates, grid);
        let auc = area_under_curve(&intensity, grid)?;
        problems.push(Problem {
            code: phecode.code.clone(),
            description: phecode.description.clone(),
            icds,
            final_intensity: intensity.final_intensity(),
            intensity,
            auc,
            date_range: DateRange::new(first, last),
            date_spread: (last - first).num_days(),
        });
    }

    let candidates = problems.len();
    problems.retain(|p| p.final_intensity > cutoff);
    problems.sort_by(|a, b| {
        b.final_intensity
            .total_cmp(&a.final_intensity)
            .then_with(|| a.code.cmp(&b.code))
    });
    tracing::debug!(candidates, kept = problems.len(), cutoff, "Ranked problem list");
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartviz_core::PhecodeRef;
    use chrono::{NaiveDate, NaiveTime};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(code: &str, phecode: Option<(&str, &str)>, d: NaiveDate) -> IcdRow {
        IcdRow {
            date: d,
            code: code.into(),
            description: format!("ICD {code}"),
            phecode: phecode.map(|(code, description)| PhecodeRef {
                code: code.into(),
                description: description.into(),
            }),
            chapter: None,
        }
    }

    fn grid(today: NaiveDate) -> TimeGrid {
        TimeGrid::build(
            date(2000, 1, 1).and_time(NaiveTime::MIN),
            today.and_time(NaiveTime::MIN),
            100,
        )
        .unwrap()
    }

    #[test]
    fn diabetes_scenario() {
        let diabetes = Some(("P1", "Diabetes"));
        let rows = vec![
            row("250.00", diabetes, date(2020, 1, 10)),
            row("250.00", diabetes, date(2020, 1, 1)),
        ];
        let problems = problem_list(
            &rows,
            &grid(date(2020, 1, 15)),
            &IntensityEstimator::default(),
            0.0018,
        )
        .unwrap();

        assert_eq!(problems.len(), 1);
        let problem = &problems[0];
        assert_eq!(problem.code, "P1");
        assert_eq!(problem.icds.len(), 1);
        assert_eq!(problem.icds[0].code, "250.00");
        assert_eq!(problem.icds[0].events, vec![date(2020, 1, 1), date(2020, 1, 10)]);
        assert_eq!(problem.date_spread, 9);
        assert_eq!(
            problem.date_range,
            DateRange::new(date(2020, 1, 1), date(2020, 1, 10))
        );
        assert!(problem.final_intensity > 0.0018);
        assert_eq!(problem.intensity.len(), 100);
    }

    #[test]
    fn stale_and_unmapped_codes_are_dropped() {
        let today = date(2020, 1, 15);
        let rows = vec![
            row("250.00", Some(("P1", "Diabetes")), date(2019, 12, 28)),
            row("401.1", Some(("P2", "Hypertension")), date(2003, 4, 2)),
            row("V70.0", None, date(2020, 1, 14)),
        ];
        let problems =
            problem_list(&rows, &grid(today), &IntensityEstimator::default(), 0.0018).unwrap();
        let codes: Vec<&str> = problems.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(codes, vec!["P1"]);
        assert!(problems.iter().all(|p| p.final_intensity > 0.0018));
        assert!(problems.iter().all(|p| !p.icds.is_empty()));
    }

    #[test]
    fn sorted_by_final_intensity() {
        let today = date(2020, 1, 15);
        let busy = Some(("P1", "Busy"));
        let quiet = Some(("P2", "Quiet"));
        let rows = vec![
            row("A.1", quiet, date(2019, 11, 1)),
            row("B.1", busy, date(2020, 1, 1)),
            row("B.1", busy, date(2020, 1, 8)),
            row("B.2", busy, date(2020, 1, 12)),
        ];
        let problems =
            problem_list(&rows, &grid(today), &IntensityEstimator::default(), 0.0).unwrap();
        assert_eq!(problems[0].code, "P1");
        assert_eq!(problems[0].icds.len(), 2);
        assert!(problems
            .windows(2)
            .all(|w| w[0].final_intensity >= w[1].final_intensity));
    }

    #[test]
    fn no_rows_no_problems() {
        let problems = problem_list(
            &[],
            &grid(date(2020, 1, 15)),
            &IntensityEstimator::default(),
            0.0018,
        )
        .unwrap();
        assert!(problems.is_empty());
    }
}

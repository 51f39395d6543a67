use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{self, EngineError};

/// Direction of the grading scale for an academic level. K-12 scales run
/// 0-100 with higher better; collegiate scales run 1.0 (best) to 5.0
/// (worst). A configuration property of the level, never inferred from the
/// magnitude of criterion thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Ascending,
    Descending,
}

impl ScaleDirection {
    pub fn parse(scale: &str) -> Option<ScaleDirection> {
        match scale {
            "k12" => Some(ScaleDirection::Ascending),
            "collegiate" => Some(ScaleDirection::Descending),
            _ => None,
        }
    }

    /// `value` is at least as good as `bound` on this scale.
    pub fn at_least(self, value: f64, bound: f64) -> bool {
        match self {
            ScaleDirection::Ascending => value >= bound,
            ScaleDirection::Descending => value <= bound,
        }
    }

    /// `value` is no better than `bound` on this scale.
    pub fn at_most(self, value: f64, bound: f64) -> bool {
        match self {
            ScaleDirection::Ascending => value <= bound,
            ScaleDirection::Descending => value >= bound,
        }
    }

    /// The worst grade in the set, in quality terms.
    pub fn worst(self, values: &[f64]) -> Option<f64> {
        let fold = |a: f64, b: f64| match self {
            ScaleDirection::Ascending => a.min(b),
            ScaleDirection::Descending => a.max(b),
        };
        values.iter().copied().reduce(fold)
    }
}

/// One candidate band from the criteria registry. Absent bounds are
/// unbounded on that side. Several bands may target the same honor type.
#[derive(Debug, Clone)]
pub struct CriterionBand {
    pub honor_type_id: String,
    pub tier_rank: i64,
    pub min_gpa: Option<f64>,
    pub max_gpa: Option<f64>,
    pub min_grade: Option<f64>,
    pub min_grade_all: Option<f64>,
    pub min_year: Option<i64>,
    pub max_year: Option<i64>,
    pub require_consistent_honor: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EvalInput<'a> {
    pub gpa: f64,
    pub grades: &'a [f64],
    pub year_level: Option<i64>,
    pub scale: ScaleDirection,
    /// Best qualifying tier rank from the immediately preceding school year
    /// within the same academic level, if any.
    pub prior_best_tier_rank: Option<i64>,
}

pub fn band_satisfied(input: &EvalInput<'_>, band: &CriterionBand) -> bool {
    let scale = input.scale;
    if let Some(min_gpa) = band.min_gpa {
        if !scale.at_least(input.gpa, min_gpa) {
            return false;
        }
    }
    if let Some(max_gpa) = band.max_gpa {
        if !scale.at_most(input.gpa, max_gpa) {
            return false;
        }
    }
    if let Some(min_grade) = band.min_grade {
        match scale.worst(input.grades) {
            Some(worst) if scale.at_least(worst, min_grade) => {}
            _ => return false,
        }
    }
    if let Some(floor) = band.min_grade_all {
        if input.grades.is_empty() || input.grades.iter().any(|g| !scale.at_least(*g, floor)) {
            return false;
        }
    }
    if let Some(min_year) = band.min_year {
        match input.year_level {
            Some(y) if y >= min_year => {}
            _ => return false,
        }
    }
    if let Some(max_year) = band.max_year {
        match input.year_level {
            Some(y) if y <= max_year => {}
            _ => return false,
        }
    }
    if band.require_consistent_honor {
        match input.prior_best_tier_rank {
            Some(prior) if prior >= band.tier_rank => {}
            _ => return false,
        }
    }
    true
}

/// All honor types whose bands the student satisfies. Every satisfied type is
/// returned; collapsing to a single "best" honor is a presentation concern.
pub fn evaluate(input: &EvalInput<'_>, bands: &[CriterionBand]) -> Vec<String> {
    let mut qualifying: Vec<String> = Vec::new();
    for band in bands {
        if qualifying.iter().any(|t| t == &band.honor_type_id) {
            continue;
        }
        if band_satisfied(input, band) {
            qualifying.push(band.honor_type_id.clone());
        }
    }
    qualifying
}

/// "2025-2026" -> "2024-2025". Anything unparseable has no predecessor.
pub fn previous_school_year(school_year: &str) -> Option<String> {
    let start: i64 = school_year.split('-').next()?.trim().parse().ok()?;
    Some(format!("{}-{}", start - 1, start))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorResultRow {
    pub id: String,
    pub student_id: String,
    pub honor_type_id: String,
    pub honor_type_name: String,
    pub academic_level_id: String,
    pub school_year: String,
    pub gpa: f64,
    pub is_overridden: bool,
    pub override_reason: Option<String>,
    pub overridden_by: Option<String>,
}

pub fn list_results(
    conn: &Connection,
    student_id: &str,
    academic_level_id: &str,
    school_year: &str,
) -> Result<Vec<HonorResultRow>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.student_id, r.honor_type_id, t.name, r.academic_level_id,
                    r.school_year, r.gpa, r.is_overridden, r.override_reason, r.overridden_by
             FROM honor_results r
             JOIN honor_types t ON t.id = r.honor_type_id
             WHERE r.student_id = ? AND r.academic_level_id = ? AND r.school_year = ?
             ORDER BY t.tier_rank DESC",
        )
        .map_err(EngineError::db)?;
    stmt.query_map((student_id, academic_level_id, school_year), |r| {
        Ok(HonorResultRow {
            id: r.get(0)?,
            student_id: r.get(1)?,
            honor_type_id: r.get(2)?,
            honor_type_name: r.get(3)?,
            academic_level_id: r.get(4)?,
            school_year: r.get(5)?,
            gpa: r.get(6)?,
            is_overridden: r.get::<_, i64>(7)? != 0,
            override_reason: r.get(8)?,
            overridden_by: r.get(9)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}

/// Recompute the honor slice for one (student, school_year) from current
/// approved final grades and the criteria registry, and reconcile
/// `honor_results`. Deterministic in its inputs, so concurrent or repeated
/// invocations converge; overridden rows are never touched. Absent criteria
/// for the level means no honors offered, not an error.
pub fn recompute_for_student(
    conn: &Connection,
    student_id: &str,
    school_year: &str,
) -> Result<Vec<HonorResultRow>, EngineError> {
    let student: Option<(String, Option<i64>, String)> = conn
        .query_row(
            "SELECT s.academic_level_id, s.year_level, l.scale
             FROM students s
             JOIN academic_levels l ON l.id = s.academic_level_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((level_id, year_level, scale_name)) = student else {
        return Err(EngineError::new("not_found", "student not found"));
    };
    let scale = ScaleDirection::parse(&scale_name).ok_or_else(|| {
        EngineError::validation(format!("unknown grading scale: {}", scale_name))
    })?;

    let mut grades_stmt = conn
        .prepare(
            "SELECT overall FROM subject_grades
             WHERE student_id = ? AND school_year = ? AND grade_type = 'final'
               AND status IN ('approved', 'finalized') AND overall IS NOT NULL
             ORDER BY subject_id",
        )
        .map_err(EngineError::db)?;
    let grades: Vec<f64> = grades_stmt
        .query_map((student_id, school_year), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    let mut bands_stmt = conn
        .prepare(
            "SELECT c.honor_type_id, t.tier_rank, c.min_gpa, c.max_gpa, c.min_grade,
                    c.min_grade_all, c.min_year, c.max_year, c.require_consistent_honor
             FROM honor_criteria c
             JOIN honor_types t ON t.id = c.honor_type_id
             WHERE c.academic_level_id = ?
             ORDER BY t.tier_rank DESC, c.id",
        )
        .map_err(EngineError::db)?;
    let bands: Vec<CriterionBand> = bands_stmt
        .query_map([&level_id], |r| {
            Ok(CriterionBand {
                honor_type_id: r.get(0)?,
                tier_rank: r.get(1)?,
                min_gpa: r.get(2)?,
                max_gpa: r.get(3)?,
                min_grade: r.get(4)?,
                min_grade_all: r.get(5)?,
                min_year: r.get(6)?,
                max_year: r.get(7)?,
                require_consistent_honor: r.get::<_, i64>(8)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    let prior_best_tier_rank: Option<i64> = match previous_school_year(school_year) {
        Some(prev) => conn
            .query_row(
                "SELECT MAX(t.tier_rank)
                 FROM honor_results r
                 JOIN honor_types t ON t.id = r.honor_type_id
                 WHERE r.student_id = ? AND r.academic_level_id = ? AND r.school_year = ?",
                (student_id, &level_id, &prev),
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(EngineError::db)?
            .flatten(),
        None => None,
    };

    let qualifying: Vec<String> = match aggregate::gpa(&grades) {
        Some(gpa) if !bands.is_empty() => {
            let input = EvalInput {
                gpa,
                grades: &grades,
                year_level,
                scale,
                prior_best_tier_rank,
            };
            evaluate(&input, &bands)
        }
        _ => Vec::new(),
    };
    let gpa_value = aggregate::gpa(&grades).unwrap_or(0.0);

    let tx = conn.unchecked_transaction().map_err(EngineError::db)?;

    // Drop stale machine-computed rows; overridden rows stay authoritative.
    let mut delete_stmt = tx
        .prepare(
            "DELETE FROM honor_results
             WHERE student_id = ? AND academic_level_id = ? AND school_year = ?
               AND is_overridden = 0
               AND honor_type_id NOT IN
                   (SELECT value FROM json_each(?))",
        )
        .map_err(EngineError::db)?;
    let qualifying_json = serde_json::to_string(&qualifying)
        .map_err(|e| EngineError::new("internal", e.to_string()))?;
    delete_stmt
        .execute((student_id, &level_id, school_year, &qualifying_json))
        .map_err(EngineError::db)?;
    drop(delete_stmt);

    for honor_type_id in &qualifying {
        let row_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO honor_results(
                 id, student_id, honor_type_id, academic_level_id, school_year,
                 gpa, is_overridden, override_reason, overridden_by)
             VALUES(?, ?, ?, ?, ?, ?, 0, NULL, NULL)
             ON CONFLICT(student_id, honor_type_id, academic_level_id, school_year)
             DO UPDATE SET gpa = excluded.gpa
             WHERE honor_results.is_overridden = 0",
            (
                &row_id,
                student_id,
                honor_type_id,
                &level_id,
                school_year,
                gpa_value,
            ),
        )
        .map_err(|e| EngineError::new("db_insert_failed", e.to_string()))?;
    }

    tx.commit().map_err(EngineError::db)?;

    list_results(conn, student_id, &level_id, school_year)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(honor_type: &str, tier: i64) -> CriterionBand {
        CriterionBand {
            honor_type_id: honor_type.to_string(),
            tier_rank: tier,
            min_gpa: None,
            max_gpa: None,
            min_grade: None,
            min_grade_all: None,
            min_year: None,
            max_year: None,
            require_consistent_honor: false,
        }
    }

    fn input<'a>(gpa: f64, grades: &'a [f64], scale: ScaleDirection) -> EvalInput<'a> {
        EvalInput {
            gpa,
            grades,
            year_level: Some(10),
            scale,
            prior_best_tier_rank: None,
        }
    }

    #[test]
    fn gpa_band_bounds_are_optional() {
        let grades = [92.0, 94.0];
        let mut b = band("with_honors", 1);
        b.min_gpa = Some(90.0);
        assert!(band_satisfied(&input(93.0, &grades, ScaleDirection::Ascending), &b));
        assert!(!band_satisfied(&input(89.9, &grades, ScaleDirection::Ascending), &b));

        b.max_gpa = Some(94.99);
        assert!(band_satisfied(&input(93.0, &grades, ScaleDirection::Ascending), &b));
        assert!(!band_satisfied(&input(95.5, &grades, ScaleDirection::Ascending), &b));
    }

    #[test]
    fn min_grade_checks_the_worst_subject() {
        let mut b = band("with_honors", 1);
        b.min_grade = Some(85.0);
        let passing = [88.0, 85.0, 96.0];
        let failing = [88.0, 84.9, 96.0];
        assert!(band_satisfied(&input(90.0, &passing, ScaleDirection::Ascending), &b));
        assert!(!band_satisfied(&input(90.0, &failing, ScaleDirection::Ascending), &b));
        // No grades at all never satisfies a floor.
        assert!(!band_satisfied(&input(90.0, &[], ScaleDirection::Ascending), &b));
    }

    #[test]
    fn min_grade_all_applies_to_every_subject() {
        let mut b = band("with_honors", 1);
        b.min_grade_all = Some(80.0);
        assert!(band_satisfied(&input(90.0, &[80.0, 99.0], ScaleDirection::Ascending), &b));
        assert!(!band_satisfied(&input(90.0, &[79.0, 99.0], ScaleDirection::Ascending), &b));
    }

    #[test]
    fn descending_scale_inverts_every_bound() {
        // Collegiate: 1.0 best, 5.0 worst. min_gpa=1.75 means gpa <= 1.75.
        let mut b = band("deans_list", 2);
        b.min_gpa = Some(1.75);
        b.min_grade = Some(2.5);

        let strong = [1.25, 1.5, 2.0];
        assert!(band_satisfied(&input(1.5, &strong, ScaleDirection::Descending), &b));

        // GPA 2.0 is worse than the 1.75 cut on an inverted scale, even
        // though 2.0 > 1.75 numerically.
        assert!(!band_satisfied(&input(2.0, &strong, ScaleDirection::Descending), &b));

        // One 3.0 subject breaks the per-subject floor (worst = max).
        let weak = [1.25, 3.0];
        assert!(!band_satisfied(&input(1.5, &weak, ScaleDirection::Descending), &b));
    }

    #[test]
    fn year_window_requires_known_year() {
        let mut b = band("loyalty", 1);
        b.min_year = Some(4);
        let grades = [90.0];
        let mut i = input(90.0, &grades, ScaleDirection::Ascending);
        i.year_level = Some(4);
        assert!(band_satisfied(&i, &b));
        i.year_level = Some(3);
        assert!(!band_satisfied(&i, &b));
        i.year_level = None;
        assert!(!band_satisfied(&i, &b));
    }

    #[test]
    fn consistency_needs_equal_or_higher_prior_tier() {
        let mut b = band("with_high_honors", 2);
        b.require_consistent_honor = true;
        let grades = [95.0, 96.0];

        let mut i = input(95.5, &grades, ScaleDirection::Ascending);
        assert!(!band_satisfied(&i, &b), "no history disqualifies");

        i.prior_best_tier_rank = Some(1);
        assert!(!band_satisfied(&i, &b), "lower prior tier disqualifies");

        i.prior_best_tier_rank = Some(2);
        assert!(band_satisfied(&i, &b));
        i.prior_best_tier_rank = Some(3);
        assert!(band_satisfied(&i, &b));
    }

    #[test]
    fn raising_gpa_never_unsatisfies_a_min_bound() {
        let grades = [90.0, 92.0];
        let mut b = band("with_honors", 1);
        b.min_gpa = Some(90.0);
        for gpa in [90.0, 91.0, 95.0, 100.0] {
            assert!(band_satisfied(&input(gpa, &grades, ScaleDirection::Ascending), &b));
        }
    }

    #[test]
    fn evaluate_returns_every_satisfied_type_once() {
        let grades = [95.0, 96.0];
        let mut high = band("with_high_honors", 2);
        high.min_gpa = Some(95.0);
        let mut base = band("with_honors", 1);
        base.min_gpa = Some(90.0);
        // Second band for the same type must not duplicate it.
        let mut base_alt = band("with_honors", 1);
        base_alt.min_gpa = Some(85.0);

        let got = evaluate(
            &input(95.5, &grades, ScaleDirection::Ascending),
            &[high, base, base_alt],
        );
        assert_eq!(got, vec!["with_high_honors".to_string(), "with_honors".to_string()]);
    }

    #[test]
    fn previous_school_year_arithmetic() {
        assert_eq!(previous_school_year("2025-2026").as_deref(), Some("2024-2025"));
        assert_eq!(previous_school_year("not-a-year"), None);
    }
}

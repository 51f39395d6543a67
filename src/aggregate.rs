use serde::Serialize;

/// Structured engine error, serialized into the IPC error envelope by the
/// handler layer.
#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_failed", message)
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Grading-scheme class a student belongs to. Selected by enrollment, not by
/// subject: college enrollment wins, otherwise the academic level name
/// decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    Elementary,
    JuniorHigh,
    SeniorHigh,
    College,
}

impl Population {
    /// Unmatched level names yield None; the caller falls back to the legacy
    /// flat-mean path. Kept for workspaces predating population tagging.
    pub fn resolve(college_enrolled: bool, level_name: &str) -> Option<Population> {
        if college_enrolled {
            return Some(Population::College);
        }
        let lower = level_name.trim().to_ascii_lowercase();
        if lower.starts_with("elementary") {
            Some(Population::Elementary)
        } else if lower.starts_with("junior high") {
            Some(Population::JuniorHigh)
        } else if lower.starts_with("senior high") {
            Some(Population::SeniorHigh)
        } else {
            None
        }
    }

    pub fn strategy(self) -> Strategy {
        match self {
            Population::Elementary | Population::JuniorHigh => Strategy::QuarterMean,
            Population::SeniorHigh => Strategy::SemesterGrouped,
            Population::College => Strategy::TermPairs,
        }
    }
}

/// Every component slot a subject grade record can carry. Which slots matter
/// is the strategy's business; None always means "not recorded", never zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradeComponents {
    pub quarters: [Option<f64>; 4],
    pub semester_pairs: [TermPair; 2],
    pub prelim: Option<f64>,
    pub midterm: Option<f64>,
    pub final_term: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TermPair {
    pub midterm: Option<f64>,
    pub pre_final: Option<f64>,
}

impl TermPair {
    /// Mean of the present halves; None when neither was recorded.
    fn reduce(self) -> Option<f64> {
        mean_of_present(&[self.midterm, self.pre_final])
    }
}

fn mean_of_present(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Closed set of reduction strategies. One per population plus the legacy
/// fallback for records whose level name never matched a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Elementary / junior high: mean of the present quarterly grades.
    QuarterMean,
    /// Senior high: quarters pair into semesters, then mean of semesters.
    SemesterGrouped,
    /// College: per-semester midterm + pre-final pairs, then mean of semesters.
    TermPairs,
    /// Flat mean of whichever of {prelim, midterm, final} exist. Legacy only.
    LegacyFlat,
}

impl Strategy {
    pub fn reduce(self, c: &GradeComponents) -> Option<f64> {
        match self {
            Strategy::QuarterMean => mean_of_present(&c.quarters),
            Strategy::SemesterGrouped => {
                let s1 = mean_of_present(&c.quarters[0..2]);
                let s2 = mean_of_present(&c.quarters[2..4]);
                mean_of_present(&[s1, s2])
            }
            Strategy::TermPairs => {
                let s1 = c.semester_pairs[0].reduce();
                let s2 = c.semester_pairs[1].reduce();
                mean_of_present(&[s1, s2])
            }
            Strategy::LegacyFlat => mean_of_present(&[c.prelim, c.midterm, c.final_term]),
        }
    }
}

/// Overall grade for a record: population strategy when the population is
/// known, the legacy flat mean otherwise.
pub fn overall_grade(population: Option<Population>, c: &GradeComponents) -> Option<f64> {
    match population {
        Some(p) => p.strategy().reduce(c),
        None => Strategy::LegacyFlat.reduce(c),
    }
}

/// Academic-level GPA: mean of the overall subject grades for one school
/// year. Empty input means no GPA, not a GPA of zero.
pub fn gpa(overall_grades: &[f64]) -> Option<f64> {
    if overall_grades.is_empty() {
        None
    } else {
        Some(overall_grades.iter().sum::<f64>() / overall_grades.len() as f64)
    }
}

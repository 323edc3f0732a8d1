use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Threshold used when a course does not set `passing_percentage`.
pub const DEFAULT_PASSING_PERCENTAGE: i64 = 70;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("grading category {category_id} has negative weight {weight}")]
    InvalidWeight { category_id: String, weight: i64 },
    #[error("grading category {category_id} has negative drop count {drop_count}")]
    InvalidDropCount { category_id: String, drop_count: i64 },
    #[error("score {score} for lesson {lesson_id} is outside 0..=1")]
    InvalidScore { lesson_id: String, score: f64 },
    #[error("lesson {lesson_id} does not allow retries")]
    RetryNotAllowed { lesson_id: String },
    #[error("lesson {lesson_id} already used its {max_attempts} attempts")]
    MaxAttemptsReached { lesson_id: String, max_attempts: i64 },
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        match self {
            CalcError::InvalidWeight { .. } => "invalid_weight",
            CalcError::InvalidDropCount { .. } => "invalid_drop_count",
            CalcError::InvalidScore { .. } => "invalid_score",
            CalcError::RetryNotAllowed { .. } => "retry_not_allowed",
            CalcError::MaxAttemptsReached { .. } => "max_attempts_reached",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            CalcError::InvalidWeight {
                category_id,
                weight,
            } => json!({ "categoryId": category_id, "weight": weight }),
            CalcError::InvalidDropCount {
                category_id,
                drop_count,
            } => json!({ "categoryId": category_id, "dropCount": drop_count }),
            CalcError::InvalidScore { lesson_id, score } => {
                json!({ "lessonId": lesson_id, "score": score })
            }
            CalcError::RetryNotAllowed { lesson_id } => json!({ "lessonId": lesson_id }),
            CalcError::MaxAttemptsReached {
                lesson_id,
                max_attempts,
            } => json!({ "lessonId": lesson_id, "maxAttempts": max_attempts }),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_attempts() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingCategory {
    pub id: String,
    #[serde(default, alias = "course_id", skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    pub name: String,
    pub weight: i64,
    #[serde(default, alias = "drop_count")]
    pub drop_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    #[serde(default, alias = "module_id", skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "grading_category_id")]
    pub grading_category_id: Option<String>,
    #[serde(default, alias = "is_graded")]
    pub is_graded: bool,
    #[serde(default, alias = "max_attempts")]
    pub max_attempts: Option<i64>,
    #[serde(default = "default_true", alias = "allow_retry")]
    pub allow_retry: bool,
    #[serde(default, alias = "due_date")]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGrade {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "user_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, alias = "course_id", skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(alias = "lesson_id")]
    pub lesson_id: String,
    pub score: f64,
    #[serde(default = "default_attempts", alias = "attempts_count")]
    pub attempts_count: i64,
    /// RFC 3339 time of the first submission, when the row came from storage.
    #[serde(default, alias = "submitted_at", skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "passing_percentage")]
    pub passing_percentage: Option<i64>,
    #[serde(default, alias = "certificate_template")]
    pub certificate_template: Option<String>,
    #[serde(default, alias = "pacing_mode")]
    pub pacing_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineModule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

/// Published course snapshot: course settings, modules with their lessons, and the
/// grading categories lessons are filed under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseOutline {
    #[serde(default)]
    pub course: CourseInfo,
    #[serde(default)]
    pub modules: Vec<OutlineModule>,
    #[serde(default, alias = "grading_categories")]
    pub grading_categories: Vec<GradingCategory>,
}

impl CourseOutline {
    pub fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.modules.iter().flat_map(|m| m.lessons.iter())
    }

    pub fn find_lesson(&self, lesson_id: &str) -> Option<&Lesson> {
        self.lessons().find(|l| l.id == lesson_id)
    }

    pub fn lesson_count(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightCheck {
    pub total_weight: i64,
    pub balanced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStat {
    pub category_id: String,
    pub name: String,
    pub weight: i64,
    pub drop_count: i64,
    pub count: usize,
    pub completed_count: usize,
    pub dropped_count: usize,
    pub avg_score_pct: f64,
    pub weighted_score_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseGradeSummary {
    pub category_stats: Vec<CategoryStat>,
    pub total_weighted_grade_pct: f64,
    pub orphaned_lesson_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub passing_percentage: i64,
    pub passed: bool,
    pub gap_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateFields {
    pub student_name: String,
    pub course_title: String,
    pub date: String,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseCompletion {
    pub total_lessons: usize,
    pub graded_lessons: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonAnalytics {
    pub lesson_id: String,
    pub lesson_title: String,
    pub average_score: f64,
    pub submission_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortStat {
    /// `YYYY-MM` of the learner's first submission.
    pub period: String,
    pub learner_count: usize,
    pub completed_count: usize,
    pub completion_rate_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseAnalytics {
    pub learner_count: usize,
    pub passed_count: usize,
    pub pass_rate_pct: f64,
    pub average_score: f64,
    pub lessons: Vec<LessonAnalytics>,
    pub cohorts: Vec<CohortStat>,
}

/// Sums category weights. Balanced means exactly 100; anything else, including an
/// empty list, is reported as unbalanced rather than rejected.
pub fn check_category_weights(categories: &[GradingCategory]) -> Result<WeightCheck, CalcError> {
    let mut total_weight = 0_i64;
    for c in categories {
        if c.weight < 0 {
            return Err(CalcError::InvalidWeight {
                category_id: c.id.clone(),
                weight: c.weight,
            });
        }
        if c.drop_count < 0 {
            return Err(CalcError::InvalidDropCount {
                category_id: c.id.clone(),
                drop_count: c.drop_count,
            });
        }
        total_weight = total_weight.saturating_add(c.weight);
    }
    Ok(WeightCheck {
        total_weight,
        balanced: total_weight == 100,
    })
}

pub fn validate_grades(grades: &[UserGrade]) -> Result<(), CalcError> {
    for g in grades {
        if !g.score.is_finite() || !(0.0..=1.0).contains(&g.score) {
            return Err(CalcError::InvalidScore {
                lesson_id: g.lesson_id.clone(),
                score: g.score,
            });
        }
    }
    Ok(())
}

/// Removes the `drop_count` lowest scores before averaging. At least one score is
/// always kept, so a category never averages over nothing once it has a grade.
pub fn drop_lowest_scores(scores: &[f64], drop_count: usize) -> Vec<f64> {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let drop = drop_count.min(sorted.len().saturating_sub(1));
    sorted.split_off(drop)
}

pub fn weighted_score_pct(avg_score_pct: f64, weight: i64) -> f64 {
    (avg_score_pct * weight as f64) / 100.0
}

/// Aggregates one category for one learner. Only graded lessons filed under the
/// category count; grades on any other lesson are ignored.
pub fn aggregate_category<'a, L, G>(
    category: &GradingCategory,
    lessons: L,
    grades: G,
) -> CategoryStat
where
    L: IntoIterator<Item = &'a Lesson>,
    G: IntoIterator<Item = &'a UserGrade>,
{
    let lesson_ids: HashSet<&str> = lessons
        .into_iter()
        .filter(|l| {
            l.is_graded && l.grading_category_id.as_deref() == Some(category.id.as_str())
        })
        .map(|l| l.id.as_str())
        .collect();

    let scores: Vec<f64> = grades
        .into_iter()
        .filter(|g| lesson_ids.contains(g.lesson_id.as_str()))
        .map(|g| g.score)
        .collect();

    let completed_count = scores.len();
    let kept = drop_lowest_scores(&scores, category.drop_count.max(0) as usize);
    let avg_score_pct = if kept.is_empty() {
        0.0
    } else {
        (kept.iter().sum::<f64>() / kept.len() as f64) * 100.0
    };

    CategoryStat {
        category_id: category.id.clone(),
        name: category.name.clone(),
        weight: category.weight,
        drop_count: category.drop_count,
        count: lesson_ids.len(),
        completed_count,
        dropped_count: completed_count - kept.len(),
        avg_score_pct,
        weighted_score_pct: weighted_score_pct(avg_score_pct, category.weight),
    }
}

/// Raw sum of weighted category scores. Not renormalized when weights miss 100.
pub fn weighted_course_grade(stats: &[CategoryStat]) -> f64 {
    stats.iter().map(|s| s.weighted_score_pct).sum()
}

// One row per lesson: the one with the most attempts, later rows winning ties.
fn latest_grade_per_lesson(grades: &[UserGrade]) -> Vec<&UserGrade> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_lesson: HashMap<&str, &UserGrade> = HashMap::new();
    for g in grades {
        let key = g.lesson_id.as_str();
        let replace = by_lesson
            .get(key)
            .map(|prev| prev.attempts_count <= g.attempts_count);
        match replace {
            Some(false) => {}
            Some(true) => {
                by_lesson.insert(key, g);
            }
            None => {
                order.push(key);
                by_lesson.insert(key, g);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_lesson.get(id).copied())
        .collect()
}

/// Full pipeline for one learner in one course. Graded lessons pointing at a
/// category that is not in the outline are counted as orphaned and left out.
pub fn compute_course_grade(outline: &CourseOutline, grades: &[UserGrade]) -> CourseGradeSummary {
    let known: HashSet<&str> = outline
        .grading_categories
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    let orphaned_lesson_count = outline
        .lessons()
        .filter(|l| l.is_graded)
        .filter(|l| {
            l.grading_category_id
                .as_deref()
                .map(|id| !known.contains(id))
                .unwrap_or(false)
        })
        .count();
    if orphaned_lesson_count > 0 {
        tracing::warn!(
            course_id = %outline.course.id,
            orphaned_lesson_count,
            "graded lessons reference unknown grading categories"
        );
    }

    let grades = latest_grade_per_lesson(grades);
    let category_stats: Vec<CategoryStat> = outline
        .grading_categories
        .iter()
        .map(|c| aggregate_category(c, outline.lessons(), grades.iter().copied()))
        .collect();
    let total_weighted_grade_pct = weighted_course_grade(&category_stats);

    CourseGradeSummary {
        category_stats,
        total_weighted_grade_pct,
        orphaned_lesson_count,
    }
}

pub fn resolve_passing_percentage(configured: Option<i64>) -> i64 {
    configured.unwrap_or(DEFAULT_PASSING_PERCENTAGE)
}

pub fn decide_eligibility(
    total_weighted_grade_pct: f64,
    passing_percentage: Option<i64>,
) -> Eligibility {
    let passing_percentage = resolve_passing_percentage(passing_percentage);
    let threshold = passing_percentage as f64;
    Eligibility {
        passing_percentage,
        passed: total_weighted_grade_pct >= threshold,
        gap_pct: (threshold - total_weighted_grade_pct).max(0.0),
    }
}

pub fn certificate_fields(
    student_name: &str,
    course_title: &str,
    date: &str,
    total_weighted_grade_pct: f64,
) -> CertificateFields {
    CertificateFields {
        student_name: student_name.to_string(),
        course_title: course_title.to_string(),
        date: date.to_string(),
        score: total_weighted_grade_pct.round() as i64,
    }
}

/// `existing_attempts` is `None` when the learner has no grade for the lesson yet.
pub fn check_attempt_allowed(
    lesson: &Lesson,
    existing_attempts: Option<i64>,
) -> Result<(), CalcError> {
    let Some(count) = existing_attempts else {
        return Ok(());
    };
    if !lesson.allow_retry {
        return Err(CalcError::RetryNotAllowed {
            lesson_id: lesson.id.clone(),
        });
    }
    if let Some(max_attempts) = lesson.max_attempts {
        if count >= max_attempts {
            return Err(CalcError::MaxAttemptsReached {
                lesson_id: lesson.id.clone(),
                max_attempts,
            });
        }
    }
    Ok(())
}

pub fn course_completion(outline: &CourseOutline, grades: &[UserGrade]) -> CourseCompletion {
    let lesson_ids: HashSet<&str> = outline.lessons().map(|l| l.id.as_str()).collect();
    let graded: HashSet<&str> = grades
        .iter()
        .map(|g| g.lesson_id.as_str())
        .filter(|id| lesson_ids.contains(id))
        .collect();
    let total_lessons = lesson_ids.len();
    CourseCompletion {
        total_lessons,
        graded_lessons: graded.len(),
        completed: total_lessons > 0 && graded.len() >= total_lessons,
    }
}

/// Per-lesson averages across every learner, in outline order. Scores stay fractions.
pub fn lesson_analytics(outline: &CourseOutline, grades: &[UserGrade]) -> Vec<LessonAnalytics> {
    let mut totals: HashMap<&str, (f64, usize)> = HashMap::new();
    for g in grades {
        let entry = totals.entry(g.lesson_id.as_str()).or_insert((0.0, 0));
        entry.0 += g.score;
        entry.1 += 1;
    }
    outline
        .lessons()
        .map(|l| {
            let (sum, count) = totals.get(l.id.as_str()).copied().unwrap_or((0.0, 0));
            LessonAnalytics {
                lesson_id: l.id.clone(),
                lesson_title: l.title.clone(),
                average_score: if count > 0 { sum / count as f64 } else { 0.0 },
                submission_count: count,
            }
        })
        .collect()
}

// Grade rows per learner, learners in first-seen order.
fn grades_by_learner(grades: &[UserGrade]) -> Vec<(&str, Vec<UserGrade>)> {
    let mut learners: Vec<(&str, Vec<UserGrade>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for g in grades {
        let user = g.user_id.as_deref().unwrap_or("");
        let i = *index.entry(user).or_insert_with(|| {
            learners.push((user, Vec::new()));
            learners.len() - 1
        });
        learners[i].1.push(g.clone());
    }
    learners
}

fn percent_of(part: usize, whole: usize) -> f64 {
    if whole > 0 {
        100.0 * part as f64 / whole as f64
    } else {
        0.0
    }
}

/// Groups learners by the month of their first submission and reports how many of
/// each group completed the course. Learners whose rows carry no timestamp are skipped.
pub fn course_cohorts(outline: &CourseOutline, grades: &[UserGrade]) -> Vec<CohortStat> {
    let learners = grades_by_learner(grades);

    // BTreeMap keeps periods in chronological order.
    let mut periods: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (_, own) in &learners {
        let Some(first) = own.iter().filter_map(|g| g.submitted_at.as_deref()).min() else {
            continue;
        };
        let period: String = first.chars().take(7).collect();
        let entry = periods.entry(period).or_insert((0, 0));
        entry.0 += 1;
        if course_completion(outline, own).completed {
            entry.1 += 1;
        }
    }

    periods
        .into_iter()
        .map(|(period, (learner_count, completed_count))| CohortStat {
            period,
            learner_count,
            completed_count,
            completion_rate_pct: percent_of(completed_count, learner_count),
        })
        .collect()
}

/// Course-wide rollup. Every learner's grade goes through [`compute_course_grade`]
/// so the pass rate agrees with what each learner sees.
pub fn course_analytics(outline: &CourseOutline, grades: &[UserGrade]) -> CourseAnalytics {
    let learners = grades_by_learner(grades);

    let passed_count = learners
        .iter()
        .filter(|(_, own)| {
            let summary = compute_course_grade(outline, own);
            decide_eligibility(
                summary.total_weighted_grade_pct,
                outline.course.passing_percentage,
            )
            .passed
        })
        .count();

    let learner_count = learners.len();
    let average_score = if grades.is_empty() {
        0.0
    } else {
        grades.iter().map(|g| g.score).sum::<f64>() / grades.len() as f64
    };

    CourseAnalytics {
        learner_count,
        passed_count,
        pass_rate_pct: percent_of(passed_count, learner_count),
        average_score,
        lessons: lesson_analytics(outline, grades),
        cohorts: course_cohorts(outline, grades),
    }
}

use crate::calc::{
    self, CalcError, CourseGradeSummary, CourseOutline, Eligibility, UserGrade, WeightCheck,
};
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, query_failed, required_json, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

struct GradeReport {
    summary: CourseGradeSummary,
    weight_check: WeightCheck,
    eligibility: Eligibility,
}

// Inputs are validated here, once, before any arithmetic runs.
fn grade_report(outline: &CourseOutline, grades: &[UserGrade]) -> Result<GradeReport, CalcError> {
    let weight_check = calc::check_category_weights(&outline.grading_categories)?;
    calc::validate_grades(grades)?;
    let summary = calc::compute_course_grade(outline, grades);
    let eligibility = calc::decide_eligibility(
        summary.total_weighted_grade_pct,
        outline.course.passing_percentage,
    );
    Ok(GradeReport {
        summary,
        weight_check,
        eligibility,
    })
}

fn load_learner(
    state: &AppState,
    req: &Request,
) -> Result<(CourseOutline, Vec<UserGrade>), serde_json::Value> {
    let user_id = required_str(req, "userId")?;
    let course_id = required_str(req, "courseId")?;
    let conn = db_conn(state, req)?;
    let outline = match db::load_outline(conn, &course_id) {
        Ok(Some(o)) => o,
        Ok(None) => return Err(err(&req.id, "not_found", "course not found", None)),
        Err(e) => return Err(query_failed(req, e)),
    };
    let grades =
        db::load_user_grades(conn, &user_id, &course_id).map_err(|e| query_failed(req, e))?;
    Ok((outline, grades))
}

fn handle_progress_compute(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let outline: CourseOutline = match required_json(req, "outline") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grades: Vec<UserGrade> = if req.params.get("grades").is_some() {
        match required_json(req, "grades") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        Vec::new()
    };

    match grade_report(&outline, &grades) {
        Ok(r) => ok(
            &req.id,
            json!({
                "summary": r.summary,
                "weightCheck": r.weight_check,
                "eligibility": r.eligibility,
            }),
        ),
        Err(e) => calc_err(&req.id, &e),
    }
}

fn handle_progress_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (outline, grades) = match load_learner(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report = match grade_report(&outline, &grades) {
        Ok(r) => r,
        Err(e) => return calc_err(&req.id, &e),
    };
    let completion = calc::course_completion(&outline, &grades);
    ok(
        &req.id,
        json!({
            "courseId": outline.course.id,
            "courseTitle": outline.course.title,
            "summary": report.summary,
            "weightCheck": report.weight_check,
            "eligibility": report.eligibility,
            "completion": completion,
        }),
    )
}

fn handle_certificates_fields(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_name = match required_str(req, "studentName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (outline, grades) = match load_learner(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report = match grade_report(&outline, &grades) {
        Ok(r) => r,
        Err(e) => return calc_err(&req.id, &e),
    };
    if !report.eligibility.passed {
        return ok(
            &req.id,
            json!({
                "eligible": false,
                "eligibility": report.eligibility,
            }),
        );
    }

    let date = optional_str(req, "date")
        .unwrap_or_else(|| chrono::Local::now().date_naive().format("%Y-%m-%d").to_string());
    let fields = calc::certificate_fields(
        &student_name,
        &outline.course.title,
        &date,
        report.summary.total_weighted_grade_pct,
    );
    ok(
        &req.id,
        json!({
            "eligible": true,
            "eligibility": report.eligibility,
            "fields": fields,
            "template": outline.course.certificate_template,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "progress.compute" => Some(handle_progress_compute(state, req)),
        "progress.summary" => Some(handle_progress_summary(state, req)),
        "certificates.fields" => Some(handle_certificates_fields(state, req)),
        _ => None,
    }
}

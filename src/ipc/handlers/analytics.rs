use crate::calc;
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, query_failed, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_analytics_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let outline = match db::load_outline(conn, &course_id) {
        Ok(Some(o)) => o,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return query_failed(req, e),
    };
    let grades = match db::load_course_grades(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    if let Err(e) = calc::check_category_weights(&outline.grading_categories)
        .and_then(|_| calc::validate_grades(&grades))
    {
        return calc_err(&req.id, &e);
    }

    let analytics = calc::course_analytics(&outline, &grades);
    let passing_percentage = calc::resolve_passing_percentage(outline.course.passing_percentage);
    ok(
        &req.id,
        json!({
            "courseId": outline.course.id,
            "passingPercentage": passing_percentage,
            "learnerCount": analytics.learner_count,
            "passedCount": analytics.passed_count,
            "passRatePct": analytics.pass_rate_pct,
            "averageScore": analytics.average_score,
            "lessons": analytics.lessons,
            "cohorts": analytics.cohorts,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.course" => Some(handle_analytics_course(state, req)),
        _ => None,
    }
}

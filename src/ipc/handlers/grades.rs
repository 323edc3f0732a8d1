use crate::calc::{self, UserGrade};
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, query_failed, required_str, write_failed};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_grades_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing score", None);
    };
    let submitted = UserGrade {
        id: None,
        user_id: Some(user_id.clone()),
        course_id: Some(course_id.clone()),
        lesson_id: lesson_id.clone(),
        score,
        attempts_count: 1,
        submitted_at: None,
    };
    if let Err(e) = calc::validate_grades(std::slice::from_ref(&submitted)) {
        return calc_err(&req.id, &e);
    }

    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let outline = match db::load_outline(conn, &course_id) {
        Ok(Some(o)) => o,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return query_failed(req, e),
    };
    let Some(lesson) = outline.find_lesson(&lesson_id) else {
        return err(
            &req.id,
            "not_found",
            "lesson not found in course",
            Some(json!({ "lessonId": lesson_id })),
        );
    };

    let existing = match db::grade_attempts(conn, &user_id, &course_id, &lesson_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    if let Err(e) = calc::check_attempt_allowed(lesson, existing) {
        tracing::info!(
            user_id = %user_id,
            lesson_id = %lesson_id,
            code = e.code(),
            "submission rejected"
        );
        return calc_err(&req.id, &e);
    }

    let grade = match db::upsert_grade(conn, &user_id, &course_id, &lesson_id, score) {
        Ok(g) => g,
        Err(e) => return write_failed(req, e),
    };
    let grades = match db::load_user_grades(conn, &user_id, &course_id) {
        Ok(v) => v,
        Err(e) => return query_failed(req, e),
    };
    let completion = calc::course_completion(&outline, &grades);

    tracing::info!(
        user_id = %user_id,
        course_id = %course_id,
        lesson_id = %lesson_id,
        attempts = grade.attempts_count,
        course_completed = completion.completed,
        "grade recorded"
    );
    ok(
        &req.id,
        json!({
            "grade": grade,
            "courseCompleted": completion.completed,
            "completion": completion,
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::load_user_grades(conn, &user_id, &course_id) {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => query_failed(req, e),
    }
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::delete_grade(conn, &user_id, &course_id, &lesson_id) {
        Ok(deleted) => {
            if deleted {
                tracing::info!(
                    user_id = %user_id,
                    course_id = %course_id,
                    lesson_id = %lesson_id,
                    "grade deleted"
                );
            }
            ok(&req.id, json!({ "deleted": deleted }))
        }
        Err(e) => write_failed(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.submit" => Some(handle_grades_submit(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}

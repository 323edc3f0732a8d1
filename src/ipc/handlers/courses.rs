use crate::calc::{self, CourseOutline, GradingCategory};
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    db_conn, db_conn_mut, query_failed, required_json, required_str, write_failed,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashSet;

fn validate_outline(req: &Request, outline: &CourseOutline) -> Result<(), serde_json::Value> {
    if outline.course.id.trim().is_empty() {
        return Err(err(&req.id, "bad_params", "outline.course.id must not be empty", None));
    }
    if let Some(p) = outline.course.passing_percentage {
        if !(0..=100).contains(&p) {
            return Err(err(
                &req.id,
                "bad_params",
                "passingPercentage must be within 0..=100",
                Some(json!({ "passingPercentage": p })),
            ));
        }
    }

    let mut seen_categories = HashSet::new();
    for c in &outline.grading_categories {
        if c.id.trim().is_empty() || !seen_categories.insert(c.id.as_str()) {
            return Err(err(
                &req.id,
                "bad_params",
                "grading category ids must be unique and non-empty",
                Some(json!({ "categoryId": c.id })),
            ));
        }
    }

    let mut seen_modules = HashSet::new();
    let mut seen_lessons = HashSet::new();
    for m in &outline.modules {
        if m.id.trim().is_empty() || !seen_modules.insert(m.id.as_str()) {
            return Err(err(
                &req.id,
                "bad_params",
                "module ids must be unique and non-empty",
                Some(json!({ "moduleId": m.id })),
            ));
        }
        for l in &m.lessons {
            if l.id.trim().is_empty() || !seen_lessons.insert(l.id.as_str()) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "lesson ids must be unique and non-empty",
                    Some(json!({ "lessonId": l.id })),
                ));
            }
            if matches!(l.max_attempts, Some(n) if n < 1) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "maxAttempts must be at least 1",
                    Some(json!({ "lessonId": l.id })),
                ));
            }
        }
    }
    Ok(())
}

fn handle_courses_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let outline: CourseOutline = match required_json(req, "outline") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = validate_outline(req, &outline) {
        return e;
    }
    let weight_check = match calc::check_category_weights(&outline.grading_categories) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, &e),
    };
    if !weight_check.balanced {
        tracing::warn!(
            course_id = %outline.course.id,
            total_weight = weight_check.total_weight,
            "grading category weights do not sum to 100"
        );
    }

    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = db::replace_outline(conn, &outline) {
        return write_failed(req, e);
    }

    tracing::info!(
        course_id = %outline.course.id,
        categories = outline.grading_categories.len(),
        modules = outline.modules.len(),
        lessons = outline.lesson_count(),
        "course outline published"
    );
    ok(
        &req.id,
        json!({
            "courseId": outline.course.id,
            "categoryCount": outline.grading_categories.len(),
            "moduleCount": outline.modules.len(),
            "lessonCount": outline.lesson_count(),
            "weightCheck": weight_check,
        }),
    )
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };
    match db::list_courses(conn) {
        Ok(rows) => {
            let courses: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "title": c.title,
                        "passingPercentage": calc::resolve_passing_percentage(c.passing_percentage),
                        "categoryCount": c.category_count,
                        "lessonCount": c.lesson_count,
                    })
                })
                .collect();
            ok(&req.id, json!({ "courses": courses }))
        }
        Err(e) => query_failed(req, e),
    }
}

fn handle_courses_outline(state: &mut AppState, req: &Request) -> serde_json::Value {
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match db::load_outline(conn, &course_id) {
        Ok(Some(outline)) => ok(&req.id, json!({ "outline": outline })),
        Ok(None) => err(&req.id, "not_found", "course not found", None),
        Err(e) => query_failed(req, e),
    }
}

fn handle_categories_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let categories: Vec<GradingCategory> = if req.params.get("categories").is_some() {
        match required_json(req, "categories") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        let course_id = match required_str(req, "courseId") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let conn = match db_conn(state, req) {
            Ok(c) => c,
            Err(e) => return e,
        };
        match db::load_outline(conn, &course_id) {
            Ok(Some(outline)) => outline.grading_categories,
            Ok(None) => return err(&req.id, "not_found", "course not found", None),
            Err(e) => return query_failed(req, e),
        }
    };

    match calc::check_category_weights(&categories) {
        Ok(check) => ok(&req.id, json!(check)),
        Err(e) => calc_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.publish" => Some(handle_courses_publish(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.outline" => Some(handle_courses_outline(state, req)),
        "categories.check" => Some(handle_categories_check(state, req)),
        _ => None,
    }
}

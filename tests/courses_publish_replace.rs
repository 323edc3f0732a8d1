use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lmsgraded");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lmsgraded");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn outline(categories: serde_json::Value, lessons: serde_json::Value) -> serde_json::Value {
    json!({
        "course": { "id": "course-pub", "title": "Publishing", "passingPercentage": 60 },
        "gradingCategories": categories,
        "modules": [{ "id": "m1", "title": "Module 1", "lessons": lessons }]
    })
}

#[test]
fn republishing_replaces_categories_and_lessons() {
    let workspace = temp_dir("lmsgraded-publish-replace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let first = outline(
        json!([
            { "id": "c1", "name": "Quizzes", "weight": 30 },
            { "id": "c2", "name": "Labs", "weight": 30 },
            { "id": "c3", "name": "Exams", "weight": 40 }
        ]),
        json!([
            { "id": "l1", "isGraded": true, "gradingCategoryId": "c1" },
            { "id": "l2", "isGraded": true, "gradingCategoryId": "c2" },
            { "id": "l3", "isGraded": true, "gradingCategoryId": "c3" }
        ]),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.publish",
        json!({ "outline": first }),
    );

    let second = outline(
        json!([{ "id": "c1", "name": "Quizzes", "weight": 100, "dropCount": 1 }]),
        json!([{ "id": "l1", "isGraded": true, "gradingCategoryId": "c1", "maxAttempts": 3 }]),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.publish",
        json!({ "outline": second }),
    );

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.outline",
        json!({ "courseId": "course-pub" }),
    );
    let cats = stored["outline"]["gradingCategories"]
        .as_array()
        .expect("categories");
    assert_eq!(cats.len(), 1);
    assert_eq!(cats[0]["dropCount"].as_i64(), Some(1));
    let lessons = stored["outline"]["modules"][0]["lessons"]
        .as_array()
        .expect("lessons");
    assert_eq!(lessons.len(), 1);
    assert_eq!(lessons[0]["maxAttempts"].as_i64(), Some(3));
    assert_eq!(stored["outline"]["course"]["passingPercentage"].as_i64(), Some(60));

    let listed = request_ok(&mut stdin, &mut reader, "5", "courses.list", json!({}));
    let courses = listed["courses"].as_array().expect("courses");
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0]["lessonCount"].as_i64(), Some(1));
    assert_eq!(courses[0]["categoryCount"].as_i64(), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unbalanced_weights_publish_with_a_warning_flag() {
    let workspace = temp_dir("lmsgraded-publish-unbalanced");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let unbalanced = outline(
        json!([
            { "id": "c1", "name": "Quizzes", "weight": 40 },
            { "id": "c2", "name": "Exams", "weight": 50 }
        ]),
        json!([
            { "id": "l1", "isGraded": true, "gradingCategoryId": "c1" },
            { "id": "l2", "isGraded": true, "gradingCategoryId": "c2" }
        ]),
    );
    let published = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.publish",
        json!({ "outline": unbalanced }),
    );
    assert_eq!(published["weightCheck"]["totalWeight"].as_i64(), Some(90));
    assert_eq!(published["weightCheck"]["balanced"].as_bool(), Some(false));

    let check = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "categories.check",
        json!({ "courseId": "course-pub" }),
    );
    assert_eq!(check["balanced"].as_bool(), Some(false));

    let inline = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "categories.check",
        json!({ "categories": [
            { "id": "a", "name": "A", "weight": 25 },
            { "id": "b", "name": "B", "weight": 75 }
        ]}),
    );
    assert_eq!(inline["totalWeight"].as_i64(), Some(100));
    assert_eq!(inline["balanced"].as_bool(), Some(true));

    for (id, lesson) in [("5", "l1"), ("6", "l2")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "grades.submit",
            json!({ "userId": "u", "courseId": "course-pub", "lessonId": lesson, "score": 1.0 }),
        );
    }
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "progress.summary",
        json!({ "userId": "u", "courseId": "course-pub" }),
    );
    // Raw weighted sum, not stretched back to 100.
    let total = summary["summary"]["totalWeightedGradePct"]
        .as_f64()
        .expect("total");
    assert!((total - 90.0).abs() < 1e-9, "got {}", total);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_outlines_are_rejected() {
    let workspace = temp_dir("lmsgraded-publish-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let negative = outline(
        json!([{ "id": "c1", "name": "Quizzes", "weight": -10 }]),
        json!([]),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "courses.publish",
        json!({ "outline": negative }),
    );
    assert_eq!(error_code(&resp), "invalid_weight");

    let duplicate = outline(
        json!([{ "id": "c1", "name": "Quizzes", "weight": 100 }]),
        json!([{ "id": "l1" }, { "id": "l1" }]),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "courses.publish",
        json!({ "outline": duplicate }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let mut no_id = outline(json!([]), json!([]));
    no_id["course"]["id"] = json!("");
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "courses.publish",
        json!({ "outline": no_id }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "courses.outline",
        json!({ "courseId": "does-not-exist" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn lessons_pointing_at_missing_categories_are_left_out() {
    let workspace = temp_dir("lmsgraded-orphan-lessons");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.publish",
        json!({ "outline": outline(
            json!([{ "id": "c1", "name": "Quizzes", "weight": 100 }]),
            json!([{ "id": "l1", "isGraded": true, "gradingCategoryId": "c1" }]),
        )}),
    );

    // A lesson whose category was removed upstream, inserted behind the daemon's back.
    let conn = Connection::open(workspace.join("lmsgraded.sqlite3")).expect("open db");
    conn.execute(
        "INSERT INTO lessons(id, course_id, module_id, title, grading_category_id, is_graded, max_attempts, allow_retry, due_date, position)
         VALUES(?, ?, ?, ?, ?, 1, NULL, 1, NULL, 1)",
        ("l-orphan", "course-pub", "m1", "Orphan", "gone"),
    )
    .expect("insert orphan lesson");
    drop(conn);

    for (id, lesson, score) in [("3", "l1", 0.5), ("4", "l-orphan", 1.0)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "grades.submit",
            json!({ "userId": "u", "courseId": "course-pub", "lessonId": lesson, "score": score }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "progress.summary",
        json!({ "userId": "u", "courseId": "course-pub" }),
    );
    assert_eq!(summary["summary"]["orphanedLessonCount"].as_u64(), Some(1));
    assert_eq!(
        summary["summary"]["categoryStats"][0]["completedCount"].as_u64(),
        Some(1)
    );
    let total = summary["summary"]["totalWeightedGradePct"]
        .as_f64()
        .expect("total");
    assert!((total - 50.0).abs() < 1e-9, "got {}", total);

    drop(stdin);
    let _ = child.wait();
}

fn shared_id_outline(course_id: &str, title: &str, drop_count: i64) -> serde_json::Value {
    json!({
        "course": { "id": course_id, "title": title },
        "gradingCategories": [
            { "id": "quizzes", "name": "Quizzes", "weight": 100, "dropCount": drop_count }
        ],
        "modules": [{
            "id": "m1",
            "title": "Module 1",
            "lessons": [
                { "id": "q1", "title": "Quiz 1", "isGraded": true, "gradingCategoryId": "quizzes" },
                { "id": "q2", "title": "Quiz 2", "isGraded": true, "gradingCategoryId": "quizzes" }
            ]
        }]
    })
}

#[test]
fn courses_reusing_ids_are_stored_independently() {
    let workspace = temp_dir("lmsgraded-shared-ids");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for (id, course, drop_count) in [("2", "course-a", 0), ("3", "course-b", 1)] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "courses.publish",
            json!({ "outline": shared_id_outline(course, course, drop_count) }),
        );
    }

    let submissions = [
        ("4", "course-a", "q1", 0.4),
        ("5", "course-a", "q2", 0.8),
        ("6", "course-b", "q1", 0.4),
        ("7", "course-b", "q2", 0.8),
    ];
    for (id, course, lesson, score) in submissions {
        let submitted = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "grades.submit",
            json!({ "userId": "u", "courseId": course, "lessonId": lesson, "score": score }),
        );
        assert_eq!(submitted["grade"]["attemptsCount"].as_i64(), Some(1));
        assert_eq!(submitted["grade"]["courseId"].as_str(), Some(course));
    }

    // Same lesson ids, different drop rules: 60 without the drop, 80 with it.
    for (id, course, expected) in [("8", "course-a", 60.0), ("9", "course-b", 80.0)] {
        let summary = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "progress.summary",
            json!({ "userId": "u", "courseId": course }),
        );
        let total = summary["summary"]["totalWeightedGradePct"]
            .as_f64()
            .expect("total");
        assert!((total - expected).abs() < 1e-9, "{}: got {}", course, total);
    }

    // Republishing one course leaves the other's outline and grades alone.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "courses.publish",
        json!({ "outline": shared_id_outline("course-a", "Renamed", 1) }),
    );
    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.delete",
        json!({ "userId": "u", "courseId": "course-a", "lessonId": "q1" }),
    );
    assert_eq!(deleted["deleted"].as_bool(), Some(true));

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "courses.outline",
        json!({ "courseId": "course-b" }),
    );
    assert_eq!(other["outline"]["course"]["title"].as_str(), Some("course-b"));
    let lessons = other["outline"]["modules"][0]["lessons"]
        .as_array()
        .expect("lessons");
    assert_eq!(lessons.len(), 2);

    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.list",
        json!({ "userId": "u", "courseId": "course-b" }),
    );
    assert_eq!(kept["grades"].as_array().map(|g| g.len()), Some(2));
    let remaining = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.list",
        json!({ "userId": "u", "courseId": "course-a" }),
    );
    assert_eq!(remaining["grades"].as_array().map(|g| g.len()), Some(1));

    let listed = request_ok(&mut stdin, &mut reader, "15", "courses.list", json!({}));
    assert_eq!(listed["courses"].as_array().map(|c| c.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
}

use crate::calc::{CourseInfo, CourseOutline, GradingCategory, Lesson, OutlineModule, UserGrade};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE: &str = "lmsgraded.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            passing_percentage INTEGER,
            certificate_template TEXT,
            pacing_mode TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_categories(
            id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight INTEGER NOT NULL,
            drop_count INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(course_id, id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS modules(
            id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(course_id, id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    // Category, module and lesson ids are only unique within their course.
    // grading_category_id has no foreign key: a lesson may point at a category the
    // outline no longer carries, and the grading core treats it as orphaned.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            module_id TEXT NOT NULL,
            title TEXT NOT NULL,
            grading_category_id TEXT,
            is_graded INTEGER NOT NULL,
            max_attempts INTEGER,
            allow_retry INTEGER NOT NULL,
            due_date TEXT,
            position INTEGER NOT NULL,
            PRIMARY KEY(course_id, id),
            FOREIGN KEY(course_id, module_id) REFERENCES modules(course_id, id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_module ON lessons(course_id, module_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_grades(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            score REAL NOT NULL,
            attempts_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(user_id, course_id, lesson_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_grades_course ON user_grades(course_id)",
        [],
    )?;

    Ok(conn)
}

#[derive(Debug, Clone)]
pub struct CourseListing {
    pub id: String,
    pub title: String,
    pub passing_percentage: Option<i64>,
    pub category_count: i64,
    pub lesson_count: i64,
}

/// Stores a published outline. Categories, modules and lessons of the course are
/// replaced wholesale; grades are kept.
pub fn replace_outline(conn: &mut Connection, outline: &CourseOutline) -> anyhow::Result<()> {
    let course = &outline.course;
    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO courses(id, title, passing_percentage, certificate_template, pacing_mode, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           passing_percentage = excluded.passing_percentage,
           certificate_template = excluded.certificate_template,
           pacing_mode = excluded.pacing_mode,
           updated_at = excluded.updated_at",
        (
            &course.id,
            &course.title,
            course.passing_percentage,
            &course.certificate_template,
            &course.pacing_mode,
            &now,
        ),
    )
    .context("failed to upsert course")?;

    tx.execute("DELETE FROM lessons WHERE course_id = ?", [&course.id])?;
    tx.execute("DELETE FROM modules WHERE course_id = ?", [&course.id])?;
    tx.execute(
        "DELETE FROM grading_categories WHERE course_id = ?",
        [&course.id],
    )?;

    for (i, c) in outline.grading_categories.iter().enumerate() {
        tx.execute(
            "INSERT INTO grading_categories(id, course_id, name, weight, drop_count, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&c.id, &course.id, &c.name, c.weight, c.drop_count, i as i64),
        )
        .with_context(|| format!("failed to insert grading category {}", c.id))?;
    }

    for (mi, m) in outline.modules.iter().enumerate() {
        tx.execute(
            "INSERT INTO modules(id, course_id, title, position) VALUES(?, ?, ?, ?)",
            (&m.id, &course.id, &m.title, mi as i64),
        )
        .with_context(|| format!("failed to insert module {}", m.id))?;

        for (li, l) in m.lessons.iter().enumerate() {
            tx.execute(
                "INSERT INTO lessons(id, course_id, module_id, title, grading_category_id, is_graded, max_attempts, allow_retry, due_date, position)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &l.id,
                    &course.id,
                    &m.id,
                    &l.title,
                    &l.grading_category_id,
                    l.is_graded as i64,
                    l.max_attempts,
                    l.allow_retry as i64,
                    &l.due_date,
                    li as i64,
                ),
            )
            .with_context(|| format!("failed to insert lesson {}", l.id))?;
        }
    }

    tx.commit()?;
    Ok(())
}

pub fn load_outline(conn: &Connection, course_id: &str) -> anyhow::Result<Option<CourseOutline>> {
    let course: Option<CourseInfo> = conn
        .query_row(
            "SELECT id, title, passing_percentage, certificate_template, pacing_mode
             FROM courses
             WHERE id = ?",
            [course_id],
            |r| {
                Ok(CourseInfo {
                    id: r.get(0)?,
                    title: r.get(1)?,
                    passing_percentage: r.get(2)?,
                    certificate_template: r.get(3)?,
                    pacing_mode: r.get(4)?,
                })
            },
        )
        .optional()?;
    let Some(course) = course else {
        return Ok(None);
    };

    let mut cat_stmt = conn.prepare(
        "SELECT id, course_id, name, weight, drop_count
         FROM grading_categories
         WHERE course_id = ?
         ORDER BY sort_order",
    )?;
    let grading_categories = cat_stmt
        .query_map([course_id], |r| {
            Ok(GradingCategory {
                id: r.get(0)?,
                course_id: r.get(1)?,
                name: r.get(2)?,
                weight: r.get(3)?,
                drop_count: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut mod_stmt = conn.prepare(
        "SELECT id, title FROM modules WHERE course_id = ? ORDER BY position",
    )?;
    let module_rows = mod_stmt
        .query_map([course_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut lesson_stmt = conn.prepare(
        "SELECT id, module_id, title, grading_category_id, is_graded, max_attempts, allow_retry, due_date
         FROM lessons
         WHERE course_id = ? AND module_id = ?
         ORDER BY position",
    )?;
    let mut modules = Vec::with_capacity(module_rows.len());
    for (id, title) in module_rows {
        let lessons = lesson_stmt
            .query_map((course_id, &id), |r| {
                Ok(Lesson {
                    id: r.get(0)?,
                    module_id: r.get(1)?,
                    title: r.get(2)?,
                    grading_category_id: r.get(3)?,
                    is_graded: r.get::<_, i64>(4)? != 0,
                    max_attempts: r.get(5)?,
                    allow_retry: r.get::<_, i64>(6)? != 0,
                    due_date: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        modules.push(OutlineModule { id, title, lessons });
    }

    Ok(Some(CourseOutline {
        course,
        modules,
        grading_categories,
    }))
}

pub fn list_courses(conn: &Connection) -> anyhow::Result<Vec<CourseListing>> {
    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.title,
           c.passing_percentage,
           (SELECT COUNT(*) FROM grading_categories g WHERE g.course_id = c.id),
           (SELECT COUNT(*) FROM lessons l WHERE l.course_id = c.id)
         FROM courses c
         ORDER BY c.title",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CourseListing {
                id: r.get(0)?,
                title: r.get(1)?,
                passing_percentage: r.get(2)?,
                category_count: r.get(3)?,
                lesson_count: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn grade_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserGrade> {
    Ok(UserGrade {
        id: Some(r.get(0)?),
        user_id: Some(r.get(1)?),
        course_id: Some(r.get(2)?),
        lesson_id: r.get(3)?,
        score: r.get(4)?,
        attempts_count: r.get(5)?,
        submitted_at: Some(r.get(6)?),
    })
}

pub fn load_user_grades(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
) -> anyhow::Result<Vec<UserGrade>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, course_id, lesson_id, score, attempts_count, created_at
         FROM user_grades
         WHERE user_id = ? AND course_id = ?
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map((user_id, course_id), grade_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_course_grades(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<UserGrade>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, course_id, lesson_id, score, attempts_count, created_at
         FROM user_grades
         WHERE course_id = ?
         ORDER BY user_id, created_at, id",
    )?;
    let rows = stmt
        .query_map([course_id], grade_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn grade_attempts(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    lesson_id: &str,
) -> anyhow::Result<Option<i64>> {
    let attempts = conn
        .query_row(
            "SELECT attempts_count
             FROM user_grades
             WHERE user_id = ? AND course_id = ? AND lesson_id = ?",
            (user_id, course_id, lesson_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(attempts)
}

/// Creates the grade on first submission; later submissions overwrite the score
/// and bump `attempts_count`.
pub fn upsert_grade(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    lesson_id: &str,
    score: f64,
) -> anyhow::Result<UserGrade> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO user_grades(id, user_id, course_id, lesson_id, score, attempts_count, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(user_id, course_id, lesson_id) DO UPDATE SET
           score = excluded.score,
           attempts_count = user_grades.attempts_count + 1,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            user_id,
            course_id,
            lesson_id,
            score,
            &now,
            &now,
        ),
    )
    .context("failed to upsert grade")?;

    let grade = conn.query_row(
        "SELECT id, user_id, course_id, lesson_id, score, attempts_count, created_at
         FROM user_grades
         WHERE user_id = ? AND course_id = ? AND lesson_id = ?",
        (user_id, course_id, lesson_id),
        grade_from_row,
    )?;
    Ok(grade)
}

pub fn delete_grade(
    conn: &Connection,
    user_id: &str,
    course_id: &str,
    lesson_id: &str,
) -> anyhow::Result<bool> {
    let n = conn.execute(
        "DELETE FROM user_grades WHERE user_id = ? AND course_id = ? AND lesson_id = ?",
        (user_id, course_id, lesson_id),
    )?;
    Ok(n > 0)
}

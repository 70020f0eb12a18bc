use crate::alloc::{EnrollmentStatus, Sex};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let sex = match req
        .params
        .get("sex")
        .and_then(|v| v.as_str())
        .and_then(Sex::parse)
    {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "sex must be 'male' or 'female'", None),
    };
    let strand = match req.params.get("strand").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing strand", None),
    };
    let grade_level = match req.params.get("gradeLevel").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        _ => return err(&req.id, "bad_params", "gradeLevel must be a positive integer", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "duplicate_id",
            format!("student {} is already registered", student_id),
            None,
        );
    }

    let created_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, sex, strand, grade_level, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 'pending', ?)",
        (
            &student_id,
            &last_name,
            &first_name,
            sex.as_str(),
            &strand,
            grade_level,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "status": "pending"
        }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = req.params.get("status") {
        if !v.is_null() {
            let Some(status) = v.as_str().and_then(EnrollmentStatus::parse) else {
                return err(&req.id, "bad_params", "status must be 'pending' or 'enrolled'", None);
            };
            clauses.push("status = ?");
            binds.push(Value::Text(status.as_str().to_string()));
        }
    }
    if let Some(strand) = req.params.get("strand").and_then(|v| v.as_str()) {
        clauses.push("strand = ?");
        binds.push(Value::Text(strand.trim().to_string()));
    }
    if let Some(grade) = req.params.get("gradeLevel").and_then(|v| v.as_i64()) {
        clauses.push("grade_level = ?");
        binds.push(Value::Integer(grade));
    }
    if let Some(section_id) = req.params.get("sectionId").and_then(|v| v.as_str()) {
        clauses.push("section_id = ?");
        binds.push(Value::Text(section_id.to_string()));
    }

    let mut sql = String::from(
        "SELECT id, last_name, first_name, sex, strand, grade_level, section_id, status, enrolled_at
         FROM students",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY last_name, first_name, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let sex: String = row.get(3)?;
            let strand: String = row.get(4)?;
            let grade_level: i64 = row.get(5)?;
            let section_id: Option<String> = row.get(6)?;
            let status: String = row.get(7)?;
            let enrolled_at: Option<String> = row.get(8)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "sex": sex,
                "strand": strand,
                "gradeLevel": grade_level,
                "sectionId": section_id,
                "status": status,
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let status: Option<String> = match conn
        .query_row(
            "SELECT status FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if EnrollmentStatus::parse(&status) != Some(EnrollmentStatus::Pending) {
        // Changing sex or cohort underneath an enrolled student would break
        // the section's quota accounting.
        return err(
            &req.id,
            "bad_state",
            "only pending students can be edited; unenroll first",
            None,
        );
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("lastName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.lastName must be a non-empty string", None);
        };
        sets.push("last_name = ?");
        binds.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("firstName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.firstName must be a non-empty string", None);
        };
        sets.push("first_name = ?");
        binds.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("sex") {
        let Some(sex) = v.as_str().and_then(Sex::parse) else {
            return err(&req.id, "bad_params", "patch.sex must be 'male' or 'female'", None);
        };
        sets.push("sex = ?");
        binds.push(Value::Text(sex.as_str().to_string()));
    }
    if let Some(v) = patch.get("strand") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(&req.id, "bad_params", "patch.strand must be a non-empty string", None);
        };
        sets.push("strand = ?");
        binds.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("gradeLevel") {
        let Some(g) = v.as_i64().filter(|g| *g > 0) else {
            return err(&req.id, "bad_params", "patch.gradeLevel must be a positive integer", None);
        };
        sets.push("grade_level = ?");
        binds.push(Value::Integer(g));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    binds.push(Value::Text(student_id.clone()));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let status: Option<String> = match conn
        .query_row(
            "SELECT status FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if EnrollmentStatus::parse(&status) != Some(EnrollmentStatus::Pending) {
        return err(
            &req.id,
            "bad_state",
            "enrolled students must be unenrolled before deletion",
            None,
        );
    }

    if let Err(e) = conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_unenroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let status: Option<String> = match conn
        .query_row(
            "SELECT status FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if EnrollmentStatus::parse(&status) != Some(EnrollmentStatus::Enrolled) {
        return err(&req.id, "bad_state", "student is not enrolled", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE students SET section_id = NULL, status = 'pending', enrolled_at = NULL
         WHERE id = ?",
        [&student_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    tracing::info!(student = %student_id, "unenrolled");
    ok(
        &req.id,
        json!({ "studentId": student_id, "status": "pending" }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.unenroll" => Some(handle_students_unenroll(state, req)),
        _ => None,
    }
}

use crate::alloc::{Allocator, EnrollmentStatus, Section, Student};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::repo::{self, SqliteSections, SqliteStudents, StudentRepository};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;

fn section_json(section: &Section) -> serde_json::Value {
    json!({
        "id": section.id,
        "name": section.name,
        "strand": section.strand,
        "gradeLevel": section.grade_level,
        "maxCapacity": section.max_capacity
    })
}

fn handle_enroll_single(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let student = match repo::load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student.status == EnrollmentStatus::Enrolled {
        return err(
            &req.id,
            "bad_state",
            format!("student {} is already enrolled", student_id),
            None,
        );
    }

    let sections = SqliteSections { conn };
    let students = SqliteStudents { conn };
    let allocator = Allocator::new(&sections, &students);

    let section = match allocator.allocate(&student) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    let enrolled_at = Utc::now().to_rfc3339();
    if let Err(e) = students.set_section_and_enroll(&student_id, &section.id, &enrolled_at) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    tracing::info!(student = %student_id, section = %section.name, "enrolled");
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "section": section_json(&section),
            "enrolledAt": enrolled_at
        }),
    )
}

enum BatchEntry {
    Ready(Student),
    Failed { code: &'static str, message: String },
}

fn handle_enroll_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(raw_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds array", None);
    };
    let mut ids: Vec<String> = Vec::with_capacity(raw_ids.len());
    for v in raw_ids {
        match v.as_str() {
            Some(s) => ids.push(s.to_string()),
            None => return err(&req.id, "bad_params", "studentIds must be strings", None),
        }
    }

    // Resolve each id up front. A student that cannot be resolved gets a
    // per-item error and does not consume a seat; the rest of the batch
    // proceeds in the caller's order.
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries: Vec<BatchEntry> = Vec::with_capacity(ids.len());
    for id in &ids {
        if !seen.insert(id.clone()) {
            entries.push(BatchEntry::Failed {
                code: "duplicate_id",
                message: format!("student {} is listed more than once in this batch", id),
            });
            continue;
        }
        match repo::load_student(conn, id) {
            Ok(Some(s)) if s.status == EnrollmentStatus::Enrolled => {
                entries.push(BatchEntry::Failed {
                    code: "bad_state",
                    message: format!("student {} is already enrolled", id),
                });
            }
            Ok(Some(s)) => entries.push(BatchEntry::Ready(s)),
            Ok(None) => entries.push(BatchEntry::Failed {
                code: "not_found",
                message: format!("student {} not found", id),
            }),
            Err(e) => entries.push(BatchEntry::Failed {
                code: "db_query_failed",
                message: e.to_string(),
            }),
        }
    }

    let ready: Vec<Student> = entries
        .iter()
        .filter_map(|e| match e {
            BatchEntry::Ready(s) => Some(s.clone()),
            BatchEntry::Failed { .. } => None,
        })
        .collect();

    let sections = SqliteSections { conn };
    let students = SqliteStudents { conn };
    let allocator = Allocator::new(&sections, &students);
    let decisions = allocator.allocate_batch(&ready);

    let enrolled_at = Utc::now().to_rfc3339();
    let mut decisions = decisions.into_iter();
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(ids.len());
    let mut assigned = 0usize;

    for (id, entry) in ids.iter().zip(&entries) {
        match entry {
            BatchEntry::Failed { code, message } => {
                results.push(json!({
                    "studentId": id,
                    "ok": false,
                    "error": { "code": code, "message": message }
                }));
            }
            BatchEntry::Ready(_) => {
                let Some(item) = decisions.next() else {
                    results.push(json!({
                        "studentId": id,
                        "ok": false,
                        "error": {
                            "code": "rule_violation",
                            "message": "allocation produced no decision for this student"
                        }
                    }));
                    continue;
                };
                let student_id = item.student_id;
                match item.outcome {
                    Ok(section) => {
                        match students.set_section_and_enroll(&student_id, &section.id, &enrolled_at)
                        {
                            Ok(()) => {
                                assigned += 1;
                                results.push(json!({
                                    "studentId": student_id,
                                    "ok": true,
                                    "section": section_json(&section),
                                    "enrolledAt": enrolled_at
                                }));
                            }
                            Err(e) => {
                                results.push(json!({
                                    "studentId": student_id,
                                    "ok": false,
                                    "error": { "code": "db_update_failed", "message": e.to_string() }
                                }));
                            }
                        }
                    }
                    Err(e) => {
                        results.push(json!({
                            "studentId": student_id,
                            "ok": false,
                            "error": { "code": e.code(), "message": e.to_string() }
                        }));
                    }
                }
            }
        }
    }

    tracing::info!(requested = ids.len(), assigned, "batch enrollment finished");
    ok(
        &req.id,
        json!({
            "results": results,
            "assignedCount": assigned
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enroll.single" => Some(handle_enroll_single(state, req)),
        "enroll.batch" => Some(handle_enroll_batch(state, req)),
        _ => None,
    }
}

use crate::alloc::{self, Cohort};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::repo::{SectionRepository, SqliteSections};
use rusqlite::OptionalExtension;
use serde_json::json;

fn cohort_from_params(req: &Request) -> Result<Cohort, serde_json::Value> {
    let strand = match req.params.get("strand").and_then(|v| v.as_str()) {
        Some(v) => v,
        None => return Err(err(&req.id, "bad_params", "missing strand", None)),
    };
    let grade_level = match req.params.get("gradeLevel").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return Err(err(&req.id, "bad_params", "missing gradeLevel", None)),
    };
    Cohort::new(strand, grade_level)
        .map_err(|e| err(&req.id, e.code(), e.to_string(), None))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cohort = match cohort_from_params(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    // Correlated subqueries keep one row per section and count only
    // enrolled students, same as the allocator sees them.
    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.max_capacity,
           (SELECT COUNT(*) FROM students st
             WHERE st.section_id = s.id AND st.sex = 'male' AND st.status = 'enrolled'),
           (SELECT COUNT(*) FROM students st
             WHERE st.section_id = s.id AND st.sex = 'female' AND st.status = 'enrolled')
         FROM sections s
         WHERE s.strand = ? AND s.grade_level = ?
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&cohort.strand, cohort.grade_level), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let max_capacity: i64 = row.get(2)?;
            let male_count: i64 = row.get(3)?;
            let female_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "maxCapacity": max_capacity,
                "maleCount": male_count,
                "femaleCount": female_count,
                "totalCount": male_count + female_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(
            &req.id,
            json!({
                "strand": cohort.strand,
                "gradeLevel": cohort.grade_level,
                "sections": sections
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cohort = match cohort_from_params(req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let sections = SqliteSections { conn };
    let existing = match sections.list_by_cohort(&cohort) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing_names: Vec<String> = existing.iter().map(|s| s.name.clone()).collect();

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(raw) => {
            let name = raw.trim().to_ascii_uppercase();
            if name.len() != 1 || !name.as_bytes()[0].is_ascii_uppercase() {
                return err(
                    &req.id,
                    "bad_params",
                    "name must be a single letter A-Z",
                    None,
                );
            }
            if existing_names.iter().any(|n| *n == name) {
                return err(
                    &req.id,
                    "duplicate_id",
                    format!("section {} already exists for cohort {}", name, cohort),
                    None,
                );
            }
            name
        }
        None => match alloc::next_section_name(&existing_names) {
            Some(n) => n,
            None => {
                return err(
                    &req.id,
                    "capacity_exhausted",
                    format!("all 26 section letters are in use for cohort {}", cohort),
                    None,
                )
            }
        },
    };

    match sections.create(&cohort, &name, alloc::SECTION_CAPACITY) {
        Ok(section) => ok(
            &req.id,
            json!({
                "sectionId": section.id,
                "name": section.name,
                "strand": section.strand,
                "gradeLevel": section.grade_level,
                "maxCapacity": section.max_capacity
            }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sections" })),
        ),
    }
}

fn handle_sections_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };

    let header: Option<(String, String, i64)> = match conn
        .query_row(
            "SELECT name, strand, grade_level FROM sections WHERE id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, strand, grade_level)) = header else {
        return err(&req.id, "not_found", "section not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, sex, enrolled_at
         FROM students
         WHERE section_id = ? AND status = 'enrolled'
         ORDER BY last_name, first_name, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&section_id], |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let sex: String = row.get(3)?;
            let enrolled_at: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "sex": sex,
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(
            &req.id,
            json!({
                "sectionId": section_id,
                "name": name,
                "strand": strand,
                "gradeLevel": grade_level,
                "students": students
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.list" => Some(handle_sections_list(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.roster" => Some(handle_sections_roster(state, req)),
        _ => None,
    }
}

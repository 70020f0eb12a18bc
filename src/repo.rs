use anyhow::Context;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::alloc::{Cohort, EnrollmentStatus, Section, Sex, Student};

/// Read/write access to the section pool of a cohort. Creation order equals
/// name order, so `list_by_cohort` returning name order is also the scan
/// order the allocator wants.
pub trait SectionRepository {
    fn list_by_cohort(&self, cohort: &Cohort) -> anyhow::Result<Vec<Section>>;
    fn create(&self, cohort: &Cohort, name: &str, max_capacity: i64) -> anyhow::Result<Section>;
}

/// The two student operations the enrollment flow needs: live per-sex counts
/// (enrolled students only) and the single mutation that records an
/// allocation decision.
pub trait StudentRepository {
    fn count_by_sex_in_section(&self, section_id: &str, sex: Sex) -> anyhow::Result<i64>;
    fn set_section_and_enroll(
        &self,
        student_id: &str,
        section_id: &str,
        timestamp: &str,
    ) -> anyhow::Result<()>;
}

pub struct SqliteSections<'a> {
    pub conn: &'a Connection,
}

pub struct SqliteStudents<'a> {
    pub conn: &'a Connection,
}

impl SectionRepository for SqliteSections<'_> {
    fn list_by_cohort(&self, cohort: &Cohort) -> anyhow::Result<Vec<Section>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, strand, grade_level, name, max_capacity
             FROM sections
             WHERE strand = ? AND grade_level = ?
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map((&cohort.strand, cohort.grade_level), |row| {
                Ok(Section {
                    id: row.get(0)?,
                    strand: row.get(1)?,
                    grade_level: row.get(2)?,
                    name: row.get(3)?,
                    max_capacity: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn create(&self, cohort: &Cohort, name: &str, max_capacity: i64) -> anyhow::Result<Section> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sections(id, strand, grade_level, name, max_capacity, created_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &cohort.strand,
                    cohort.grade_level,
                    name,
                    max_capacity,
                    &created_at,
                ),
            )
            .with_context(|| format!("insert section {} for cohort {}", name, cohort))?;
        Ok(Section {
            id,
            strand: cohort.strand.clone(),
            grade_level: cohort.grade_level,
            name: name.to_string(),
            max_capacity,
        })
    }
}

impl StudentRepository for SqliteStudents<'_> {
    fn count_by_sex_in_section(&self, section_id: &str, sex: Sex) -> anyhow::Result<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM students
             WHERE section_id = ? AND sex = ? AND status = 'enrolled'",
            (section_id, sex.as_str()),
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn set_section_and_enroll(
        &self,
        student_id: &str,
        section_id: &str,
        timestamp: &str,
    ) -> anyhow::Result<()> {
        let n = self.conn.execute(
            "UPDATE students
             SET section_id = ?, status = 'enrolled', enrolled_at = ?
             WHERE id = ?",
            (section_id, timestamp, student_id),
        )?;
        anyhow::ensure!(n == 1, "student {} not found", student_id);
        Ok(())
    }
}

pub fn load_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<Student>> {
    type Row = (
        String,
        String,
        String,
        String,
        String,
        i64,
        Option<String>,
        String,
        Option<String>,
    );
    let raw: Option<Row> = conn
        .query_row(
            "SELECT id, last_name, first_name, sex, strand, grade_level,
                    section_id, status, enrolled_at
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                ))
            },
        )
        .optional()?;

    let Some((id, last_name, first_name, sex, strand, grade_level, section_id, status, enrolled_at)) =
        raw
    else {
        return Ok(None);
    };

    let sex = Sex::parse(&sex).with_context(|| format!("student {}: bad sex '{}'", id, sex))?;
    let status = EnrollmentStatus::parse(&status)
        .with_context(|| format!("student {}: bad status '{}'", id, status))?;

    Ok(Some(Student {
        id,
        last_name,
        first_name,
        sex,
        strand,
        grade_level,
        section_id,
        status,
        enrolled_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn
    }

    fn insert_student(conn: &Connection, id: &str, sex: &str) {
        conn.execute(
            "INSERT INTO students(id, last_name, first_name, sex, strand, grade_level, status)
             VALUES(?, 'Reyes', 'Ana', ?, 'STEM', 11, 'pending')",
            (id, sex),
        )
        .expect("insert student");
    }

    #[test]
    fn sections_round_trip_in_name_order() {
        let conn = test_conn();
        let sections = SqliteSections { conn: &conn };
        let cohort = Cohort::new("STEM", 11).expect("cohort");

        sections.create(&cohort, "B", 45).expect("create B");
        sections.create(&cohort, "A", 45).expect("create A");
        let other = Cohort::new("ABM", 11).expect("cohort");
        sections.create(&other, "A", 45).expect("create other A");

        let listed = sections.list_by_cohort(&cohort).expect("list");
        let names: Vec<&str> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn counts_only_cover_enrolled_students() {
        let conn = test_conn();
        let sections = SqliteSections { conn: &conn };
        let students = SqliteStudents { conn: &conn };
        let cohort = Cohort::new("STEM", 11).expect("cohort");
        let section = sections.create(&cohort, "A", 45).expect("create");

        insert_student(&conn, "s1", "female");
        insert_student(&conn, "s2", "female");
        students
            .set_section_and_enroll("s1", &section.id, "2026-06-01T08:00:00Z")
            .expect("enroll s1");

        let females = students
            .count_by_sex_in_section(&section.id, Sex::Female)
            .expect("count");
        assert_eq!(females, 1);

        let s1 = load_student(&conn, "s1").expect("load").expect("exists");
        assert_eq!(s1.status, EnrollmentStatus::Enrolled);
        assert_eq!(s1.section_id.as_deref(), Some(section.id.as_str()));
        assert_eq!(s1.enrolled_at.as_deref(), Some("2026-06-01T08:00:00Z"));

        let s2 = load_student(&conn, "s2").expect("load").expect("exists");
        assert_eq!(s2.status, EnrollmentStatus::Pending);
        assert!(s2.section_id.is_none());
    }

    #[test]
    fn enrolling_a_missing_student_fails() {
        let conn = test_conn();
        let students = SqliteStudents { conn: &conn };
        let res = students.set_section_and_enroll("ghost", "sec", "2026-06-01T08:00:00Z");
        assert!(res.is_err());
    }
}

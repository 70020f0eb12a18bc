use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::repo::{SectionRepository, StudentRepository};

/// Seats per section, fixed for every section in this domain.
pub const SECTION_CAPACITY: i64 = 45;
/// Per-section ceiling on enrolled male students.
pub const MALE_QUOTA: i64 = 23;
/// Per-section ceiling on enrolled female students.
pub const FEMALE_QUOTA: i64 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
        }
    }

    pub fn parse(s: &str) -> Option<Sex> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Sex::Male),
            "female" => Some(Sex::Female),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Pending,
    Enrolled,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Enrolled => "enrolled",
        }
    }

    pub fn parse(s: &str) -> Option<EnrollmentStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(EnrollmentStatus::Pending),
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            _ => None,
        }
    }
}

/// A (strand, grade level) pair. Sections and the students they admit always
/// belong to exactly one cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cohort {
    pub strand: String,
    pub grade_level: i64,
}

impl Cohort {
    /// Blank strands and non-positive grade levels do not resolve to any
    /// section pool.
    pub fn new(strand: &str, grade_level: i64) -> Result<Cohort, AllocError> {
        let strand = strand.trim();
        if strand.is_empty() || grade_level <= 0 {
            return Err(AllocError::NotFound(format!(
                "no cohort for strand '{}' grade {}",
                strand, grade_level
            )));
        }
        Ok(Cohort {
            strand: strand.to_string(),
            grade_level,
        })
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.strand, self.grade_level)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub sex: Sex,
    pub strand: String,
    pub grade_level: i64,
    pub section_id: Option<String>,
    pub status: EnrollmentStatus,
    pub enrolled_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub strand: String,
    pub grade_level: i64,
    pub name: String,
    pub max_capacity: i64,
}

#[derive(Debug)]
pub enum AllocError {
    /// Unresolvable cohort or missing student. Recoverable, reported per
    /// student.
    NotFound(String),
    /// The backing store failed. Propagated so the caller can retry the
    /// student.
    Repository(anyhow::Error),
    /// All 26 section letters are taken for the cohort. Needs manual
    /// intervention.
    CapacityExhausted(Cohort),
    /// Internal invariant broken. Should never surface.
    RuleViolation(String),
}

impl AllocError {
    pub fn code(&self) -> &'static str {
        match self {
            AllocError::NotFound(_) => "not_found",
            AllocError::Repository(_) => "repository_error",
            AllocError::CapacityExhausted(_) => "capacity_exhausted",
            AllocError::RuleViolation(_) => "rule_violation",
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NotFound(msg) => write!(f, "{}", msg),
            AllocError::Repository(e) => write!(f, "repository failure: {}", e),
            AllocError::CapacityExhausted(cohort) => {
                write!(f, "all 26 section letters are in use for cohort {}", cohort)
            }
            AllocError::RuleViolation(msg) => write!(f, "admission rule violation: {}", msg),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Repository(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Whether a section with the given enrolled counts admits one more student
/// of the given sex.
///
/// The checks run in a fixed order: total capacity first, then the incoming
/// sex's own quota, then a cross-sex re-check on the admission that would
/// land exactly on the quota. The re-check cannot fire once the capacity
/// gate has passed; it stays so the clause order matches the enrollment
/// office's published rule verbatim.
pub fn can_admit(current_males: i64, current_females: i64, incoming: Sex) -> bool {
    if current_males + current_females >= SECTION_CAPACITY {
        return false;
    }
    match incoming {
        Sex::Male => {
            if current_males >= MALE_QUOTA {
                return false;
            }
            if current_males + 1 == MALE_QUOTA && current_females > FEMALE_QUOTA {
                return false;
            }
        }
        Sex::Female => {
            if current_females >= FEMALE_QUOTA {
                return false;
            }
            if current_females + 1 == FEMALE_QUOTA && current_males > MALE_QUOTA {
                return false;
            }
        }
    }
    true
}

/// Lowest letter A..Z not present in `existing`, or None when all 26 are
/// taken. Only single-letter names participate; anything else is ignored.
pub fn next_section_name(existing: &[String]) -> Option<String> {
    for letter in b'A'..=b'Z' {
        let taken = existing.iter().any(|name| {
            let name = name.trim();
            name.len() == 1 && name.as_bytes()[0].to_ascii_uppercase() == letter
        });
        if !taken {
            return Some((letter as char).to_string());
        }
    }
    None
}

/// Decides section placement against the two repositories. The allocator
/// only decides; persisting the student's section and status is the
/// caller's job, so a decision can be unit-tested (and retried) without a
/// live store. Section creation is the one write it performs itself.
///
/// Callers must not run two allocations for the same cohort concurrently:
/// each decision reads counts that the previous decision's persist is
/// expected to have settled.
pub struct Allocator<'a> {
    sections: &'a dyn SectionRepository,
    students: &'a dyn StudentRepository,
}

/// One in-flight batch. Decisions made through the same run see the seats
/// taken by every earlier decision in the run, on top of what the store
/// already holds. Dropping the run between students abandons nothing:
/// decisions already handed out stay valid.
pub struct BatchRun<'a, 'b> {
    alloc: &'b Allocator<'a>,
    // seats handed out by this run, not yet visible in the store
    taken: HashMap<String, (i64, i64)>,
}

#[derive(Debug)]
pub struct BatchItem {
    pub student_id: String,
    pub outcome: Result<Section, AllocError>,
}

impl<'a> Allocator<'a> {
    pub fn new(
        sections: &'a dyn SectionRepository,
        students: &'a dyn StudentRepository,
    ) -> Allocator<'a> {
        Allocator { sections, students }
    }

    /// Pick the section for one student: first section of the cohort, in
    /// creation order, that admits them; otherwise the next letter is
    /// opened and returned.
    pub fn allocate(&self, student: &Student) -> Result<Section, AllocError> {
        self.batch().allocate(student)
    }

    pub fn batch(&self) -> BatchRun<'a, '_> {
        BatchRun {
            alloc: self,
            taken: HashMap::new(),
        }
    }

    /// Allocate a whole batch strictly in input order. Each decision sees
    /// the post-allocation counts of every earlier student in the batch, so
    /// the result is exactly what N single allocations with persistence in
    /// between would produce. One student's failure is recorded in place
    /// and does not abort the rest.
    pub fn allocate_batch(&self, students: &[Student]) -> Vec<BatchItem> {
        let mut run = self.batch();
        students
            .iter()
            .map(|student| BatchItem {
                student_id: student.id.clone(),
                outcome: run.allocate(student),
            })
            .collect()
    }

    fn enrolled_counts(&self, section_id: &str) -> Result<(i64, i64), AllocError> {
        let males = self
            .students
            .count_by_sex_in_section(section_id, Sex::Male)
            .map_err(AllocError::Repository)?;
        let females = self
            .students
            .count_by_sex_in_section(section_id, Sex::Female)
            .map_err(AllocError::Repository)?;
        if males < 0 || females < 0 {
            return Err(AllocError::RuleViolation(format!(
                "negative enrolled count for section {}: {} male / {} female",
                section_id, males, females
            )));
        }
        Ok((males, females))
    }
}

impl BatchRun<'_, '_> {
    pub fn allocate(&mut self, student: &Student) -> Result<Section, AllocError> {
        let cohort = Cohort::new(&student.strand, student.grade_level)?;
        let sections = self
            .alloc
            .sections
            .list_by_cohort(&cohort)
            .map_err(AllocError::Repository)?;

        for section in &sections {
            let (males, females) = self.alloc.enrolled_counts(&section.id)?;
            let (extra_m, extra_f) = self
                .taken
                .get(section.id.as_str())
                .copied()
                .unwrap_or((0, 0));
            if can_admit(males + extra_m, females + extra_f, student.sex) {
                self.take_seat(&section.id, student.sex);
                return Ok(section.clone());
            }
        }

        // No existing section admits this student; open the next letter.
        let names: Vec<String> = sections.iter().map(|s| s.name.clone()).collect();
        let Some(name) = next_section_name(&names) else {
            return Err(AllocError::CapacityExhausted(cohort));
        };
        let created = self
            .alloc
            .sections
            .create(&cohort, &name, SECTION_CAPACITY)
            .map_err(AllocError::Repository)?;
        tracing::info!(
            cohort = %cohort,
            section = %created.name,
            "opened new section"
        );
        self.take_seat(&created.id, student.sex);
        Ok(created)
    }

    fn take_seat(&mut self, section_id: &str, sex: Sex) {
        let entry = self.taken.entry(section_id.to_string()).or_insert((0, 0));
        match sex {
            Sex::Male => entry.0 += 1,
            Sex::Female => entry.1 += 1,
        }
    }
}

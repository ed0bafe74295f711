//! Derived enrollment state.
//!
//! `recompute` is the only place completion flags are revalidated: every
//! mutation of an enrollment ends by calling it, so a flag whose precondition
//! no longer holds is dropped in the same commit that broke it.

use serde::Serialize;
use uuid::Uuid;

use crate::models::{Enrollment, Module};
use crate::outline::CourseOutline;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ModuleProgress {
    pub module_id: Uuid,
    pub title: String,
    pub completed_lessons: usize,
    pub total_lessons: usize,
    pub is_completed: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub enrollment_id: Uuid,
    pub course_id: Uuid,
    pub progress_percent: u8,
    pub completed_lessons: usize,
    pub total_lessons: usize,
    pub is_completed: bool,
    pub modules: Vec<ModuleProgress>,
}

/// Rounded to the nearest integer, halves up; 0 for an empty course.
pub fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total);
    ((completed * 200 + total) / (total * 2)) as u8
}

pub fn module_done(enrollment: &Enrollment, module: &Module) -> bool {
    !module.lessons.is_empty()
        && module
            .lessons
            .iter()
            .all(|l| enrollment.completed_lessons.contains(&l.id))
}

pub fn course_done(enrollment: &Enrollment, outline: &CourseOutline) -> bool {
    !outline.modules.is_empty()
        && outline
            .modules
            .iter()
            .all(|m| enrollment.completed_modules.contains(&m.id))
}

fn completed_in_course(enrollment: &Enrollment, outline: &CourseOutline) -> usize {
    outline
        .lessons()
        .filter(|l| enrollment.completed_lessons.contains(&l.id))
        .count()
}

/// Recomputes `progress_percent` and revokes stale completion flags.
pub fn recompute(enrollment: &mut Enrollment, outline: &CourseOutline) {
    let still_done: Vec<Uuid> = outline
        .modules
        .iter()
        .filter(|m| enrollment.completed_modules.contains(&m.id) && module_done(enrollment, m))
        .map(|m| m.id)
        .collect();
    enrollment
        .completed_modules
        .retain(|id| still_done.contains(id));

    if enrollment.is_completed && !course_done(enrollment, outline) {
        enrollment.is_completed = false;
        enrollment.completed_at = None;
    }

    enrollment.progress_percent = percent(
        completed_in_course(enrollment, outline),
        outline.total_lessons(),
    );
}

pub fn report(enrollment: &Enrollment, outline: &CourseOutline) -> ProgressReport {
    let modules = outline
        .modules
        .iter()
        .map(|m| ModuleProgress {
            module_id: m.id,
            title: m.title.clone(),
            completed_lessons: m
                .lessons
                .iter()
                .filter(|l| enrollment.completed_lessons.contains(&l.id))
                .count(),
            total_lessons: m.lessons.len(),
            is_completed: enrollment.completed_modules.contains(&m.id),
        })
        .collect();

    ProgressReport {
        enrollment_id: enrollment.id,
        course_id: enrollment.course_id,
        progress_percent: enrollment.progress_percent,
        completed_lessons: completed_in_course(enrollment, outline),
        total_lessons: outline.total_lessons(),
        is_completed: enrollment.is_completed,
        modules,
    }
}

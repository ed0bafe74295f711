//! Read-only course graph supplied by the content-management side.
//!
//! An outline is stored as one snapshot and replaced wholesale on every
//! ingest; enrollments and certificates never reference it by pointer, only
//! by id.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::LearningError;
use crate::models::{Lesson, LessonKind, Module, Quiz};

/// Upper bound for a quiz's summed points and a course's summed minutes, so
/// both fit the signed integer columns they are persisted in.
pub const MAX_TOTAL: u32 = i32::MAX as u32;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CourseOutline {
    pub id: Uuid,
    pub title: String,
    pub modules: Vec<Module>,
}

impl CourseOutline {
    pub fn module(&self, module_id: Uuid) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == module_id)
    }

    /// Lesson together with the module that owns it.
    pub fn lesson(&self, lesson_id: Uuid) -> Option<(&Module, &Lesson)> {
        self.modules.iter().find_map(|m| {
            m.lessons
                .iter()
                .find(|l| l.id == lesson_id)
                .map(|l| (m, l))
        })
    }

    pub fn quiz(&self, quiz_id: Uuid) -> Option<&Quiz> {
        self.lessons()
            .filter_map(|l| l.quiz.as_ref())
            .find(|q| q.id == quiz_id)
    }

    pub fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.modules.iter().flat_map(|m| m.lessons.iter())
    }

    pub fn total_lessons(&self) -> usize {
        self.modules.iter().map(|m| m.lessons.len()).sum()
    }

    pub fn total_minutes(&self) -> u32 {
        self.lessons()
            .fold(0u32, |acc, l| acc.saturating_add(l.duration_minutes))
    }

    pub fn quiz_ids(&self) -> Vec<Uuid> {
        self.lessons()
            .filter_map(|l| l.quiz.as_ref().map(|q| q.id))
            .collect()
    }

    /// Sorts modules and lessons by `order` and checks the structural rules
    /// the progress state machine relies on.
    pub fn normalize(mut self) -> Result<Self, LearningError> {
        let mut ids = HashSet::new();
        let mut module_orders = HashSet::new();

        self.modules.sort_by_key(|m| m.order);
        for module in self.modules.iter_mut() {
            if !ids.insert(module.id) {
                return Err(invalid(format!("duplicate id {}", module.id)));
            }
            if !module_orders.insert(module.order) {
                return Err(invalid(format!(
                    "module order {} used twice",
                    module.order
                )));
            }

            module.lessons.sort_by_key(|l| l.order);
            let mut lesson_orders = HashSet::new();
            for lesson in &module.lessons {
                if !ids.insert(lesson.id) {
                    return Err(invalid(format!("duplicate id {}", lesson.id)));
                }
                if !lesson_orders.insert(lesson.order) {
                    return Err(invalid(format!(
                        "lesson order {} used twice in module {}",
                        lesson.order, module.id
                    )));
                }
                check_lesson(lesson, &mut ids)?;
            }
        }

        let minutes = self
            .lessons()
            .try_fold(0u32, |acc, l| acc.checked_add(l.duration_minutes))
            .filter(|m| *m <= MAX_TOTAL)
            .ok_or_else(|| invalid("total course duration is too large".into()))?;
        tracing::debug!(course_id = %self.id, minutes, "outline normalized");
        Ok(self)
    }
}

fn check_lesson(lesson: &Lesson, ids: &mut HashSet<Uuid>) -> Result<(), LearningError> {
    let quiz = match (lesson.kind, &lesson.quiz) {
        (LessonKind::Quiz, Some(quiz)) => quiz,
        (LessonKind::Quiz, None) => {
            return Err(invalid(format!("quiz lesson {} has no quiz", lesson.id)))
        }
        (_, Some(_)) => {
            return Err(invalid(format!(
                "lesson {} carries a quiz but is not quiz-type",
                lesson.id
            )))
        }
        (_, None) => return Ok(()),
    };

    if !ids.insert(quiz.id) {
        return Err(invalid(format!("duplicate id {}", quiz.id)));
    }
    for q in &quiz.questions {
        if !ids.insert(q.id) {
            return Err(invalid(format!("duplicate id {}", q.id)));
        }
        if q.options.len() < 2 {
            return Err(invalid(format!("question {} needs at least two options", q.id)));
        }
        if q.correct_option_index >= q.options.len() {
            return Err(invalid(format!("question {} correct index out of range", q.id)));
        }
        if q.points == 0 {
            return Err(invalid(format!("question {} must be worth at least one point", q.id)));
        }
    }
    let total_points = quiz
        .questions
        .iter()
        .try_fold(0u32, |acc, q| acc.checked_add(q.points))
        .filter(|p| *p <= MAX_TOTAL)
        .ok_or_else(|| invalid(format!("quiz {} is worth too many points", quiz.id)))?;
    if quiz.passing_score > total_points {
        return Err(invalid(format!(
            "quiz {} passing score {} exceeds total points {}",
            quiz.id, quiz.passing_score, total_points
        )));
    }
    Ok(())
}

fn invalid(msg: String) -> LearningError {
    LearningError::InvalidOutline(msg)
}

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::LearningError;
use crate::grader::QuizGrader;
use crate::models::{Enrollment, LessonKind};
use crate::outline::CourseOutline;
use crate::progress::{self, ProgressReport};
use crate::store::{Store, StoreError};

/// Owns the enrollment aggregate. Every mutation loads the record and its
/// course outline, applies one change, runs the progress recompute and commits
/// with the version it read, all while holding that enrollment's lock.
pub struct EnrollmentManager {
    store: Arc<dyn Store>,
    grader: Arc<QuizGrader>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// Held for the duration of one mutation. Dropping it releases the lock and
/// removes the map entry once no other task holds or waits on it.
struct EnrollmentGuard<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    enrollment_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EnrollmentGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.enrollment_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn Store>, grader: Arc<QuizGrader>) -> Self {
        Self {
            store,
            grader,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, enrollment_id: Uuid) -> EnrollmentGuard<'_> {
        let lock = self.locks.entry(enrollment_id).or_default().clone();
        EnrollmentGuard {
            locks: &self.locks,
            enrollment_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, enrollment_id: Uuid) -> Result<(Enrollment, CourseOutline), LearningError> {
        let enrollment = self
            .store
            .enrollment(enrollment_id)
            .await?
            .ok_or(LearningError::NotEnrolled)?;
        let outline = self
            .store
            .outline(enrollment.course_id)
            .await?
            .ok_or(LearningError::CourseNotFound(enrollment.course_id))?;
        Ok((enrollment, outline))
    }

    /// Runs `apply` on a locked, freshly loaded enrollment.
    async fn mutate<F>(&self, enrollment_id: Uuid, apply: F) -> Result<Enrollment, LearningError>
    where
        F: FnOnce(&mut Enrollment, &CourseOutline) -> Result<(), LearningError>,
    {
        let _guard = self.lock(enrollment_id).await;
        let (enrollment, outline) = self.load(enrollment_id).await?;
        self.commit(enrollment, &outline, apply).await
    }

    /// Applies one change plus the progress recompute and writes it back with
    /// the version that was read. Caller must hold the enrollment lock.
    /// Nothing is written when the aggregate comes out unchanged.
    async fn commit<F>(
        &self,
        mut enrollment: Enrollment,
        outline: &CourseOutline,
        apply: F,
    ) -> Result<Enrollment, LearningError>
    where
        F: FnOnce(&mut Enrollment, &CourseOutline) -> Result<(), LearningError>,
    {
        let before = enrollment.clone();
        apply(&mut enrollment, outline)?;
        progress::recompute(&mut enrollment, outline);

        if enrollment == before {
            return Ok(enrollment);
        }
        Ok(self.store.update_enrollment(&enrollment).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn enroll(&self, student_id: Uuid, course_id: Uuid) -> Result<Enrollment, LearningError> {
        if self.store.student(student_id).await?.is_none() {
            return Err(LearningError::StudentNotFound(student_id));
        }
        if self.store.outline(course_id).await?.is_none() {
            return Err(LearningError::CourseNotFound(course_id));
        }

        let enrollment = Enrollment::new(student_id, course_id);
        match self.store.insert_enrollment(&enrollment).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(LearningError::AlreadyEnrolled {
                    student_id,
                    course_id,
                })
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(enrollment_id=%enrollment.id, "student enrolled");
        Ok(enrollment)
    }

    pub async fn get(&self, enrollment_id: Uuid) -> Result<Enrollment, LearningError> {
        self.store
            .enrollment(enrollment_id)
            .await?
            .ok_or(LearningError::NotEnrolled)
    }

    pub async fn list_for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>, LearningError> {
        Ok(self.store.enrollments_for_student(student_id).await?)
    }

    pub async fn progress(&self, enrollment_id: Uuid) -> Result<ProgressReport, LearningError> {
        let (enrollment, outline) = self.load(enrollment_id).await?;
        Ok(progress::report(&enrollment, &outline))
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_lesson(
        &self,
        enrollment_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Enrollment, LearningError> {
        let _guard = self.lock(enrollment_id).await;
        let (enrollment, outline) = self.load(enrollment_id).await?;
        let (_, lesson) = outline
            .lesson(lesson_id)
            .ok_or(LearningError::LessonNotInCourse(lesson_id))?;

        if enrollment.completed_lessons.contains(&lesson_id) {
            return Ok(enrollment);
        }

        if lesson.kind == LessonKind::Quiz {
            let quiz_id = lesson
                .quiz
                .as_ref()
                .map(|q| q.id)
                .ok_or(LearningError::QuizNotPassed(lesson_id))?;
            let passed = self
                .grader
                .latest_attempt(quiz_id, enrollment.student_id)
                .await?
                .is_some_and(|a| a.passed);
            if !passed {
                return Err(LearningError::QuizNotPassed(quiz_id));
            }
        }

        let updated = self
            .commit(enrollment, &outline, |e, _| {
                e.completed_lessons.insert(lesson_id);
                Ok(())
            })
            .await?;
        tracing::info!(progress = updated.progress_percent, "lesson completed");
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub async fn reset_lesson(
        &self,
        enrollment_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Enrollment, LearningError> {
        let updated = self
            .mutate(enrollment_id, |e, outline| {
                let (module, _) = outline
                    .lesson(lesson_id)
                    .ok_or(LearningError::LessonNotInCourse(lesson_id))?;
                if e.completed_lessons.remove(&lesson_id) {
                    e.completed_modules.remove(&module.id);
                    e.is_completed = false;
                    e.completed_at = None;
                }
                Ok(())
            })
            .await?;
        tracing::info!(progress = updated.progress_percent, "lesson reset");
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_module(
        &self,
        enrollment_id: Uuid,
        module_id: Uuid,
    ) -> Result<Enrollment, LearningError> {
        self.mutate(enrollment_id, |e, outline| {
            let module = outline
                .module(module_id)
                .ok_or(LearningError::ModuleNotInCourse(module_id))?;
            if !progress::module_done(e, module) {
                return Err(LearningError::ModuleIncomplete(module_id));
            }
            if e.completed_modules.insert(module_id) {
                tracing::info!("module completed");
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_course(&self, enrollment_id: Uuid) -> Result<Enrollment, LearningError> {
        self.mutate(enrollment_id, |e, outline| {
            if !progress::course_done(e, outline) {
                return Err(LearningError::CourseIncomplete);
            }
            if !e.is_completed {
                e.is_completed = true;
                e.completed_at = Some(Utc::now());
                tracing::info!("course completed");
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quiz, Student};
    use crate::outline::fixtures;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    struct Harness {
        manager: Arc<EnrollmentManager>,
        grader: Arc<QuizGrader>,
        outline: CourseOutline,
        student_id: Uuid,
    }

    async fn harness(outline: CourseOutline) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.put_outline(&outline).await.unwrap();
        let student = Student {
            id: Uuid::new_v4(),
            full_name: "Ada Lovelace".into(),
        };
        store.put_student(&student).await.unwrap();
        let grader = Arc::new(QuizGrader::new(store.clone()));
        Harness {
            manager: Arc::new(EnrollmentManager::new(store, grader.clone())),
            grader,
            outline,
            student_id: student.id,
        }
    }

    fn answers(quiz: &Quiz, correct: bool) -> BTreeMap<Uuid, usize> {
        quiz.questions
            .iter()
            .map(|q| {
                let pick = if correct { q.correct_option_index } else { q.correct_option_index + 1 };
                (q.id, pick)
            })
            .collect()
    }

    fn assert_invariants(e: &Enrollment, outline: &CourseOutline) {
        for m in &outline.modules {
            if e.completed_modules.contains(&m.id) {
                assert!(m.lessons.iter().all(|l| e.completed_lessons.contains(&l.id)));
            }
        }
        if e.is_completed {
            assert!(outline.modules.iter().all(|m| e.completed_modules.contains(&m.id)));
        }
    }

    #[tokio::test]
    async fn enroll_twice_fails() {
        let h = harness(fixtures::two_modules()).await;
        h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let err = h.manager.enroll(h.student_id, h.outline.id).await.unwrap_err();
        assert!(matches!(err, LearningError::AlreadyEnrolled { .. }));
    }

    #[tokio::test]
    async fn enroll_unknown_course_or_student() {
        let h = harness(fixtures::two_modules()).await;
        let err = h.manager.enroll(h.student_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LearningError::CourseNotFound(_)));
        let err = h.manager.enroll(Uuid::new_v4(), h.outline.id).await.unwrap_err();
        assert!(matches!(err, LearningError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_enrollment_is_not_enrolled() {
        let h = harness(fixtures::two_modules()).await;
        let lesson = h.outline.modules[0].lessons[0].id;
        let err = h.manager.complete_lesson(Uuid::new_v4(), lesson).await.unwrap_err();
        assert!(matches!(err, LearningError::NotEnrolled));
    }

    #[tokio::test]
    async fn complete_lesson_is_idempotent() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let lesson = h.outline.modules[0].lessons[0].id;

        let once = h.manager.complete_lesson(e.id, lesson).await.unwrap();
        let twice = h.manager.complete_lesson(e.id, lesson).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.completed_lessons.len(), 1);
        assert_eq!(twice.progress_percent, 33);
    }

    #[tokio::test]
    async fn foreign_lesson_and_module_are_rejected() {
        let h = harness(fixtures::two_modules()).await;
        let other = fixtures::single_module_with_quiz();
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();

        let err = h
            .manager
            .complete_lesson(e.id, other.modules[0].lessons[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::LessonNotInCourse(_)));

        let err = h
            .manager
            .complete_module(e.id, other.modules[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::ModuleNotInCourse(_)));
    }

    #[tokio::test]
    async fn reset_of_foreign_lesson_is_rejected() {
        let h = harness(fixtures::two_modules()).await;
        let other = fixtures::two_modules();
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let err = h
            .manager
            .reset_lesson(e.id, other.modules[0].lessons[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::LessonNotInCourse(_)));
    }

    #[tokio::test]
    async fn complete_module_twice_is_a_noop() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let m2 = &h.outline.modules[1];
        h.manager.complete_lesson(e.id, m2.lessons[0].id).await.unwrap();

        let once = h.manager.complete_module(e.id, m2.id).await.unwrap();
        let twice = h.manager.complete_module(e.id, m2.id).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.completed_modules.len(), 1);
        assert!(h.manager.locks.is_empty());
    }

    #[tokio::test]
    async fn course_without_modules_never_completes() {
        let mut outline = fixtures::two_modules();
        outline.modules.clear();
        let h = harness(outline).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        assert_eq!(e.progress_percent, 0);

        let err = h.manager.complete_course(e.id).await.unwrap_err();
        assert!(matches!(err, LearningError::CourseIncomplete));
    }

    #[tokio::test]
    async fn module_and_course_need_their_children() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let m1 = &h.outline.modules[0];

        h.manager.complete_lesson(e.id, m1.lessons[0].id).await.unwrap();
        let err = h.manager.complete_module(e.id, m1.id).await.unwrap_err();
        assert!(matches!(err, LearningError::ModuleIncomplete(id) if id == m1.id));

        h.manager.complete_lesson(e.id, m1.lessons[1].id).await.unwrap();
        let e1 = h.manager.complete_module(e.id, m1.id).await.unwrap();
        assert!(e1.completed_modules.contains(&m1.id));

        let err = h.manager.complete_course(e.id).await.unwrap_err();
        assert!(matches!(err, LearningError::CourseIncomplete));
    }

    #[tokio::test]
    async fn reset_cascades_through_module_and_course() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        for l in h.outline.lessons() {
            h.manager.complete_lesson(e.id, l.id).await.unwrap();
        }
        for m in &h.outline.modules {
            h.manager.complete_module(e.id, m.id).await.unwrap();
        }
        let done = h.manager.complete_course(e.id).await.unwrap();
        assert!(done.is_completed);
        assert!(done.completed_at.is_some());

        let again = h.manager.complete_course(e.id).await.unwrap();
        assert_eq!(again.completed_at, done.completed_at);

        let reset = h
            .manager
            .reset_lesson(e.id, h.outline.modules[0].lessons[0].id)
            .await
            .unwrap();
        assert!(!reset.is_completed);
        assert!(reset.completed_at.is_none());
        assert!(!reset.completed_modules.contains(&h.outline.modules[0].id));
        assert!(reset.completed_modules.contains(&h.outline.modules[1].id));
        assert_eq!(reset.progress_percent, 67);
        assert_invariants(&reset, &h.outline);

        let noop = h
            .manager
            .reset_lesson(e.id, h.outline.modules[0].lessons[0].id)
            .await
            .unwrap();
        assert_eq!(noop, reset);
    }

    #[tokio::test]
    async fn quiz_scenario_end_to_end() {
        let h = harness(fixtures::single_module_with_quiz()).await;
        let module = &h.outline.modules[0];
        let (video, quiz_lesson) = (&module.lessons[0], &module.lessons[1]);
        let quiz = quiz_lesson.quiz.clone().unwrap();
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();

        h.manager.complete_lesson(e.id, video.id).await.unwrap();
        let err = h.manager.complete_lesson(e.id, quiz_lesson.id).await.unwrap_err();
        assert!(matches!(err, LearningError::QuizNotPassed(_)));

        let attempt = h
            .grader
            .submit(quiz.id, h.student_id, answers(&quiz, true))
            .await
            .unwrap();
        assert!(attempt.passed);

        h.manager.complete_lesson(e.id, quiz_lesson.id).await.unwrap();
        h.manager.complete_module(e.id, module.id).await.unwrap();
        let done = h.manager.complete_course(e.id).await.unwrap();
        assert!(done.is_completed);
        assert_eq!(done.progress_percent, 100);
        assert_invariants(&done, &h.outline);
    }

    #[tokio::test]
    async fn only_latest_attempt_gates() {
        let h = harness(fixtures::single_module_with_quiz()).await;
        let quiz_lesson = &h.outline.modules[0].lessons[1];
        let quiz = quiz_lesson.quiz.clone().unwrap();
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();

        h.grader.submit(quiz.id, h.student_id, answers(&quiz, true)).await.unwrap();
        h.grader.submit(quiz.id, h.student_id, answers(&quiz, false)).await.unwrap();

        let err = h.manager.complete_lesson(e.id, quiz_lesson.id).await.unwrap_err();
        assert!(matches!(err, LearningError::QuizNotPassed(id) if id == quiz.id));
    }

    #[tokio::test]
    async fn concurrent_mutations_keep_invariants() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        let lessons: Vec<Uuid> = h.outline.lessons().map(|l| l.id).collect();

        let mut tasks = Vec::new();
        for round in 0..4 {
            for lesson in &lessons {
                let (manager, lesson, id) = (h.manager.clone(), *lesson, e.id);
                tasks.push(tokio::spawn(async move {
                    if round % 2 == 0 {
                        manager.complete_lesson(id, lesson).await
                    } else {
                        manager.reset_lesson(id, lesson).await
                    }
                }));
            }
            for module in &h.outline.modules {
                let (manager, module, id) = (h.manager.clone(), module.id, e.id);
                tasks.push(tokio::spawn(async move { manager.complete_module(id, module).await }));
            }
        }
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) | Err(LearningError::ModuleIncomplete(_)) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }

        let last = h.manager.get(e.id).await.unwrap();
        assert_invariants(&last, &h.outline);
        assert!(h.manager.locks.is_empty());
        let expected = progress::percent(last.completed_lessons.len(), lessons.len());
        assert_eq!(last.progress_percent, expected);
    }

    #[tokio::test]
    async fn progress_report_lists_modules() {
        let h = harness(fixtures::two_modules()).await;
        let e = h.manager.enroll(h.student_id, h.outline.id).await.unwrap();
        h.manager
            .complete_lesson(e.id, h.outline.modules[1].lessons[0].id)
            .await
            .unwrap();
        h.manager
            .complete_module(e.id, h.outline.modules[1].id)
            .await
            .unwrap();

        let report = h.manager.progress(e.id).await.unwrap();
        assert_eq!(report.total_lessons, 3);
        assert_eq!(report.modules.len(), 2);
        assert!(report.modules[1].is_completed);
        assert!(!report.modules[0].is_completed);

        let listed = h.manager.list_for_student(h.student_id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}

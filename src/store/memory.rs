use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::models::{Certificate, Enrollment, NewQuizAttempt, QuizAttempt, Student};
use crate::outline::CourseOutline;

/// Process-local store, used when no `DATABASE_URL` is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    outlines: HashMap<Uuid, CourseOutline>,
    quiz_courses: HashMap<Uuid, Uuid>,
    students: HashMap<Uuid, Student>,
    enrollments: HashMap<Uuid, Enrollment>,
    // (student, course) -> enrollment
    enrollment_keys: HashMap<(Uuid, Uuid), Uuid>,
    // (quiz, student) -> attempts in submission order
    attempts: HashMap<(Uuid, Uuid), Vec<QuizAttempt>>,
    certificates: HashMap<Uuid, Certificate>,
    // enrollment -> certificate
    certificate_keys: HashMap<Uuid, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_outline(&self, outline: &CourseOutline) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let quiz_ids = outline.quiz_ids();
        if let Some(taken) = quiz_ids.iter().find(|id| {
            inner
                .quiz_courses
                .get(*id)
                .is_some_and(|course| *course != outline.id)
        }) {
            return Err(StoreError::QuizOwned(*taken));
        }
        inner.quiz_courses.retain(|_, course| *course != outline.id);
        for quiz_id in quiz_ids {
            inner.quiz_courses.insert(quiz_id, outline.id);
        }
        inner.outlines.insert(outline.id, outline.clone());
        Ok(())
    }

    async fn outline(&self, course_id: Uuid) -> Result<Option<CourseOutline>, StoreError> {
        Ok(self.inner.read().await.outlines.get(&course_id).cloned())
    }

    async fn outline_for_quiz(&self, quiz_id: Uuid) -> Result<Option<CourseOutline>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .quiz_courses
            .get(&quiz_id)
            .and_then(|course| inner.outlines.get(course))
            .cloned())
    }

    async fn put_student(&self, student: &Student) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .students
            .insert(student.id, student.clone());
        Ok(())
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<Student>, StoreError> {
        Ok(self.inner.read().await.students.get(&student_id).cloned())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (enrollment.student_id, enrollment.course_id);
        if inner.enrollment_keys.contains_key(&key) {
            return Err(StoreError::Duplicate("enrollment"));
        }
        inner.enrollment_keys.insert(key, enrollment.id);
        inner.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.inner.read().await.enrollments.get(&enrollment_id).cloned())
    }

    async fn enrollment_for(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .enrollment_keys
            .get(&(student_id, course_id))
            .and_then(|id| inner.enrollments.get(id))
            .cloned())
    }

    async fn enrollments_for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Enrollment> = inner
            .enrollments
            .values()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.enrolled_at);
        Ok(out)
    }

    async fn update_enrollment(&self, enrollment: &Enrollment) -> Result<Enrollment, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or(StoreError::VersionConflict(enrollment.id))?;
        if stored.version != enrollment.version {
            return Err(StoreError::VersionConflict(enrollment.id));
        }
        let mut next = enrollment.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn insert_attempt(&self, attempt: NewQuizAttempt) -> Result<QuizAttempt, StoreError> {
        let mut inner = self.inner.write().await;
        let list = inner
            .attempts
            .entry((attempt.quiz_id, attempt.student_id))
            .or_default();
        let rec = QuizAttempt {
            id: Uuid::new_v4(),
            quiz_id: attempt.quiz_id,
            student_id: attempt.student_id,
            attempt_number: list.len() as u32 + 1,
            answers: attempt.answers,
            results: attempt.results,
            score: attempt.score,
            total_score: attempt.total_score,
            passed: attempt.passed,
            submitted_at: Utc::now(),
        };
        list.push(rec.clone());
        Ok(rec)
    }

    async fn latest_attempt(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<QuizAttempt>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .get(&(quiz_id, student_id))
            .and_then(|list| list.last())
            .cloned())
    }

    async fn attempts(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .get(&(quiz_id, student_id))
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_certificate(&self, certificate: &Certificate) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.certificate_keys.contains_key(&certificate.enrollment_id) {
            return Err(StoreError::Duplicate("certificate"));
        }
        inner
            .certificate_keys
            .insert(certificate.enrollment_id, certificate.id);
        inner.certificates.insert(certificate.id, certificate.clone());
        Ok(())
    }

    async fn certificate(&self, certificate_id: Uuid) -> Result<Option<Certificate>, StoreError> {
        Ok(self.inner.read().await.certificates.get(&certificate_id).cloned())
    }

    async fn certificate_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Option<Certificate>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .certificate_keys
            .get(&enrollment_id)
            .and_then(|id| inner.certificates.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::fixtures;

    #[tokio::test]
    async fn quiz_stays_with_the_course_that_owns_it() {
        let store = MemoryStore::new();
        let first = fixtures::single_module_with_quiz();
        let quiz_id = first.quiz_ids()[0];
        store.put_outline(&first).await.unwrap();

        let mut second = first.clone();
        second.id = Uuid::new_v4();
        let err = store.put_outline(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::QuizOwned(id) if id == quiz_id));
        assert!(store.outline(second.id).await.unwrap().is_none());

        let owner = store.outline_for_quiz(quiz_id).await.unwrap().unwrap();
        assert_eq!(owner.id, first.id);

        // re-ingesting the owner is an update, not a clash
        store.put_outline(&first).await.unwrap();
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let enrollment = Enrollment::new(Uuid::new_v4(), Uuid::new_v4());
        store.insert_enrollment(&enrollment).await.unwrap();

        let committed = store.update_enrollment(&enrollment).await.unwrap();
        assert_eq!(committed.version, 1);

        let err = store.update_enrollment(&enrollment).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(id) if id == enrollment.id));
    }

    #[tokio::test]
    async fn one_enrollment_per_pair() {
        let store = MemoryStore::new();
        let first = Enrollment::new(Uuid::new_v4(), Uuid::new_v4());
        let second = Enrollment::new(first.student_id, first.course_id);
        store.insert_enrollment(&first).await.unwrap();
        assert!(matches!(
            store.insert_enrollment(&second).await,
            Err(StoreError::Duplicate("enrollment"))
        ));
    }

    #[tokio::test]
    async fn attempts_are_numbered_and_listed_newest_first() {
        let store = MemoryStore::new();
        let (quiz_id, student_id) = (Uuid::new_v4(), Uuid::new_v4());
        for passed in [false, true] {
            store
                .insert_attempt(NewQuizAttempt {
                    quiz_id,
                    student_id,
                    answers: Default::default(),
                    results: vec![],
                    score: 0,
                    total_score: 0,
                    passed,
                })
                .await
                .unwrap();
        }
        let list = store.attempts(quiz_id, student_id).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].attempt_number, 2);
        assert!(list[0].passed);
        let latest = store.latest_attempt(quiz_id, student_id).await.unwrap().unwrap();
        assert_eq!(latest.id, list[0].id);
    }
}

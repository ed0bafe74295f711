//! Persistence seam for outlines, students, enrollments, attempts and
//! certificates.
//!
//! Two rules every implementation upholds:
//! - `update_enrollment` commits only if the stored `version` still equals the
//!   caller's, and bumps it by one.
//! - at most one certificate exists per enrollment; a second insert fails with
//!   [`StoreError::Duplicate`].
//! - a quiz id belongs to one course; `put_outline` leaves the store untouched
//!   and fails with [`StoreError::QuizOwned`] when another course already has it.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Certificate, Enrollment, NewQuizAttempt, QuizAttempt, Student};
use crate::outline::CourseOutline;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error("quiz {0} belongs to another course")]
    QuizOwned(Uuid),
    #[error("version conflict on enrollment {0}")]
    VersionConflict(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_outline(&self, outline: &CourseOutline) -> Result<(), StoreError>;
    async fn outline(&self, course_id: Uuid) -> Result<Option<CourseOutline>, StoreError>;
    /// Outline of the course whose lessons own `quiz_id`.
    async fn outline_for_quiz(&self, quiz_id: Uuid) -> Result<Option<CourseOutline>, StoreError>;

    async fn put_student(&self, student: &Student) -> Result<(), StoreError>;
    async fn student(&self, student_id: Uuid) -> Result<Option<Student>, StoreError>;

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;
    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError>;
    async fn enrollment_for(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError>;
    async fn enrollments_for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>, StoreError>;
    /// Returns the committed record with its new version.
    async fn update_enrollment(&self, enrollment: &Enrollment) -> Result<Enrollment, StoreError>;

    async fn insert_attempt(&self, attempt: NewQuizAttempt) -> Result<QuizAttempt, StoreError>;
    async fn latest_attempt(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<QuizAttempt>, StoreError>;
    /// Newest first.
    async fn attempts(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError>;

    async fn insert_certificate(&self, certificate: &Certificate) -> Result<(), StoreError>;
    async fn certificate(&self, certificate_id: Uuid) -> Result<Option<Certificate>, StoreError>;
    async fn certificate_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Option<Certificate>, StoreError>;
}

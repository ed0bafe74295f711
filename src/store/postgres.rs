use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{query, query_as, query_scalar};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::db::Db;
use crate::models::{
    Certificate, Enrollment, NewQuizAttempt, QuestionResult, QuizAttempt, Student,
};
use crate::outline::CourseOutline;

// concurrent submissions for the same (quiz, student) race on attempt_number
const ATTEMPT_INSERT_RETRIES: usize = 3;

pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    completed_lessons: Vec<Uuid>,
    completed_modules: Vec<Uuid>,
    is_completed: bool,
    completed_at: Option<DateTime<Utc>>,
    progress_percent: i16,
    enrolled_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(r: EnrollmentRow) -> Result<Self, Self::Error> {
        Ok(Enrollment {
            id: r.id,
            student_id: r.student_id,
            course_id: r.course_id,
            completed_lessons: r.completed_lessons.into_iter().collect(),
            completed_modules: r.completed_modules.into_iter().collect(),
            is_completed: r.is_completed,
            completed_at: r.completed_at,
            progress_percent: u8::try_from(r.progress_percent)
                .map_err(|_| StoreError::Corrupt(format!("progress {}", r.progress_percent)))?,
            enrolled_at: r.enrolled_at,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    quiz_id: Uuid,
    student_id: Uuid,
    attempt_number: i32,
    answers: Json<BTreeMap<Uuid, usize>>,
    results: Json<Vec<QuestionResult>>,
    score: i32,
    total_score: i32,
    passed: bool,
    submitted_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for QuizAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> Result<Self, Self::Error> {
        Ok(QuizAttempt {
            id: r.id,
            quiz_id: r.quiz_id,
            student_id: r.student_id,
            attempt_number: unsigned(r.attempt_number)?,
            answers: r.answers.0,
            results: r.results.0,
            score: unsigned(r.score)?,
            total_score: unsigned(r.total_score)?,
            passed: r.passed,
            submitted_at: r.submitted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    enrollment_id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    student_name: String,
    course_title: String,
    total_minutes: i32,
    total_hours: f64,
    issued_at: DateTime<Utc>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = StoreError;

    fn try_from(r: CertificateRow) -> Result<Self, Self::Error> {
        Ok(Certificate {
            id: r.id,
            enrollment_id: r.enrollment_id,
            student_id: r.student_id,
            course_id: r.course_id,
            student_name: r.student_name,
            course_title: r.course_title,
            total_minutes: unsigned(r.total_minutes)?,
            total_hours: r.total_hours,
            issued_at: r.issued_at,
        })
    }
}

fn unsigned(v: i32) -> Result<u32, StoreError> {
    u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative value {v}")))
}

fn signed(v: u32) -> Result<i32, StoreError> {
    i32::try_from(v).map_err(|_| StoreError::Corrupt(format!("value {v} out of range")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const ENROLLMENT_COLUMNS: &str = "id, student_id, course_id, completed_lessons, completed_modules, \
     is_completed, completed_at, progress_percent, enrolled_at, version";

const ATTEMPT_COLUMNS: &str = "id, quiz_id, student_id, attempt_number, answers, results, \
     score, total_score, passed, submitted_at";

#[async_trait]
impl Store for PgStore {
    async fn put_outline(&self, outline: &CourseOutline) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        query(
            r#"
            INSERT INTO course_outlines (id, title, outline)
            VALUES ($1,$2,$3)
            ON CONFLICT (id)
            DO UPDATE SET title=EXCLUDED.title, outline=EXCLUDED.outline, updated_at=now()
            "#,
        )
        .bind(outline.id)
        .bind(&outline.title)
        .bind(Json(outline))
        .execute(&mut *tx)
        .await?;

        query("DELETE FROM outline_quizzes WHERE course_id=$1")
            .bind(outline.id)
            .execute(&mut *tx)
            .await?;
        for quiz_id in outline.quiz_ids() {
            query("INSERT INTO outline_quizzes (quiz_id, course_id) VALUES ($1,$2)")
                .bind(quiz_id)
                .bind(outline.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::QuizOwned(quiz_id)
                    } else {
                        e.into()
                    }
                })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn outline(&self, course_id: Uuid) -> Result<Option<CourseOutline>, StoreError> {
        let row = query_scalar::<_, Json<CourseOutline>>(
            "SELECT outline FROM course_outlines WHERE id=$1",
        )
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|j| j.0))
    }

    async fn outline_for_quiz(&self, quiz_id: Uuid) -> Result<Option<CourseOutline>, StoreError> {
        let row = query_scalar::<_, Json<CourseOutline>>(
            r#"
            SELECT c.outline FROM course_outlines c
            JOIN outline_quizzes q ON q.course_id = c.id
            WHERE q.quiz_id=$1
            "#,
        )
        .bind(quiz_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|j| j.0))
    }

    async fn put_student(&self, student: &Student) -> Result<(), StoreError> {
        query(
            r#"
            INSERT INTO students (id, full_name) VALUES ($1,$2)
            ON CONFLICT (id) DO UPDATE SET full_name=EXCLUDED.full_name
            "#,
        )
        .bind(student.id)
        .bind(&student.full_name)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<Student>, StoreError> {
        Ok(
            query_as::<_, Student>("SELECT id, full_name FROM students WHERE id=$1")
                .bind(student_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn insert_enrollment(&self, e: &Enrollment) -> Result<(), StoreError> {
        query(
            r#"
            INSERT INTO enrollments
                (id, student_id, course_id, completed_lessons, completed_modules,
                 is_completed, completed_at, progress_percent, enrolled_at, version)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(e.id)
        .bind(e.student_id)
        .bind(e.course_id)
        .bind(e.completed_lessons.iter().copied().collect::<Vec<_>>())
        .bind(e.completed_modules.iter().copied().collect::<Vec<_>>())
        .bind(e.is_completed)
        .bind(e.completed_at)
        .bind(i16::from(e.progress_percent))
        .bind(e.enrolled_at)
        .bind(e.version)
        .execute(&self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Duplicate("enrollment")
            } else {
                err.into()
            }
        })?;
        Ok(())
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let sql = format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id=$1");
        query_as::<_, EnrollmentRow>(&sql)
            .bind(enrollment_id)
            .fetch_optional(&self.db)
            .await?
            .map(Enrollment::try_from)
            .transpose()
    }

    async fn enrollment_for(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE student_id=$1 AND course_id=$2"
        );
        query_as::<_, EnrollmentRow>(&sql)
            .bind(student_id)
            .bind(course_id)
            .fetch_optional(&self.db)
            .await?
            .map(Enrollment::try_from)
            .transpose()
    }

    async fn enrollments_for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>, StoreError> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE student_id=$1 ORDER BY enrolled_at"
        );
        query_as::<_, EnrollmentRow>(&sql)
            .bind(student_id)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(Enrollment::try_from)
            .collect()
    }

    async fn update_enrollment(&self, e: &Enrollment) -> Result<Enrollment, StoreError> {
        let sql = format!(
            r#"
            UPDATE enrollments
            SET completed_lessons=$3, completed_modules=$4, is_completed=$5,
                completed_at=$6, progress_percent=$7, version=version+1
            WHERE id=$1 AND version=$2
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        );
        query_as::<_, EnrollmentRow>(&sql)
            .bind(e.id)
            .bind(e.version)
            .bind(e.completed_lessons.iter().copied().collect::<Vec<_>>())
            .bind(e.completed_modules.iter().copied().collect::<Vec<_>>())
            .bind(e.is_completed)
            .bind(e.completed_at)
            .bind(i16::from(e.progress_percent))
            .fetch_optional(&self.db)
            .await?
            .ok_or(StoreError::VersionConflict(e.id))
            .and_then(Enrollment::try_from)
    }

    async fn insert_attempt(&self, a: NewQuizAttempt) -> Result<QuizAttempt, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO quiz_attempts
                (id, quiz_id, student_id, attempt_number, answers, results, score, total_score, passed)
            SELECT $1, $2, $3, COALESCE(MAX(attempt_number), 0) + 1, $4, $5, $6, $7, $8
            FROM quiz_attempts WHERE quiz_id=$2 AND student_id=$3
            RETURNING {ATTEMPT_COLUMNS}
            "#
        );
        let mut last_err = None;
        for _ in 0..ATTEMPT_INSERT_RETRIES {
            let res = query_as::<_, AttemptRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(a.quiz_id)
                .bind(a.student_id)
                .bind(Json(&a.answers))
                .bind(Json(&a.results))
                .bind(signed(a.score)?)
                .bind(signed(a.total_score)?)
                .bind(a.passed)
                .fetch_one(&self.db)
                .await;
            match res {
                Ok(row) => return QuizAttempt::try_from(row),
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(quiz_id=%a.quiz_id, "attempt number taken, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(StoreError::from)
            .unwrap_or(StoreError::Duplicate("quiz attempt")))
    }

    async fn latest_attempt(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<QuizAttempt>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts
            WHERE quiz_id=$1 AND student_id=$2
            ORDER BY attempt_number DESC LIMIT 1
            "#
        );
        query_as::<_, AttemptRow>(&sql)
            .bind(quiz_id)
            .bind(student_id)
            .fetch_optional(&self.db)
            .await?
            .map(QuizAttempt::try_from)
            .transpose()
    }

    async fn attempts(&self, quiz_id: Uuid, student_id: Uuid) -> Result<Vec<QuizAttempt>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ATTEMPT_COLUMNS} FROM quiz_attempts
            WHERE quiz_id=$1 AND student_id=$2
            ORDER BY attempt_number DESC
            "#
        );
        query_as::<_, AttemptRow>(&sql)
            .bind(quiz_id)
            .bind(student_id)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(QuizAttempt::try_from)
            .collect()
    }

    async fn insert_certificate(&self, c: &Certificate) -> Result<(), StoreError> {
        query(
            r#"
            INSERT INTO certificates
                (id, enrollment_id, student_id, course_id, student_name, course_title,
                 total_minutes, total_hours, issued_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(c.id)
        .bind(c.enrollment_id)
        .bind(c.student_id)
        .bind(c.course_id)
        .bind(&c.student_name)
        .bind(&c.course_title)
        .bind(signed(c.total_minutes)?)
        .bind(c.total_hours)
        .bind(c.issued_at)
        .execute(&self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate("certificate")
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn certificate(&self, certificate_id: Uuid) -> Result<Option<Certificate>, StoreError> {
        query_as::<_, CertificateRow>("SELECT * FROM certificates WHERE id=$1")
            .bind(certificate_id)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn certificate_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Option<Certificate>, StoreError> {
        query_as::<_, CertificateRow>("SELECT * FROM certificates WHERE enrollment_id=$1")
            .bind(enrollment_id)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }
}

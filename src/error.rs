use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::render::RenderError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum LearningError {
    #[error("student {student_id} is already enrolled in course {course_id}")]
    AlreadyEnrolled { student_id: Uuid, course_id: Uuid },
    #[error("not enrolled")]
    NotEnrolled,
    #[error("lesson {0} is not part of this course")]
    LessonNotInCourse(Uuid),
    #[error("module {0} is not part of this course")]
    ModuleNotInCourse(Uuid),
    #[error("latest attempt for quiz {0} has not passed")]
    QuizNotPassed(Uuid),
    #[error("not all lessons in module {0} are completed")]
    ModuleIncomplete(Uuid),
    #[error("not all modules in this course are completed")]
    CourseIncomplete,
    #[error("course not completed yet")]
    CourseNotCompleted,
    #[error("missing answers for {} question(s)", .0.len())]
    IncompleteAnswers(Vec<Uuid>),
    #[error("course {0} not found")]
    CourseNotFound(Uuid),
    #[error("student {0} not found")]
    StudentNotFound(Uuid),
    #[error("quiz {0} not found")]
    QuizNotFound(Uuid),
    #[error("certificate {0} not found")]
    CertificateNotFound(Uuid),
    #[error("invalid course outline: {0}")]
    InvalidOutline(String),
    #[error("enrollment {0} was modified concurrently, retry")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl From<StoreError> for LearningError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict(id) => LearningError::Conflict(id),
            StoreError::QuizOwned(quiz_id) => LearningError::InvalidOutline(format!(
                "quiz {quiz_id} already belongs to another course"
            )),
            other => LearningError::Store(other),
        }
    }
}

impl LearningError {
    pub fn kind(&self) -> &'static str {
        match self {
            LearningError::AlreadyEnrolled { .. } => "AlreadyEnrolled",
            LearningError::NotEnrolled => "NotEnrolled",
            LearningError::LessonNotInCourse(_) => "LessonNotInCourse",
            LearningError::ModuleNotInCourse(_) => "ModuleNotInCourse",
            LearningError::QuizNotPassed(_) => "QuizNotPassed",
            LearningError::ModuleIncomplete(_) => "ModuleIncomplete",
            LearningError::CourseIncomplete => "CourseIncomplete",
            LearningError::CourseNotCompleted => "CourseNotCompleted",
            LearningError::IncompleteAnswers(_) => "IncompleteAnswers",
            LearningError::CourseNotFound(_) => "CourseNotFound",
            LearningError::StudentNotFound(_) => "StudentNotFound",
            LearningError::QuizNotFound(_) => "QuizNotFound",
            LearningError::CertificateNotFound(_) => "CertificateNotFound",
            LearningError::InvalidOutline(_) => "InvalidOutline",
            LearningError::Conflict(_) => "Conflict",
            LearningError::Store(_) => "Store",
            LearningError::Render(_) => "Render",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LearningError::CourseNotFound(_)
            | LearningError::StudentNotFound(_)
            | LearningError::QuizNotFound(_)
            | LearningError::CertificateNotFound(_) => StatusCode::NOT_FOUND,
            LearningError::NotEnrolled => StatusCode::FORBIDDEN,
            LearningError::AlreadyEnrolled { .. } | LearningError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            LearningError::Store(_) | LearningError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for LearningError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error=%self, "internal error");
        } else {
            tracing::debug!(kind = self.kind(), error=%self, "request rejected");
        }

        let mut body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let LearningError::IncompleteAnswers(missing) = &self {
            body["missing_questions"] = serde_json::json!(missing);
        }
        (status, Json(body)).into_response()
    }
}

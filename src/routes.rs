use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::certificate::CertificateIssuer;
use crate::enrollment::EnrollmentManager;
use crate::error::LearningError;
use crate::grader::QuizGrader;
use crate::models::*;
use crate::outline::CourseOutline;
use crate::progress::ProgressReport;
use crate::render::CertificateRenderer;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    enrollments: Arc<EnrollmentManager>,
    grader: Arc<QuizGrader>,
    certificates: Arc<CertificateIssuer>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, renderer: Arc<dyn CertificateRenderer>) -> Self {
        let grader = Arc::new(QuizGrader::new(store.clone()));
        Self {
            enrollments: Arc::new(EnrollmentManager::new(store.clone(), grader.clone())),
            grader,
            certificates: Arc::new(CertificateIssuer::new(store.clone(), renderer)),
            store,
        }
    }
}

type ApiResult<T> = Result<Json<T>, LearningError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        // content + identity ingest
        .route("/api/courses/:course_id/outline", put(put_outline))
        .route("/api/students/:student_id", put(put_student))
        .route("/api/students/:student_id/enrollments", get(list_enrollments))
        // enrollment state machine
        .route("/api/enrollments", post(enroll))
        .route("/api/enrollments/:id", get(get_enrollment))
        .route("/api/enrollments/:id/progress", get(get_progress))
        .route(
            "/api/enrollments/:id/lessons/:lesson_id/complete",
            post(complete_lesson),
        )
        .route(
            "/api/enrollments/:id/lessons/:lesson_id/reset",
            post(reset_lesson),
        )
        .route(
            "/api/enrollments/:id/modules/:module_id/complete",
            post(complete_module),
        )
        .route("/api/enrollments/:id/complete", post(complete_course))
        .route("/api/enrollments/:id/certificate", post(generate_certificate))
        // quizzes
        .route(
            "/api/quizzes/:quiz_id/attempts",
            post(submit_quiz).get(list_attempts),
        )
        // certificates
        .route("/api/certificates/:id", get(get_certificate))
        .route("/api/certificates/:id/document", get(certificate_document))
        .with_state(state)
}

async fn put_outline(
    State(st): State<AppState>,
    Path(course_id): Path<Uuid>,
    Json(outline): Json<CourseOutline>,
) -> ApiResult<CourseOutline> {
    if outline.id != course_id {
        return Err(LearningError::InvalidOutline(format!(
            "body id {} does not match path {}",
            outline.id, course_id
        )));
    }
    let outline = outline.normalize()?;
    st.store.put_outline(&outline).await?;
    tracing::info!(%course_id, lessons = outline.total_lessons(), "course outline stored");
    Ok(Json(outline))
}

async fn put_student(
    State(st): State<AppState>,
    Path(student_id): Path<Uuid>,
    Json(req): Json<PutStudentReq>,
) -> ApiResult<Student> {
    let student = Student {
        id: student_id,
        full_name: req.full_name,
    };
    st.store.put_student(&student).await?;
    Ok(Json(student))
}

async fn list_enrollments(
    State(st): State<AppState>,
    Path(student_id): Path<Uuid>,
) -> ApiResult<Vec<Enrollment>> {
    Ok(Json(st.enrollments.list_for_student(student_id).await?))
}

async fn enroll(
    State(st): State<AppState>,
    Json(req): Json<EnrollReq>,
) -> Result<(StatusCode, Json<Enrollment>), LearningError> {
    let rec = st.enrollments.enroll(req.student_id, req.course_id).await?;
    Ok((StatusCode::CREATED, Json(rec)))
}

async fn get_enrollment(State(st): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Enrollment> {
    Ok(Json(st.enrollments.get(id).await?))
}

async fn get_progress(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProgressReport> {
    Ok(Json(st.enrollments.progress(id).await?))
}

async fn complete_lesson(
    State(st): State<AppState>,
    Path((id, lesson_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Enrollment> {
    Ok(Json(st.enrollments.complete_lesson(id, lesson_id).await?))
}

async fn reset_lesson(
    State(st): State<AppState>,
    Path((id, lesson_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Enrollment> {
    Ok(Json(st.enrollments.reset_lesson(id, lesson_id).await?))
}

async fn complete_module(
    State(st): State<AppState>,
    Path((id, module_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Enrollment> {
    Ok(Json(st.enrollments.complete_module(id, module_id).await?))
}

async fn complete_course(State(st): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Enrollment> {
    Ok(Json(st.enrollments.complete_course(id).await?))
}

async fn generate_certificate(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Certificate> {
    Ok(Json(st.certificates.generate(id).await?))
}

async fn submit_quiz(
    State(st): State<AppState>,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<SubmitQuizReq>,
) -> ApiResult<QuizAttempt> {
    Ok(Json(
        st.grader.submit(quiz_id, req.student_id, req.answers).await?,
    ))
}

async fn list_attempts(
    State(st): State<AppState>,
    Path(quiz_id): Path<Uuid>,
    Query(q): Query<AttemptsQuery>,
) -> ApiResult<Vec<QuizAttempt>> {
    Ok(Json(st.grader.attempts(quiz_id, q.student_id).await?))
}

async fn get_certificate(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Certificate> {
    Ok(Json(st.certificates.get(id).await?))
}

async fn certificate_document(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, LearningError> {
    let doc = st.certificates.document(id).await?;
    Ok(([(header::CONTENT_TYPE, doc.content_type)], doc.bytes))
}

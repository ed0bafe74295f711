use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LearningError;
use crate::models::Certificate;
use crate::render::{CertificateRenderer, RenderedDocument};
use crate::store::{Store, StoreError};

/// Issues one immutable certificate per completed enrollment.
///
/// Issuing never revokes anything: a certificate stays valid even if the
/// enrollment is later reset below completion.
pub struct CertificateIssuer {
    store: Arc<dyn Store>,
    renderer: Arc<dyn CertificateRenderer>,
}

impl CertificateIssuer {
    pub fn new(store: Arc<dyn Store>, renderer: Arc<dyn CertificateRenderer>) -> Self {
        Self { store, renderer }
    }

    #[tracing::instrument(skip(self))]
    pub async fn generate(&self, enrollment_id: Uuid) -> Result<Certificate, LearningError> {
        let enrollment = self
            .store
            .enrollment(enrollment_id)
            .await?
            .ok_or(LearningError::NotEnrolled)?;
        if !enrollment.is_completed {
            return Err(LearningError::CourseNotCompleted);
        }
        if let Some(existing) = self.store.certificate_for_enrollment(enrollment_id).await? {
            return Ok(existing);
        }

        let outline = self
            .store
            .outline(enrollment.course_id)
            .await?
            .ok_or(LearningError::CourseNotFound(enrollment.course_id))?;
        let student = self
            .store
            .student(enrollment.student_id)
            .await?
            .ok_or(LearningError::StudentNotFound(enrollment.student_id))?;

        let total_minutes = outline.total_minutes();
        let certificate = Certificate {
            id: Uuid::new_v4(),
            enrollment_id,
            student_id: student.id,
            course_id: outline.id,
            student_name: student.full_name,
            course_title: outline.title,
            total_minutes,
            total_hours: f64::from(total_minutes) / 60.0,
            issued_at: Utc::now(),
        };

        match self.store.insert_certificate(&certificate).await {
            Ok(()) => {
                tracing::info!(certificate_id=%certificate.id, "certificate issued");
                Ok(certificate)
            }
            Err(StoreError::Duplicate(_)) => {
                tracing::debug!("lost issuance race, returning stored certificate");
                self.store
                    .certificate_for_enrollment(enrollment_id)
                    .await?
                    .ok_or(LearningError::CertificateNotFound(certificate.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, certificate_id: Uuid) -> Result<Certificate, LearningError> {
        self.store
            .certificate(certificate_id)
            .await?
            .ok_or(LearningError::CertificateNotFound(certificate_id))
    }

    pub async fn document(&self, certificate_id: Uuid) -> Result<RenderedDocument, LearningError> {
        let certificate = self.get(certificate_id).await?;
        Ok(self.renderer.render(&certificate)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentManager;
    use crate::grader::QuizGrader;
    use crate::models::{Enrollment, Student};
    use crate::outline::{fixtures, CourseOutline};
    use crate::render::HtmlRenderer;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        issuer: Arc<CertificateIssuer>,
        outline: CourseOutline,
        enrollment: Enrollment,
    }

    async fn completed_enrollment() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let outline = fixtures::two_modules();
        store.put_outline(&outline).await.unwrap();
        let student = Student {
            id: Uuid::new_v4(),
            full_name: "Grace Hopper".into(),
        };
        store.put_student(&student).await.unwrap();

        let grader = Arc::new(QuizGrader::new(store.clone()));
        let manager = EnrollmentManager::new(store.clone(), grader);
        let e = manager.enroll(student.id, outline.id).await.unwrap();
        for lesson in outline.lessons() {
            manager.complete_lesson(e.id, lesson.id).await.unwrap();
        }
        for module in &outline.modules {
            manager.complete_module(e.id, module.id).await.unwrap();
        }
        let enrollment = manager.complete_course(e.id).await.unwrap();

        let issuer = Arc::new(CertificateIssuer::new(
            store.clone(),
            Arc::new(HtmlRenderer::default()),
        ));
        Harness {
            store,
            issuer,
            outline,
            enrollment,
        }
    }

    #[tokio::test]
    async fn generate_is_idempotent() {
        let h = completed_enrollment().await;
        let first = h.issuer.generate(h.enrollment.id).await.unwrap();
        let second = h.issuer.generate(h.enrollment.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.issued_at, second.issued_at);
        assert_eq!(first.student_name, "Grace Hopper");
        assert_eq!(first.total_minutes, 60);
        assert!((first.total_hours - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn requires_completed_course() {
        let store = Arc::new(MemoryStore::new());
        let outline = fixtures::two_modules();
        store.put_outline(&outline).await.unwrap();
        let enrollment = Enrollment::new(Uuid::new_v4(), outline.id);
        store.insert_enrollment(&enrollment).await.unwrap();

        let issuer = CertificateIssuer::new(store, Arc::new(HtmlRenderer::default()));
        let err = issuer.generate(enrollment.id).await.unwrap_err();
        assert!(matches!(err, LearningError::CourseNotCompleted));
    }

    #[tokio::test]
    async fn concurrent_requests_store_one_certificate() {
        let h = completed_enrollment().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let issuer = h.issuer.clone();
                let id = h.enrollment.id;
                tokio::spawn(async move { issuer.generate(id).await })
            })
            .collect();

        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        let stored = h
            .store
            .certificate_for_enrollment(h.enrollment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, ids[0]);
    }

    #[tokio::test]
    async fn snapshot_survives_outline_edits() {
        let h = completed_enrollment().await;
        let cert = h.issuer.generate(h.enrollment.id).await.unwrap();

        let mut edited = h.outline.clone();
        edited.title = "Renamed".into();
        edited.modules[0].lessons[0].duration_minutes = 600;
        h.store.put_outline(&edited).await.unwrap();

        let again = h.issuer.get(cert.id).await.unwrap();
        assert_eq!(again.course_title, "Chords");
        assert_eq!(again.total_minutes, 60);
    }

    #[tokio::test]
    async fn document_goes_through_renderer() {
        let h = completed_enrollment().await;
        let cert = h.issuer.generate(h.enrollment.id).await.unwrap();
        let doc = h.issuer.document(cert.id).await.unwrap();
        assert!(doc.content_type.starts_with("text/html"));

        let err = h.issuer.document(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LearningError::CertificateNotFound(_)));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LearningError;
use crate::models::{NewQuizAttempt, QuestionResult, Quiz, QuizAttempt};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grade {
    pub results: Vec<QuestionResult>,
    pub score: u32,
    pub total_score: u32,
    pub passed: bool,
}

/// Scores one submission. Every question must be answered; an index outside
/// the option list simply counts as wrong, and answers to questions the quiz
/// does not have are ignored.
pub fn grade(quiz: &Quiz, answers: &BTreeMap<Uuid, usize>) -> Result<Grade, LearningError> {
    let missing: Vec<Uuid> = quiz
        .questions
        .iter()
        .filter(|q| !answers.contains_key(&q.id))
        .map(|q| q.id)
        .collect();
    if !missing.is_empty() {
        return Err(LearningError::IncompleteAnswers(missing));
    }

    let mut results = Vec::with_capacity(quiz.questions.len());
    let mut score = 0u32;
    let mut total_score = 0u32;
    for q in &quiz.questions {
        let selected = answers[&q.id];
        let correct = selected == q.correct_option_index;
        let points_earned = if correct { q.points } else { 0 };
        score = score.saturating_add(points_earned);
        total_score = total_score.saturating_add(q.points);
        results.push(QuestionResult {
            question_id: q.id,
            selected_option_index: selected,
            correct,
            points_earned,
        });
    }

    Ok(Grade {
        results,
        score,
        total_score,
        passed: score >= quiz.passing_score,
    })
}

/// Grades submissions and keeps every attempt. Retakes are unrestricted.
pub struct QuizGrader {
    store: Arc<dyn Store>,
}

impl QuizGrader {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self, answers))]
    pub async fn submit(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
        answers: BTreeMap<Uuid, usize>,
    ) -> Result<QuizAttempt, LearningError> {
        let outline = self
            .store
            .outline_for_quiz(quiz_id)
            .await?
            .ok_or(LearningError::QuizNotFound(quiz_id))?;
        let quiz = outline
            .quiz(quiz_id)
            .ok_or(LearningError::QuizNotFound(quiz_id))?;

        if self
            .store
            .enrollment_for(student_id, outline.id)
            .await?
            .is_none()
        {
            return Err(LearningError::NotEnrolled);
        }

        let graded = grade(quiz, &answers)?;
        let attempt = self
            .store
            .insert_attempt(NewQuizAttempt {
                quiz_id,
                student_id,
                answers,
                results: graded.results,
                score: graded.score,
                total_score: graded.total_score,
                passed: graded.passed,
            })
            .await?;

        tracing::info!(
            attempt = attempt.attempt_number,
            score = attempt.score,
            total = attempt.total_score,
            passed = attempt.passed,
            "quiz graded"
        );
        Ok(attempt)
    }

    pub async fn attempts(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<QuizAttempt>, LearningError> {
        if self.store.outline_for_quiz(quiz_id).await?.is_none() {
            return Err(LearningError::QuizNotFound(quiz_id));
        }
        Ok(self.store.attempts(quiz_id, student_id).await?)
    }

    pub async fn latest_attempt(
        &self,
        quiz_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<QuizAttempt>, LearningError> {
        Ok(self.store.latest_attempt(quiz_id, student_id).await?)
    }
}

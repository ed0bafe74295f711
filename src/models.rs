use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Video,
    Text,
    Quiz,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    pub options: Vec<String>,
    pub correct_option_index: usize,
    pub points: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    /// Absolute number of points needed to pass, not a percentage.
    pub passing_score: u32,
    pub questions: Vec<Question>,
}

impl Quiz {
    pub fn total_points(&self) -> u32 {
        self.questions
            .iter()
            .fold(0u32, |acc, q| acc.saturating_add(q.points))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Lesson {
    pub id: Uuid,
    pub title: String,
    pub order: i32,
    pub kind: LessonKind,
    pub duration_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<Quiz>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: Uuid,
    pub title: String,
    pub order: i32,
    pub lessons: Vec<Lesson>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub completed_lessons: HashSet<Uuid>,
    pub completed_modules: HashSet<Uuid>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub enrolled_at: DateTime<Utc>,
    pub version: i64,
}

impl Enrollment {
    pub fn new(student_id: Uuid, course_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            completed_lessons: HashSet::new(),
            completed_modules: HashSet::new(),
            is_completed: false,
            completed_at: None,
            progress_percent: 0,
            enrolled_at: Utc::now(),
            version: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuestionResult {
    pub question_id: Uuid,
    pub selected_option_index: usize,
    pub correct: bool,
    pub points_earned: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub student_id: Uuid,
    pub attempt_number: u32,
    pub answers: BTreeMap<Uuid, usize>,
    pub results: Vec<QuestionResult>,
    pub score: u32,
    pub total_score: u32,
    pub passed: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Attempt as handed to the store; the store assigns `attempt_number`.
#[derive(Debug, Clone)]
pub struct NewQuizAttempt {
    pub quiz_id: Uuid,
    pub student_id: Uuid,
    pub answers: BTreeMap<Uuid, usize>,
    pub results: Vec<QuestionResult>,
    pub score: u32,
    pub total_score: u32,
    pub passed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub student_name: String,
    pub course_title: String,
    pub total_minutes: u32,
    pub total_hours: f64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollReq {
    pub student_id: Uuid,
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PutStudentReq {
    pub full_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitQuizReq {
    pub student_id: Uuid,
    pub answers: BTreeMap<Uuid, usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AttemptsQuery {
    pub student_id: Uuid,
}

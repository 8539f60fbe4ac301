pub mod assignments;
pub mod auth;
pub mod backup_exchange;
pub mod chat;
pub mod core;
pub mod courses;
pub mod discussions;
pub mod lessons;
pub mod notifications;
pub mod progress;
pub mod quizzes;
pub mod requests;
pub mod resources;
pub mod students;

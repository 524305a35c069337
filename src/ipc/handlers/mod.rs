pub mod attendance;
pub mod auth;
pub mod batches;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod enrollments;
pub mod exams;
pub mod reports;
pub mod users;

pub mod analytics;
pub mod core;
pub mod courses;
pub mod grades;
pub mod progress;

pub mod analytics;
pub mod announcements;
pub mod classes;
pub mod core;
pub mod grades;
pub mod reports;
pub mod session;
pub mod students;
pub mod subjects;
pub mod users;

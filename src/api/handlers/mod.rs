pub mod attendance;
pub mod auth;
pub mod backup;
pub mod branches;
pub mod classes;
pub mod content;
pub mod dashboard;
pub mod finance;
pub mod portal;
pub mod reports;
pub mod scores;
pub mod settings;
pub mod site;
pub mod students;
pub mod subjects;
pub mod users;

pub mod admin;
pub mod auth;
pub mod core;
pub mod guardian;
pub mod media;
pub mod students;
pub mod teacher;

//! Business rules on top of the store modules.

pub mod auth;
pub mod guardians;
pub mod mail;
pub mod observations;
pub mod passwords;
pub mod registrations;
pub mod students;
pub mod uploads;
pub mod users;

pub mod reservation;
pub mod schedule;
pub mod session;

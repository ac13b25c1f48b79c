pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod keys;

pub use chrono;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, ConfigError, Environment, LoadOptions, LogFormat};
pub use domain::reservation::{
    NewReservation, Reservation, ReservationId, ReservationPatch, ReservationStatus, Slot,
};
pub use domain::schedule::{ScheduleViolation, ServiceHours, ServiceWindow};
pub use domain::session::{ProcessedMessage, Role, Session, SessionPolicy, Turn};
pub use errors::{DomainError, InterfaceError, KeyError, ReservationError, SessionError};
pub use keys::{EntityKey, IndexKey, IndexName, ItemKey};

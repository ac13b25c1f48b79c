pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use connection::{connect, connect_with_settings, DbPool};
pub use fixtures::{SeedPlan, SeedReport, SeedVerification};
pub use repositories::{
    AppendOutcome, DateRange, PageToken, ReservationPage, ReservationPager, ReservationStore,
    ReservationStoreSettings, SessionStore, SessionStoreSettings, StatsFacade, StatusCounts,
};
pub use store::{open_store, InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore, StorageError};

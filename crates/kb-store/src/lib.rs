//! Persistence for Kitbash cartridges: SQLite for facts, keywords, phantoms,
//! and the grain registry; an append-only JSON-lines annotation log; one JSON
//! file per grain.

pub mod annotations;
pub mod cartridge;
pub mod config;
pub mod error;
pub mod grains;
pub mod library;
pub mod schema;
pub mod store;

pub use cartridge::{Cartridge, Health, QueryOutcome, QueryRequest};
pub use config::KitbashConfig;
pub use error::{Result, StoreError};
pub use library::{Library, cartridge_name, default_base_dir};
pub use store::Store;

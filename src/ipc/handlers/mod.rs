pub mod attendance;
pub mod backup_exchange;
pub mod classes;
pub mod communications;
pub mod core;
pub mod evasion;
pub mod grades;
pub mod notifications;
pub mod profiles;
pub mod setup;
pub mod stats;

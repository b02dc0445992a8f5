//! Deployable fleet service: built-in drivers, the Open-Meteo forecast
//! provider and the surplus optimizer wired around the `optimasol` core.

pub mod drivers;
pub mod open_meteo;
pub mod optimizer;
pub mod registry;

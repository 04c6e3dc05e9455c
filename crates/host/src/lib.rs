pub mod events;
pub mod pregen;
pub mod report;

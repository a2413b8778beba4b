pub mod content;
pub mod events;
pub mod stages;

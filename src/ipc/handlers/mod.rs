pub mod backup;
pub mod clusters;
pub mod core;
pub mod roster;
pub mod sessions;
pub mod status;

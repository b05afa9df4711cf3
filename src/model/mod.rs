pub mod entity;
pub mod location;
pub mod status;

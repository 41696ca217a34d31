//! The running engine: certificate authorities and their collaborators.

pub mod audit;
pub mod ca;
pub mod manager;
pub mod profile;
pub mod publisher;
pub mod scheduler;
pub mod store;

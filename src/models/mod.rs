pub mod counter;
pub mod service;
pub mod token;

pub mod health;
pub mod locations;
pub mod predictions;
pub mod scheduler;

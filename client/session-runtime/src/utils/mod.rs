pub mod retry;
pub mod single_flight;
pub mod time;

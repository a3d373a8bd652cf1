pub mod guard;
pub mod retry;

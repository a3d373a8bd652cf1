pub mod limits;
pub mod quota;

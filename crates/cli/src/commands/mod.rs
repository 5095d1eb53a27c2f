pub mod demo;
pub mod password;
pub mod users;

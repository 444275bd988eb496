pub mod prelude;

pub mod processed_message;

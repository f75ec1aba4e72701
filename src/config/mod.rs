//! Publisher configuration

mod schema;

pub use schema::*;

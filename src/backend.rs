#[derive(Debug)]
pub enum FindError {
    NotFound,
    Internal,
}

#[derive(Debug)]
pub enum CreateError {
    Conflict,
    Internal,
}

mod sql;
pub use sql::*;

use serde::{Deserialize, Serialize};

use sqlx::FromRow;

pub const USERNAME_MAX: usize = 100;
pub const EMAIL_MAX: usize = 100;

#[derive(Debug, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub pwhash: String,
}

/// What callers get back - never the hash.
#[derive(Debug, Serialize)]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    pub email: String,
}

impl User {
    pub fn identity(self) -> UserIdentity {
        let Self {
            id,
            username,
            email,
            pwhash: _,
        } = self;

        UserIdentity {
            id,
            username,
            email,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

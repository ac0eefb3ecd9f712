use std::fmt;
use std::str::FromStr;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use log::error;
use uuid::Uuid;

/// Opaque proof of a prior login, carried by the client in the
/// `sessionid` cookie. A v4 uuid - 122 bits from the OS rng.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Uuid::try_parse(s).map(Self).map_err(|_| ())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Argon2id with a fresh salt per call - two hashes of the same
/// password never compare equal as strings.
pub fn hash_password(plaintext: &str) -> Result<String, ()> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("couldn't hash password: {e}");
        })
}

/// A malformed stored hash verifies false - parse errors stay here.
pub fn verify_password(plaintext: &str, pwhash: &str) -> bool {
    let parsed = match PasswordHash::new(pwhash) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("unparseable stored password hash: {e}");
            return false;
        }
    };

    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

use std::{result, sync::Arc};

use log::{error, info, trace};
use warp::http;

use crate::auth::{self, SessionId};
use crate::backend::{Backend, CreateError, FindError};
use crate::memo::{Memo, MemoCreate, MemoUpdate, QueryMemos, CONTENT_MAX, TITLE_MAX};
use crate::session::{SessionIdentity, SessionManager};
use crate::user::{LoginRequest, SignupRequest, UserIdentity, EMAIL_MAX, USERNAME_MAX};
use crate::Timestamp;

const DEFAULT_LIMIT: i64 = 10;

pub struct MemoServe {
    backend: Backend,
    sessions: SessionManager,
}

/// A request that has passed the access guard. `AUTHORIZED` tracks
/// how far: `authenticate` resolves the session snapshot, `authorize`
/// re-checks the user row. Memo operations only exist on the
/// fully-checked handle.
pub struct MemoServeAuthed<const AUTHORIZED: bool = false> {
    serve: Arc<MemoServe>,
    session_id: SessionId,
    user_id: i64,
    username: String,
}

impl<const AUTHORIZED: bool> std::fmt::Debug for MemoServeAuthed<AUTHORIZED> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoServeAuthed")
            .field("authorized", &AUTHORIZED)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Internal,
    BadRequest,
    Unauthenticated,
    InvalidCredentials,
    Conflict,
    NotFound,
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// One fixed message per kind - in particular, login failures all
    /// share a body so responses can't confirm which usernames exist.
    pub fn detail(self) -> &'static str {
        match self {
            Self::Internal => "internal error",
            Self::BadRequest => "bad request",
            Self::Unauthenticated => "not authenticated",
            Self::InvalidCredentials => "invalid username or password",
            Self::Conflict => "username already exists",
            Self::NotFound => "not found",
        }
    }
}

impl Into<http::StatusCode> for Error {
    fn into(self) -> http::StatusCode {
        match self {
            Self::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest => http::StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::InvalidCredentials => http::StatusCode::UNAUTHORIZED,
            Self::Conflict => http::StatusCode::CONFLICT,
            Self::NotFound => http::StatusCode::NOT_FOUND,
        }
    }
}

impl warp::reject::Reject for Error {}

fn now() -> Result<Timestamp> {
    Timestamp::now().map_err(|()| Error::Internal)
}

fn check_bounds(title: &Option<String>, content: &Option<String>) -> Result<()> {
    let title_ok = title.as_deref().map_or(true, |t| t.len() <= TITLE_MAX);
    let content_ok = content.as_deref().map_or(true, |c| c.len() <= CONTENT_MAX);

    (title_ok && content_ok).then_some(()).ok_or(Error::BadRequest)
}

impl MemoServe {
    pub fn new(backend: Backend, sessions: SessionManager) -> Self {
        Self { backend, sessions }
    }

    pub async fn signup(&self, req: SignupRequest) -> Result<UserIdentity> {
        let SignupRequest {
            username,
            email,
            password,
        } = req;

        if username.is_empty()
            || username.len() > USERNAME_MAX
            || email.len() > EMAIL_MAX
            || password.is_empty()
        {
            return Err(Error::BadRequest);
        }

        let pwhash = auth::hash_password(&password).map_err(|()| Error::Internal)?;

        let user = self
            .backend
            .create_user(&username, &email, &pwhash, now()?)
            .await
            .map_err(|e| match e {
                CreateError::Conflict => {
                    info!("signup rejected, username {username} taken");
                    Error::Conflict
                }
                CreateError::Internal => Error::Internal,
            })?;

        info!("{username} signed up");
        Ok(user.identity())
    }

    pub async fn login(&self, req: LoginRequest) -> Result<(UserIdentity, SessionId)> {
        let LoginRequest { username, password } = req;

        let user = match self.backend.find_user(&username).await {
            Ok(user) => user,
            Err(FindError::NotFound) => {
                // same error as a wrong password, on purpose
                info!("rejecting login for unknown user {username}");
                return Err(Error::InvalidCredentials);
            }
            Err(FindError::Internal) => return Err(Error::Internal),
        };

        if !auth::verify_password(&password, &user.pwhash) {
            info!("wrong password for user {username}");
            return Err(Error::InvalidCredentials);
        }

        let session_id = self
            .sessions
            .create(user.id, &user.username)
            .await
            .map_err(|()| Error::Internal)?;

        info!("{username} login: new session created");
        Ok((user.identity(), session_id))
    }

    /// Always succeeds - logging out an unknown or absent token is
    /// still a logout.
    pub async fn logout(&self, session_id: Option<SessionId>) -> Result<()> {
        match session_id {
            Some(ref id) => {
                trace!("logout, invalidating session {id}");
                self.sessions
                    .invalidate(id)
                    .await
                    .map_err(|()| Error::Internal)
            }
            None => Ok(()),
        }
    }

    pub async fn authenticate(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
    ) -> Result<MemoServeAuthed> {
        let session_id = session_id.ok_or(Error::Unauthenticated)?;

        let identity = self
            .sessions
            .resolve(&session_id)
            .await
            .map_err(|()| Error::Internal)?
            .ok_or_else(|| {
                info!("no session for token {session_id}");
                Error::Unauthenticated
            })?;

        let SessionIdentity { user_id, username } = identity;

        Ok(MemoServeAuthed {
            serve: Arc::clone(self),
            session_id,
            user_id,
            username,
        })
    }
}

impl<const AUTHORIZED: bool> MemoServeAuthed<AUTHORIZED> {
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl MemoServeAuthed {
    /// The session carries a login-time snapshot, which can outlive
    /// the account itself. Re-resolve the user row before letting any
    /// memo operation through.
    pub async fn authorize(self) -> Result<MemoServeAuthed<true>> {
        let user = self
            .serve
            .backend
            .user_by_id(self.user_id)
            .await
            .map_err(|e| match e {
                FindError::NotFound => {
                    error!(
                        "session {} names vanished user id {}",
                        self.session_id, self.user_id,
                    );
                    Error::NotFound
                }
                FindError::Internal => Error::Internal,
            })?;

        Ok(MemoServeAuthed {
            serve: self.serve,
            session_id: self.session_id,
            user_id: user.id,
            username: user.username,
        })
    }
}

impl MemoServeAuthed<true> {
    pub async fn create_memo(&self, create: MemoCreate) -> Result<Memo> {
        let username = &self.username;

        check_bounds(&create.title, &create.content)?;
        trace!("{username} creating memo");

        let memo = self
            .serve
            .backend
            .create_memo(self.user_id, create, now()?)
            .await
            .map_err(|()| Error::Internal)?;

        info!("{username} created memo {}", memo.id);
        Ok(memo)
    }

    pub async fn memos(&self, query: QueryMemos) -> Result<Vec<Memo>> {
        let username = &self.username;

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        if offset < 0 || limit < 0 {
            return Err(Error::BadRequest);
        }

        trace!("{username} listing memos, offset {offset} limit {limit}");

        self.serve
            .backend
            .memos_for_user(self.user_id, offset, limit)
            .await
            .map(|memos| {
                info!("{username}, {} memos", memos.len());
                memos
            })
            .map_err(|()| Error::Internal)
    }

    /// A memo owned by someone else and a memo that never existed are
    /// the same NotFound.
    pub async fn update_memo(&self, memo_id: i64, update: MemoUpdate) -> Result<Memo> {
        let username = &self.username;

        check_bounds(&update.title, &update.content)?;
        trace!("{username} updating memo {memo_id}");

        self.serve
            .backend
            .update_memo(self.user_id, memo_id, &update)
            .await
            .map_err(|()| Error::Internal)?
            .ok_or(Error::NotFound)
    }

    pub async fn delete_memo(&self, memo_id: i64) -> Result<()> {
        let username = &self.username;

        info!("{username} deleting memo {memo_id}");

        self.serve
            .backend
            .delete_memo(self.user_id, memo_id)
            .await
            .map_err(|()| Error::Internal)?
            .then(|| ())
            .ok_or(Error::NotFound)
    }
}

use std::convert::Infallible;
use std::sync::Arc;

use clap::Parser;
use cookie::{Cookie, SameSite};
use log::{error, info};
use warp::http::{header, StatusCode};
use warp::{Filter, Rejection, Reply};

mod args;
mod auth;
mod backend;
mod memo;
mod memoserve;
mod session;
mod time;
mod user;

use crate::args::Args;
use crate::auth::SessionId;
use crate::backend::Backend;
use crate::memo::{MemoCreate, MemoUpdate, QueryMemos};
use crate::memoserve::{Error, MemoServe, MemoServeAuthed};
use crate::session::SessionManager;
use crate::user::{LoginRequest, SignupRequest};

pub use crate::time::Timestamp;

const SESSION_COOKIE: &str = "sessionid";

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let args = Args::parse();
    let addr = match args.addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("couldn't parse address: {e}");
            std::process::exit(1);
        }
    };

    let backend = Backend::new(args.data_dir()).await;
    let sessions = SessionManager::new(backend.0.clone(), args.session_ttl());
    let serve = Arc::new(MemoServe::new(backend, sessions));

    info!("listening on {addr}");

    warp::serve(routes(serve, args.secure())).run(addr).await;
}

fn routes(
    serve: Arc<MemoServe>,
    secure: bool,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let with_serve = warp::any().map(move || Arc::clone(&serve));
    let session_id = warp::cookie::optional::<SessionId>(SESSION_COOKIE);

    let signup = warp::path!("signup")
        .and(warp::post())
        .and(with_serve.clone())
        .and(warp::body::json())
        .and_then(signup);

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_serve.clone())
        .and(warp::body::json())
        .and_then(move |serve, req| login(serve, req, secure));

    let logout = warp::path!("logout")
        .and(warp::post())
        .and(with_serve.clone())
        .and(session_id)
        .and_then(logout);

    let about = warp::path!("about")
        .and(warp::get())
        .and(with_serve.clone())
        .and(session_id)
        .and_then(about);

    let memos = {
        let create = warp::path!("memos")
            .and(warp::post())
            .and(with_serve.clone())
            .and(session_id)
            .and(warp::body::json())
            .and_then(create_memo);

        let list = warp::path!("memos")
            .and(warp::get())
            .and(with_serve.clone())
            .and(session_id)
            .and(warp::query())
            .and_then(list_memos);

        let update = warp::path!("memos" / i64)
            .and(warp::put())
            .and(with_serve.clone())
            .and(session_id)
            .and(warp::body::json())
            .and_then(update_memo);

        let delete = warp::path!("memos" / i64)
            .and(warp::delete())
            .and(with_serve)
            .and(session_id)
            .and_then(delete_memo);

        create.or(list).or(update).or(delete)
    };

    signup
        .or(login)
        .or(logout)
        .or(about)
        .or(memos)
        .recover(handle_rejection)
}

fn session_cookie(value: &str, secure: bool, expire: bool) -> Cookie<'static> {
    let mut builder = Cookie::build((SESSION_COOKIE, value.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(secure);

    if expire {
        builder = builder.max_age(cookie::time::Duration::ZERO);
    }

    builder.build()
}

/// Both guard steps, in order: session, then the user behind it.
async fn authorized(
    serve: &Arc<MemoServe>,
    session_id: Option<SessionId>,
) -> Result<MemoServeAuthed<true>, Rejection> {
    let authed = serve
        .authenticate(session_id)
        .await
        .map_err(warp::reject::custom)?;

    authed.authorize().await.map_err(warp::reject::custom)
}

async fn signup(serve: Arc<MemoServe>, req: SignupRequest) -> Result<impl Reply, Rejection> {
    let identity = serve.signup(req).await.map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&identity))
}

async fn login(
    serve: Arc<MemoServe>,
    req: LoginRequest,
    secure: bool,
) -> Result<impl Reply, Rejection> {
    let (identity, session_id) = serve.login(req).await.map_err(warp::reject::custom)?;

    let cookie = session_cookie(&session_id.to_string(), secure, false);

    Ok(warp::reply::with_header(
        warp::reply::json(&identity),
        header::SET_COOKIE,
        cookie.to_string(),
    ))
}

async fn logout(
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
) -> Result<impl Reply, Rejection> {
    serve.logout(session_id).await.map_err(warp::reject::custom)?;

    // tell the client to drop its copy as well
    let cookie = session_cookie("", false, true);

    Ok(warp::reply::with_header(
        warp::reply::json(&serde_json::json!({ "detail": "logged out" })),
        header::SET_COOKIE,
        cookie.to_string(),
    ))
}

async fn about(
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
) -> Result<impl Reply, Rejection> {
    let authed = serve
        .authenticate(session_id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&serde_json::json!({
        "username": authed.username(),
    })))
}

async fn create_memo(
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
    create: MemoCreate,
) -> Result<impl Reply, Rejection> {
    let authed = authorized(&serve, session_id).await?;
    let memo = authed
        .create_memo(create)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&memo))
}

async fn list_memos(
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
    query: QueryMemos,
) -> Result<impl Reply, Rejection> {
    let authed = authorized(&serve, session_id).await?;
    let memos = authed.memos(query).await.map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&memos))
}

async fn update_memo(
    memo_id: i64,
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
    update: MemoUpdate,
) -> Result<impl Reply, Rejection> {
    let authed = authorized(&serve, session_id).await?;
    let memo = authed
        .update_memo(memo_id, update)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&memo))
}

async fn delete_memo(
    memo_id: i64,
    serve: Arc<MemoServe>,
    session_id: Option<SessionId>,
) -> Result<impl Reply, Rejection> {
    let authed = authorized(&serve, session_id).await?;
    authed
        .delete_memo(memo_id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&serde_json::json!({
        "detail": "memo deleted",
    })))
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, detail) = if let Some(&err) = rejection.find::<Error>() {
        (err.into(), err.detail())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
        || rejection.find::<warp::reject::InvalidQuery>().is_some()
    {
        (StatusCode::BAD_REQUEST, "bad request")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        error!("unhandled rejection: {rejection:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };

    let body = warp::reply::json(&serde_json::json!({ "detail": detail }));

    Ok(warp::reply::with_status(body, status))
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::{json, Value};

    async fn create_routes() -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
        let db = backend::test::create_db().await;
        let sessions = SessionManager::new(db.clone(), 60 * 60);
        let serve = Arc::new(MemoServe::new(Backend(db), sessions));

        routes(serve, false)
    }

    fn body_json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    /// Pull the sessionid out of a login response, ready to send back
    /// as a Cookie header.
    fn cookie_from<T>(resp: &warp::http::Response<T>) -> String {
        let set_cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .expect("no set-cookie header")
            .to_str()
            .unwrap();

        let cookie = Cookie::parse(set_cookie.to_string()).unwrap();
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert!(cookie.http_only().unwrap_or(false));

        format!("{}={}", SESSION_COOKIE, cookie.value())
    }

    #[tokio::test]
    async fn full_memo_flow() {
        let routes = create_routes().await;

        // signup
        let resp = warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "alice", "email": "a@x.com", "password": "pw1"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let identity = body_json(resp.body());
        assert_eq!(identity["username"], "alice");
        assert_eq!(identity["email"], "a@x.com");
        assert!(identity.get("pwhash").is_none());
        assert!(identity.get("password").is_none());

        // duplicate signup
        let resp = warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "alice", "email": "b@y.com", "password": "pw2"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // login
        let resp = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "alice", "password": "pw1"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let session = cookie_from(&resp);

        // create a memo
        let resp = warp::test::request()
            .method("POST")
            .path("/memos")
            .header(header::COOKIE, &session)
            .json(&json!({"title": "t", "content": "c"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let memo = body_json(resp.body());
        assert_eq!(memo["id"], 1);
        assert_eq!(memo["user_id"], identity["id"]);

        // list it back
        let resp = warp::test::request()
            .method("GET")
            .path("/memos")
            .header(header::COOKIE, &session)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.body()), json!([{
            "id": 1,
            "user_id": identity["id"],
            "title": "t",
            "content": "c",
        }]));

        // partial update: only the title moves
        let resp = warp::test::request()
            .method("PUT")
            .path("/memos/1")
            .header(header::COOKIE, &session)
            .json(&json!({"title": "t2"}))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let memo = body_json(resp.body());
        assert_eq!(memo["title"], "t2");
        assert_eq!(memo["content"], "c");

        // logout clears the cookie..
        let resp = warp::test::request()
            .method("POST")
            .path("/logout")
            .header(header::COOKIE, &session)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cleared = resp
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        let cleared = Cookie::parse(cleared.to_string()).unwrap();
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.max_age(), Some(cookie::time::Duration::ZERO));

        // ..and the old session no longer authenticates
        let resp = warp::test::request()
            .method("GET")
            .path("/memos")
            .header(header::COOKIE, &session)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn memos_require_a_session() {
        let routes = create_routes().await;

        let resp = warp::test::request()
            .method("GET")
            .path("/memos")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp.body()), json!({"detail": "not authenticated"}));

        // a cookie that isn't even a uuid
        let resp = warp::test::request()
            .method("GET")
            .path("/memos")
            .header(header::COOKIE, "sessionid=garbage")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_failures_share_a_response() {
        let routes = create_routes().await;

        warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "alice", "email": "a@x.com", "password": "pw1"}))
            .reply(&routes)
            .await;

        let wrong_password = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "alice", "password": "nope"}))
            .reply(&routes)
            .await;
        let unknown_user = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "nobody", "password": "pw1"}))
            .reply(&routes)
            .await;

        assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong_password.body(), unknown_user.body());
    }

    #[tokio::test]
    async fn cross_owner_memo_is_a_plain_404() {
        let routes = create_routes().await;

        for (user, email, pw) in [("alice", "a@x.com", "pw1"), ("bob", "b@y.com", "pw2")] {
            warp::test::request()
                .method("POST")
                .path("/signup")
                .json(&json!({"username": user, "email": email, "password": pw}))
                .reply(&routes)
                .await;
        }

        let login = |user: &'static str, pw: &'static str| {
            let routes = routes.clone();
            async move {
                let resp = warp::test::request()
                    .method("POST")
                    .path("/login")
                    .json(&json!({"username": user, "password": pw}))
                    .reply(&routes)
                    .await;
                cookie_from(&resp)
            }
        };

        let bob = login("bob", "pw2").await;
        let resp = warp::test::request()
            .method("POST")
            .path("/memos")
            .header(header::COOKIE, &bob)
            .json(&json!({"title": "bob's"}))
            .reply(&routes)
            .await;
        let bobs_memo = body_json(resp.body())["id"].clone();

        let alice = login("alice", "pw1").await;
        let steal = warp::test::request()
            .method("DELETE")
            .path(&format!("/memos/{bobs_memo}"))
            .header(header::COOKIE, &alice)
            .reply(&routes)
            .await;
        let phantom = warp::test::request()
            .method("DELETE")
            .path("/memos/9999")
            .header(header::COOKIE, &alice)
            .reply(&routes)
            .await;

        // never a 403 - that would confirm the memo exists
        assert_eq!(steal.status(), StatusCode::NOT_FOUND);
        assert_eq!(phantom.status(), StatusCode::NOT_FOUND);
        assert_eq!(steal.body(), phantom.body());
    }

    #[tokio::test]
    async fn about_names_the_session_user() {
        let routes = create_routes().await;

        warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "alice", "email": "a@x.com", "password": "pw1"}))
            .reply(&routes)
            .await;
        let resp = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "alice", "password": "pw1"}))
            .reply(&routes)
            .await;
        let session = cookie_from(&resp);

        let resp = warp::test::request()
            .method("GET")
            .path("/about")
            .header(header::COOKIE, &session)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.body()), json!({"username": "alice"}));

        let resp = warp::test::request()
            .method("GET")
            .path("/about")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

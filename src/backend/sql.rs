use std::future::Future;
use std::path::{Path, PathBuf};

use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool, Transaction};

use log::{error, info};

use crate::backend::{CreateError, FindError};
use crate::memo::{Memo, MemoCreate, MemoUpdate};
use crate::user::User;
use crate::Timestamp;

type Result<T> = std::result::Result<T, ()>;

pub struct Backend(pub Pool<Sqlite>);

fn into_sql(path: &Path) -> PathBuf {
    path.join("memo.sql")
}

pub async fn init(data_dir: &Path) {
    let final_path = format!(
        "sqlite://{}",
        into_sql(data_dir).to_str().expect("non utf-8 data")
    );
    match Sqlite::create_database(&final_path).await {
        Ok(()) => {
            info!("Using {}", &final_path);
        }
        Err(e) => {
            let sqlx::Error::Database(db_err) = e else {
                panic!("error creating database: {e}");
            };

            panic!("sql db error: {db_err:?}");
        }
    }
}

impl Backend {
    pub async fn new(data_dir: &Path) -> Self {
        let db_pathbuf = into_sql(data_dir);
        let db_path = db_pathbuf.to_str().expect("non utf-8 data");
        let pool = match SqlitePool::connect(db_path).await {
            Ok(pool) => pool,
            Err(_err) => {
                init(data_dir).await;
                SqlitePool::connect(db_path).await.expect("db connection")
            }
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migration");

        Self(pool)
    }
}

impl Backend {
    async fn transact<'t, T, R, F>(&self, transaction: T) -> Result<R>
    where
        T: FnOnce(Transaction<'t, Sqlite>) -> F,
        F: Future<Output = Result<(Transaction<'t, Sqlite>, R)>>,
    {
        let tx = self.0.begin().await.map_err(|e| {
            error!("error beginning transaction: {:?}", e);
        })?;

        let (tx, r) = transaction(tx).await?;

        tx.commit().await.map_err(|e| {
            error!("error committing transaction: {:?}", e);
        })?;

        Ok(r)
    }
}

impl Backend {
    /// Uniqueness rides on the `username` UNIQUE constraint - of two
    /// racing signups exactly one insert wins, the other conflicts.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        pwhash: &str,
        now: Timestamp,
    ) -> std::result::Result<User, CreateError> {
        let done = sqlx::query(
            "
            INSERT INTO users
            (username, email, pwhash, created)
            VALUES
            (?, ?, ?, ?)
            ",
        )
        .bind(username)
        .bind(email)
        .bind(pwhash)
        .bind(now)
        .execute(&self.0)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE constraint failed") => {
                CreateError::Conflict
            }
            _ => {
                error!("error inserting user: {e:?}");
                CreateError::Internal
            }
        })?;

        Ok(User {
            id: done.last_insert_rowid(),
            username: username.into(),
            email: email.into(),
            pwhash: pwhash.into(),
        })
    }

    pub async fn find_user(&self, username: &str) -> std::result::Result<User, FindError> {
        sqlx::query_as::<_, User>(
            "
            SELECT id, username, email, pwhash
            FROM users
            WHERE username = ?
            ",
        )
        .bind(username)
        .fetch_one(&self.0)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::RowNotFound) {
                FindError::NotFound
            } else {
                error!("error selecting user: {e:?}");
                FindError::Internal
            }
        })
    }

    pub async fn user_by_id(&self, id: i64) -> std::result::Result<User, FindError> {
        sqlx::query_as::<_, User>(
            "
            SELECT id, username, email, pwhash
            FROM users
            WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_one(&self.0)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::RowNotFound) {
                FindError::NotFound
            } else {
                error!("error selecting user by id: {e:?}");
                FindError::Internal
            }
        })
    }
}

impl Backend {
    pub async fn create_memo(
        &self,
        user_id: i64,
        create: MemoCreate,
        now: Timestamp,
    ) -> Result<Memo> {
        let MemoCreate { title, content } = create;

        let done = sqlx::query(
            "
            INSERT INTO memos
            (user_id, title, content, created)
            VALUES
            (?, ?, ?, ?)
            ",
        )
        .bind(user_id)
        .bind(&title)
        .bind(&content)
        .bind(now)
        .execute(&self.0)
        .await
        .map_err(|e| {
            error!("error inserting memo: {e:?}");
        })?;

        Ok(Memo {
            id: done.last_insert_rowid(),
            user_id,
            title,
            content,
        })
    }

    pub async fn memos_for_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Memo>> {
        sqlx::query_as::<_, Memo>(
            "
            SELECT id, user_id, title, content
            FROM memos
            WHERE user_id = ?
            ORDER BY id
            LIMIT ? OFFSET ?
            ",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            error!("error selecting memos: {e:?}");
        })
    }

    /// coalesce() keeps columns whose update field is NULL, i.e. not
    /// provided. Update and read-back share a transaction so a racing
    /// delete surfaces as None, not a half-applied row.
    pub async fn update_memo(
        &self,
        user_id: i64,
        memo_id: i64,
        update: &MemoUpdate,
    ) -> Result<Option<Memo>> {
        self.transact(|mut tx| async move {
            let done = sqlx::query(
                "
                UPDATE memos
                SET
                    title = coalesce(?, title),
                    content = coalesce(?, content)
                WHERE id = ? AND user_id = ?
                ",
            )
            .bind(&update.title)
            .bind(&update.content)
            .bind(memo_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("error updating memo: {e:?}");
            })?;

            if done.rows_affected() == 0 {
                return Ok((tx, None));
            }

            let memo = sqlx::query_as::<_, Memo>(
                "
                SELECT id, user_id, title, content
                FROM memos
                WHERE id = ? AND user_id = ?
                ",
            )
            .bind(memo_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                error!("error re-reading updated memo: {e:?}");
            })?;

            Ok((tx, Some(memo)))
        })
        .await
    }

    /// Ok(false): nothing matched under this owner.
    pub async fn delete_memo(&self, user_id: i64, memo_id: i64) -> Result<bool> {
        let done = sqlx::query(
            "
            DELETE FROM memos
            WHERE id = ? AND user_id = ?
            ",
        )
        .bind(memo_id)
        .bind(user_id)
        .execute(&self.0)
        .await
        .map_err(|e| {
            error!("error deleting memo: {e:?}");
        })?;

        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
pub mod test {
    use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

    pub async fn create_db() -> Pool<Sqlite> {
        // one connection, or each pool checkout would see its own
        // empty :memory: database
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();

        sqlx::migrate!("./migrations").run(&db).await.unwrap();

        db
    }
}

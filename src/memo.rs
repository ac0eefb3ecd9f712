use serde::{Deserialize, Serialize};

use sqlx::FromRow;

pub const TITLE_MAX: usize = 100;
pub const CONTENT_MAX: usize = 1000;

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Memo {
    pub id: i64,
    pub user_id: i64,
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemoCreate {
    pub title: Option<String>,
    pub content: Option<String>,
}

/// Partial update: `None` means "leave as-is", `Some("")` really does
/// overwrite with an empty string.
#[derive(Debug, Default, Deserialize)]
pub struct MemoUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QueryMemos {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

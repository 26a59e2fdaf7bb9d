use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserRow {
    pub uuid: String,
    pub login: String,
    pub userpassword: Option<String>,
    pub email: Option<String>,
    pub operator: bool,
    pub reader: bool,
}

impl UserRow {
    pub fn is_privileged(&self) -> bool {
        self.operator || self.reader
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct KeyRow {
    pub uuid: String,
    pub fingerprint: String,
    pub name: Option<String>,
    pub comment: Option<String>,
}

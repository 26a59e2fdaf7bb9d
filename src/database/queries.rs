use sqlx::SqliteConnection;

use crate::changelog::dn::Privilege;
use crate::database::models::*;
use crate::error::SentinelError;

/// Columns of `users` a modify operation may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    Login,
    UserPassword,
    Email,
}

impl UserField {
    pub fn from_attribute(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "login" => Some(UserField::Login),
            "userpassword" => Some(UserField::UserPassword),
            "email" => Some(UserField::Email),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            UserField::Login => "login",
            UserField::UserPassword => "userpassword",
            UserField::Email => "email",
        }
    }
}

pub struct Queries;

impl Queries {
    pub async fn get_user(conn: &mut SqliteConnection, uuid: &str) -> Result<Option<UserRow>, SentinelError> {
        let user = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT uuid, login, userpassword, email, operator, reader
            FROM users
            WHERE uuid = ?
            "#,
        )
        .bind(uuid)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(user)
    }

    pub async fn insert_user(conn: &mut SqliteConnection, user: &UserRow) -> Result<(), SentinelError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO users (uuid, login, userpassword, email, operator, reader)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.uuid)
        .bind(&user.login)
        .bind(&user.userpassword)
        .bind(&user.email)
        .bind(user.operator)
        .bind(user.reader)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_user_field(
        conn: &mut SqliteConnection,
        uuid: &str,
        field: UserField,
        value: Option<&str>,
    ) -> Result<(), SentinelError> {
        // Column names come from a closed enum, never from input.
        let sql = format!("UPDATE users SET {} = ? WHERE uuid = ?", field.column());
        sqlx::query(&sql)
            .bind(value)
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn set_privilege(
        conn: &mut SqliteConnection,
        uuid: &str,
        privilege: Privilege,
        granted: bool,
    ) -> Result<(), SentinelError> {
        let sql = format!("UPDATE users SET {} = ? WHERE uuid = ?", privilege.column());
        sqlx::query(&sql)
            .bind(granted)
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn delete_user(conn: &mut SqliteConnection, uuid: &str) -> Result<(), SentinelError> {
        sqlx::query("DELETE FROM keys WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM users WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn keys_for_user(conn: &mut SqliteConnection, uuid: &str) -> Result<Vec<KeyRow>, SentinelError> {
        let keys = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT uuid, fingerprint, name, comment
            FROM keys
            WHERE uuid = ?
            ORDER BY fingerprint
            "#,
        )
        .bind(uuid)
        .fetch_all(&mut *conn)
        .await?;
        Ok(keys)
    }

    pub async fn insert_key(conn: &mut SqliteConnection, key: &KeyRow) -> Result<(), SentinelError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO keys (uuid, fingerprint, name, comment)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&key.uuid)
        .bind(&key.fingerprint)
        .bind(&key.name)
        .bind(&key.comment)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_key(conn: &mut SqliteConnection, uuid: &str, fingerprint: &str) -> Result<(), SentinelError> {
        sqlx::query("DELETE FROM keys WHERE uuid = ? AND fingerprint = ?")
            .bind(uuid)
            .bind(fingerprint)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn alice() -> UserRow {
        UserRow {
            uuid: "u1".to_string(),
            login: "alice".to_string(),
            userpassword: Some("hash".to_string()),
            email: None,
            operator: false,
            reader: false,
        }
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        Queries::insert_user(&mut conn, &alice()).await.unwrap();
        Queries::update_user_field(&mut conn, "u1", UserField::Email, Some("a@example.com"))
            .await
            .unwrap();
        Queries::set_privilege(&mut conn, "u1", Privilege::Operator, true)
            .await
            .unwrap();

        let user = Queries::get_user(&mut conn, "u1").await.unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert!(user.operator);
        assert!(!user.reader);
        assert!(user.is_privileged());

        Queries::insert_key(
            &mut conn,
            &KeyRow {
                uuid: "u1".to_string(),
                fingerprint: "aa:bb".to_string(),
                name: Some("laptop".to_string()),
                comment: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(Queries::keys_for_user(&mut conn, "u1").await.unwrap().len(), 1);

        Queries::delete_user(&mut conn, "u1").await.unwrap();
        assert!(Queries::get_user(&mut conn, "u1").await.unwrap().is_none());
        assert!(Queries::keys_for_user(&mut conn, "u1").await.unwrap().is_empty());
    }

    #[test]
    fn test_user_field_mapping() {
        assert_eq!(UserField::from_attribute("userPassword"), Some(UserField::UserPassword));
        assert_eq!(UserField::from_attribute("cn"), None);
    }
}

//! Notifications
//!
//! Projection updates produce [`Notification`] events. The dispatcher turns
//! each event into addressed messages according to the audience policy and
//! hands them to a [`Notifier`] for delivery. Everything is dropped while
//! the service is catching up on history.

pub mod throttle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::changelog::dn::Privilege;
use crate::config::NotifyConfig;
use crate::database::models::{KeyRow, UserRow};
use crate::error::SentinelError;

pub use throttle::AlertThrottle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LoginChanged {
        when: String,
        user: UserRow,
        new_login: String,
    },
    PasswordChanged {
        when: String,
        user: UserRow,
    },
    EmailChanged {
        when: String,
        user: UserRow,
        new_email: String,
    },
    UserDeleted {
        when: String,
        user: UserRow,
    },
    KeyAdded {
        when: String,
        user: UserRow,
        key: KeyRow,
        other_keys: Vec<KeyRow>,
    },
    KeyDeleted {
        when: String,
        user: UserRow,
        key: KeyRow,
        other_keys: Vec<KeyRow>,
    },
    PrivilegeGranted {
        when: String,
        user: UserRow,
        privilege: Privilege,
    },
    PrivilegeRevoked {
        when: String,
        user: UserRow,
        privilege: Privilege,
    },
}

impl Notification {
    pub fn user(&self) -> &UserRow {
        match self {
            Notification::LoginChanged { user, .. }
            | Notification::PasswordChanged { user, .. }
            | Notification::EmailChanged { user, .. }
            | Notification::UserDeleted { user, .. }
            | Notification::KeyAdded { user, .. }
            | Notification::KeyDeleted { user, .. }
            | Notification::PrivilegeGranted { user, .. }
            | Notification::PrivilegeRevoked { user, .. } => user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Operators,
    Users(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Recipient,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), SentinelError>;
}

/// Writes every message to the log instead of sending it.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn deliver(&self, message: &Message) -> Result<(), SentinelError> {
        match &message.to {
            Recipient::Operators => info!(subject = %message.subject, "Operator notification"),
            Recipient::Users(to) => info!(to = ?to, subject = %message.subject, "User notification"),
        }
        debug!("{}", message.body);
        Ok(())
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    config: NotifyConfig,
    initial_sync: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, config: NotifyConfig, initial_sync: bool) -> Self {
        Self {
            notifier,
            config,
            initial_sync: AtomicBool::new(initial_sync),
        }
    }

    pub fn in_initial_sync(&self) -> bool {
        self.initial_sync.load(Ordering::SeqCst)
    }

    /// Returns true if this call ended the initial sync.
    pub fn finish_initial_sync(&self) -> bool {
        self.initial_sync.swap(false, Ordering::SeqCst)
    }

    pub async fn notify(&self, notification: &Notification) {
        if self.in_initial_sync() {
            return;
        }
        for message in self.messages(notification) {
            self.send(&message).await;
        }
    }

    /// Operator alert, subject to the same initial-sync suppression.
    pub async fn alert(&self, subject: &str, detail: &str) {
        if self.in_initial_sync() {
            warn!("Alert suppressed during initial sync: {}", subject);
            return;
        }
        let message = Message {
            to: Recipient::Operators,
            subject: format!("{}{}", self.config.operator_prefix, subject),
            body: detail.to_string(),
        };
        self.send(&message).await;
    }

    async fn send(&self, message: &Message) {
        if let Err(e) = self.notifier.deliver(message).await {
            error!("Failed to deliver {:?}: {}", message.subject, e);
        }
    }

    fn user_allowed(&self, uuid: &str) -> bool {
        self.config.whitelist.is_empty() || self.config.whitelist.iter().any(|w| w == uuid)
    }

    /// Addressed messages for one event.
    pub fn messages(&self, notification: &Notification) -> Vec<Message> {
        let user = notification.user();
        let mut out = Vec::new();

        let mut to_user = |to: Vec<String>, subject: &str, body: String| {
            let to: Vec<String> = to.into_iter().filter(|a| !a.is_empty()).collect();
            if !to.is_empty() && self.user_allowed(&user.uuid) {
                out.push(Message {
                    to: Recipient::Users(to),
                    subject: format!("{}{}", self.config.user_prefix, subject),
                    body,
                });
            }
        };

        let email: Vec<String> = user.email.iter().cloned().collect();
        let (operator_subject, always_operators) = match notification {
            Notification::LoginChanged { when, new_login, .. } => {
                to_user(
                    email,
                    "Your login name has been changed",
                    format!("At {} the login of account {} was changed from {} to {}.", when, user.uuid, user.login, new_login),
                );
                (format!("Account {} login name changed", user.login), true)
            }
            Notification::PasswordChanged { when, .. } => {
                to_user(
                    email,
                    "Your password has been changed",
                    format!("At {} the password of account {} ({}) was changed.", when, user.login, user.uuid),
                );
                (format!("Password changed for operator {}", user.login), false)
            }
            Notification::EmailChanged { when, new_email, .. } => {
                let mut both = email;
                both.push(new_email.clone());
                to_user(
                    both,
                    "Your email address has been changed",
                    format!(
                        "At {} the email address of account {} was changed from {} to {}.",
                        when,
                        user.login,
                        user.email.as_deref().unwrap_or("(none)"),
                        new_email
                    ),
                );
                (format!("Operator email change for {}", user.login), false)
            }
            Notification::UserDeleted { .. } => (format!("Operator account {} deleted", user.login), false),
            Notification::KeyAdded { when, key, other_keys, .. } => {
                to_user(email, "New SSH key added to your account", key_body(when, "added to", user, key, other_keys));
                (format!("SSH key added to operator {}", user.login), false)
            }
            Notification::KeyDeleted { when, key, other_keys, .. } => {
                to_user(email, "SSH key deleted from your account", key_body(when, "deleted from", user, key, other_keys));
                (format!("SSH key deleted from operator {}", user.login), false)
            }
            Notification::PrivilegeGranted { privilege, .. } => {
                (format!("New {} account {}", privilege.column(), user.login), true)
            }
            Notification::PrivilegeRevoked { privilege, .. } => {
                (format!("Demoted {} account {}", privilege.column(), user.login), true)
            }
        };

        if always_operators || user.is_privileged() {
            out.push(Message {
                to: Recipient::Operators,
                subject: format!("{}{}", self.config.operator_prefix, operator_subject),
                body: operator_body(notification),
            });
        }
        out
    }
}

fn key_body(when: &str, verb: &str, user: &UserRow, key: &KeyRow, others: &[KeyRow]) -> String {
    let mut body = format!(
        "At {} the SSH key {} ({}) was {} account {}.\n",
        when,
        key.name.as_deref().unwrap_or("unnamed"),
        key.fingerprint,
        verb,
        user.login
    );
    if others.is_empty() {
        body.push_str("The account has no other keys.\n");
    } else {
        body.push_str("Other keys on the account:\n");
        for other in others {
            body.push_str(&format!(
                "  {} {} {}\n",
                other.fingerprint,
                other.name.as_deref().unwrap_or("-"),
                other.comment.as_deref().unwrap_or("")
            ));
        }
    }
    body
}

fn operator_body(notification: &Notification) -> String {
    let user = notification.user();
    let event = match notification {
        Notification::LoginChanged { new_login, .. } => format!("login changed to {}", new_login),
        Notification::PasswordChanged { .. } => "password changed".to_string(),
        Notification::EmailChanged { new_email, .. } => format!("email changed to {}", new_email),
        Notification::UserDeleted { .. } => "account deleted".to_string(),
        Notification::KeyAdded { key, .. } => format!("SSH key {} added", key.fingerprint),
        Notification::KeyDeleted { key, .. } => format!("SSH key {} deleted", key.fingerprint),
        Notification::PrivilegeGranted { privilege, .. } => format!("added to {}", privilege.group_name()),
        Notification::PrivilegeRevoked { privilege, .. } => format!("removed from {}", privilege.group_name()),
    };
    format!(
        "Account {} ({}), operator={}, reader={}: {}",
        user.login, user.uuid, user.operator, user.reader, event
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(operator: bool) -> UserRow {
        UserRow {
            uuid: "u1".to_string(),
            login: "alice".to_string(),
            userpassword: None,
            email: Some("alice@example.com".to_string()),
            operator,
            reader: false,
        }
    }

    fn dispatcher(whitelist: Vec<String>) -> NotificationDispatcher {
        let config = NotifyConfig {
            whitelist,
            ..NotifyConfig::default()
        };
        NotificationDispatcher::new(Arc::new(TracingNotifier), config, false)
    }

    #[test]
    fn test_password_change_audience() {
        let d = dispatcher(Vec::new());
        let plain = d.messages(&Notification::PasswordChanged {
            when: "t".to_string(),
            user: user(false),
        });
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].to, Recipient::Users(vec!["alice@example.com".to_string()]));

        let operator = d.messages(&Notification::PasswordChanged {
            when: "t".to_string(),
            user: user(true),
        });
        assert_eq!(operator.len(), 2);
        assert_eq!(operator[1].to, Recipient::Operators);
    }

    #[test]
    fn test_whitelist_limits_user_mail() {
        let d = dispatcher(vec!["someone-else".to_string()]);
        let msgs = d.messages(&Notification::EmailChanged {
            when: "t".to_string(),
            user: user(false),
            new_email: "new@example.com".to_string(),
        });
        assert!(msgs.is_empty());
    }

    #[test]
    fn test_email_change_goes_to_both_addresses() {
        let d = dispatcher(vec!["u1".to_string()]);
        let msgs = d.messages(&Notification::EmailChanged {
            when: "t".to_string(),
            user: user(false),
            new_email: "new@example.com".to_string(),
        });
        assert_eq!(
            msgs[0].to,
            Recipient::Users(vec!["alice@example.com".to_string(), "new@example.com".to_string()])
        );
    }

    #[test]
    fn test_privilege_grant_always_reaches_operators() {
        let d = dispatcher(Vec::new());
        let msgs = d.messages(&Notification::PrivilegeGranted {
            when: "t".to_string(),
            user: user(false),
            privilege: Privilege::Reader,
        });
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, Recipient::Operators);
        assert!(msgs[0].subject.contains("New reader account alice"));
    }

    #[test]
    fn test_initial_sync_flag() {
        let d = NotificationDispatcher::new(Arc::new(TracingNotifier), NotifyConfig::default(), true);
        assert!(d.in_initial_sync());
        assert!(d.finish_initial_sync());
        assert!(!d.finish_initial_sync());
        assert!(!d.in_initial_sync());
    }
}

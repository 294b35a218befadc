//! Caller checks for the system bus.
//!
//! Root may act for anyone. Any other caller may only act for the local
//! account whose name it passes (or, for device-wide settings, the owner).

use thiserror::Error;

const PASSWD: &str = "/etc/passwd";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("caller is not permitted to act for '{user}'")]
    Denied { caller: u32, user: String },
}

impl From<AccessError> for zbus::fdo::Error {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::UnknownUser(_) => zbus::fdo::Error::Failed(e.to_string()),
            AccessError::Denied { .. } => zbus::fdo::Error::AccessDenied(e.to_string()),
        }
    }
}

/// UID of the peer that sent `header`, as reported by the bus.
pub async fn caller_uid(
    header: &zbus::message::Header<'_>,
    conn: &zbus::Connection,
) -> zbus::fdo::Result<u32> {
    let sender = header
        .sender()
        .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
    let dbus = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let name = zbus::names::BusName::try_from(sender.as_str())
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus.get_connection_unix_user(name).await
}

/// UID of `name` in passwd-formatted `text`.
fn uid_in_passwd(text: &str, name: &str) -> Option<u32> {
    text.lines().find_map(|line| {
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }
        fields.nth(1)?.parse().ok()
    })
}

pub fn uid_for_name(name: &str) -> Option<u32> {
    let text = std::fs::read_to_string(PASSWD).ok()?;
    uid_in_passwd(&text, name)
}

/// Allow `caller` to act for `user`.
pub fn authorize(
    caller: u32,
    user: &str,
    lookup: impl Fn(&str) -> Option<u32>,
) -> Result<(), AccessError> {
    if caller == 0 {
        return Ok(());
    }
    match lookup(user) {
        Some(uid) if uid == caller => Ok(()),
        Some(_) => {
            tracing::warn!(user, caller, "caller UID does not match target user");
            Err(AccessError::Denied {
                caller,
                user: user.to_string(),
            })
        }
        None => {
            tracing::warn!(user, caller, "caller named an unknown user");
            Err(AccessError::UnknownUser(user.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          alice:x:1000:1000:Alice:/home/alice:/bin/bash\n\
                          bob:x:1001:1001::/home/bob:/bin/sh\n";

    fn lookup(name: &str) -> Option<u32> {
        uid_in_passwd(SAMPLE, name)
    }

    #[test]
    fn test_uid_in_passwd() {
        assert_eq!(lookup("alice"), Some(1000));
        assert_eq!(lookup("bob"), Some(1001));
        assert_eq!(lookup("ali"), None);
        assert_eq!(uid_in_passwd("broken-line\n", "broken-line"), None);
    }

    #[test]
    fn test_root_may_act_for_anyone() {
        assert!(authorize(0, "alice", lookup).is_ok());
        assert!(authorize(0, "nobody-here", lookup).is_ok());
    }

    #[test]
    fn test_user_may_act_for_self_only() {
        assert!(authorize(1000, "alice", lookup).is_ok());
        assert_eq!(
            authorize(1001, "alice", lookup),
            Err(AccessError::Denied {
                caller: 1001,
                user: "alice".into()
            })
        );
    }

    #[test]
    fn test_unknown_user_is_refused() {
        assert_eq!(
            authorize(1000, "mallory", lookup),
            Err(AccessError::UnknownUser("mallory".into()))
        );
    }

    #[test]
    fn test_denied_maps_to_access_denied() {
        let err: zbus::fdo::Error = AccessError::Denied {
            caller: 1001,
            user: "alice".into(),
        }
        .into();
        assert!(matches!(err, zbus::fdo::Error::AccessDenied(_)));
    }
}

//! Identity strings and hub group naming.
//!
//! A full user id has the shape:
//!
//! ```text
//! {deviceId}|{userName}+{authService}/{company}/{team}
//! ```
//!
//! Derived group identifiers drop parts of it:
//!
//! - user group: `{userName}+{authService}/{company}/{team}` (all of a user's devices)
//! - team group: `{authService}/{company}/{team}` (everyone in a team)
//! - device group: `{deviceId}:{authService}/{company}/{team}` (a device, user unknown)

use crate::codec::ProtocolError;
use hmac::{Hmac, Mac};
use md5::Md5;
use std::fmt;

/// Separates the device id from the user name.
pub const DEVICE_USER_DELIMITER: char = '|';

/// Separates the user name from the auth service.
pub const USER_DELIMITER: char = '+';

/// Separates auth service, company and team.
pub const TEAM_DELIMITER: char = '/';

/// Separates the device id from the team scope when there is no user name.
pub const DEVICE_GROUP_DELIMITER: char = ':';

/// Prefix of every hashed hub name.
pub const NAME_HASH_PREFIX: &str = "u_";

type HmacMd5 = Hmac<Md5>;

/// A parsed full user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId {
    /// Device id (MAC address or GUID).
    pub device_id: String,
    /// User name.
    pub user_name: String,
    /// Authentication / people-graph service, e.g. `github.com`.
    pub auth_service: String,
    /// Company name or tenant id.
    pub company: String,
    /// Team name or id.
    pub team: String,
}

impl UserId {
    /// Create a user id from its components.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        user_name: impl Into<String>,
        auth_service: impl Into<String>,
        company: impl Into<String>,
        team: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_name: user_name.into(),
            auth_service: auth_service.into(),
            company: company.into(),
            team: team.into(),
        }
    }

    /// Parse a full user id.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidIdentity`] if any delimiter is missing
    /// or out of order.
    pub fn parse(user_id: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidIdentity(user_id.to_string());

        let (device_id, rest) = user_id.split_once(DEVICE_USER_DELIMITER).ok_or_else(invalid)?;
        let (user_name, scope) = rest.split_once(USER_DELIMITER).ok_or_else(invalid)?;
        let (auth_service, rest) = scope.split_once(TEAM_DELIMITER).ok_or_else(invalid)?;
        let (company, team) = rest.split_once(TEAM_DELIMITER).ok_or_else(invalid)?;

        Ok(Self::new(device_id, user_name, auth_service, company, team))
    }

    /// The `{authService}/{company}/{team}` group this user belongs to.
    #[must_use]
    pub fn team_group_id(&self) -> String {
        team_group_id(&self.auth_service, &self.company, &self.team)
    }

    /// The group addressing every device of this user.
    #[must_use]
    pub fn user_group_id(&self) -> String {
        user_group_id(&self.auth_service, &self.company, &self.team, &self.user_name)
    }

    /// The group addressing this device regardless of user.
    #[must_use]
    pub fn device_group_id(&self) -> String {
        device_group_id(&self.auth_service, &self.company, &self.team, &self.device_id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&full_user_id(
            &self.auth_service,
            &self.company,
            &self.team,
            &self.user_name,
            &self.device_id,
        ))
    }
}

/// Compose a full user id.
#[must_use]
pub fn full_user_id(
    auth_service: &str,
    company: &str,
    team: &str,
    user_name: &str,
    device_id: &str,
) -> String {
    format!(
        "{device_id}{DEVICE_USER_DELIMITER}{user_name}{USER_DELIMITER}{}",
        team_group_id(auth_service, company, team)
    )
}

/// Compose a user group id.
#[must_use]
pub fn user_group_id(auth_service: &str, company: &str, team: &str, user_name: &str) -> String {
    format!(
        "{user_name}{USER_DELIMITER}{}",
        team_group_id(auth_service, company, team)
    )
}

/// Compose a team group id.
#[must_use]
pub fn team_group_id(auth_service: &str, company: &str, team: &str) -> String {
    format!("{auth_service}{TEAM_DELIMITER}{company}{TEAM_DELIMITER}{team}")
}

/// Compose a device group id.
#[must_use]
pub fn device_group_id(auth_service: &str, company: &str, team: &str, device_id: &str) -> String {
    format!(
        "{device_id}{DEVICE_GROUP_DELIMITER}{}",
        team_group_id(auth_service, company, team)
    )
}

/// Groups a user is joined to on the hub, lower-cased.
///
/// Device groups can be addressed but are not joined automatically.
#[must_use]
pub fn user_groups(auth_service: &str, company: &str, team: &str, user_name: &str) -> Vec<String> {
    vec![
        user_group_id(auth_service, company, team, user_name).to_lowercase(),
        team_group_id(auth_service, company, team).to_lowercase(),
    ]
}

/// Check that an identity component contains none of the reserved delimiters.
#[must_use]
pub fn is_valid_component(component: &str) -> bool {
    !component.contains([
        DEVICE_USER_DELIMITER,
        USER_DELIMITER,
        TEAM_DELIMITER,
        DEVICE_GROUP_DELIMITER,
    ])
}

/// Check whether `sender` may message `recipient`.
///
/// Both must share the same `{authService}/{company}/{team}` scope. The
/// recipient may be a full user id, a user group, a device group or the team
/// group itself. Comparison ignores case.
#[must_use]
pub fn can_send_message(sender: &str, recipient: &str) -> bool {
    let Some(sender_scope) = sender
        .find(USER_DELIMITER)
        .map(|idx| &sender[idx + USER_DELIMITER.len_utf8()..])
    else {
        return false;
    };

    let recipient_scope = recipient
        .find(USER_DELIMITER)
        .or_else(|| recipient.find(DEVICE_GROUP_DELIMITER))
        .map_or(recipient, |idx| &recipient[idx + 1..]);

    sender_scope.to_lowercase() == recipient_scope.to_lowercase()
}

/// Hash a hub name with the channel's shared secret.
///
/// Returns `u_` followed by the lowercase hex HMAC-MD5 digest, so raw
/// identities never appear in hub metadata.
#[must_use]
pub fn name_hash(input: &str, key: &str) -> String {
    let mut mac =
        HmacMd5::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(input.as_bytes());
    format!("{NAME_HASH_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Path of the hub-management endpoint adding a user to a group.
#[must_use]
pub fn group_membership_path(hub: &str, group_hash: &str, user_hash: &str) -> String {
    format!("/api/v1/hubs/{hub}/groups/{group_hash}/users/{user_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str = "mac1|alice+svc/acme/eng";

    #[test]
    fn test_full_user_id_roundtrip() {
        let cases = [
            ("00-14-22-01-23-44", "vlad", "github.com", "contoso", "cse"),
            ("", "", "", "", ""),
            ("dev", "user@example.com", "teams.microsoft.com", "72f988bf", "My Team"),
        ];

        for (device, user, auth, company, team) in cases {
            let id = full_user_id(auth, company, team, user, device);
            let parsed = UserId::parse(&id).unwrap();
            assert_eq!(parsed, UserId::new(device, user, auth, company, team));
            assert_eq!(parsed.to_string(), id);
        }
    }

    #[test]
    fn test_parse_rejects_partial_ids() {
        assert!(UserId::parse("alice+svc/acme/eng").is_err());
        assert!(UserId::parse("mac1|alice/acme/eng").is_err());
        assert!(UserId::parse("mac1|alice+svc/acme").is_err());
    }

    #[test]
    fn test_group_ids() {
        let id = UserId::parse(SENDER).unwrap();
        assert_eq!(id.team_group_id(), "svc/acme/eng");
        assert_eq!(id.user_group_id(), "alice+svc/acme/eng");
        assert_eq!(id.device_group_id(), "mac1:svc/acme/eng");
    }

    #[test]
    fn test_user_groups_lowercased() {
        let groups = user_groups("GitHub.com", "Contoso", "CSE", "Vlad");
        assert_eq!(groups, vec!["vlad+github.com/contoso/cse", "github.com/contoso/cse"]);
    }

    #[test]
    fn test_can_send_message() {
        assert!(can_send_message(SENDER, "svc/acme/eng"));
        assert!(can_send_message(SENDER, "bob+svc/acme/eng"));
        assert!(can_send_message(SENDER, "mac2|bob+svc/acme/eng"));
        assert!(can_send_message(SENDER, "mac2:svc/acme/eng"));
        assert!(can_send_message(SENDER, "BOB+SVC/Acme/Eng"));
        assert!(!can_send_message(SENDER, "bob+svc/acme/sales"));
        assert!(!can_send_message("no-user-delimiter", "svc/acme/eng"));
    }

    #[test]
    fn test_valid_component() {
        assert!(is_valid_component("alice"));
        for bad in ["a|b", "a+b", "a/b", "a:b"] {
            assert!(!is_valid_component(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_name_hash() {
        let hash = name_hash("svc/acme/eng", "secret");
        assert!(hash.starts_with(NAME_HASH_PREFIX));
        assert_eq!(hash.len(), NAME_HASH_PREFIX.len() + 32);
        assert_eq!(hash, name_hash("svc/acme/eng", "secret"));
        assert_ne!(hash, name_hash("svc/acme/eng", "other"));
    }

    #[test]
    fn test_group_membership_path() {
        assert_eq!(
            group_membership_path("chat", "u_1", "u_2"),
            "/api/v1/hubs/chat/groups/u_1/users/u_2"
        );
    }
}

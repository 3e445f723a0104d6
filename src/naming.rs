//! SSH user-name encoding for gomote instances.
//!
//! The user name is `["mutable-"] "user-" <owner> "-" <goos> "-" <goarch> ["-" <suffix>]`.
//! A leading `mutable-` means the caller accepts responsibility for changes
//! to a non-hermetic host.

const MUTABLE_PREFIX: &str = "mutable-";
const USER_PREFIX: &str = "user-";

/// A parsed SSH user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceName {
    /// Session id with any `mutable-` prefix removed.
    pub session_id: String,
    /// Whether the caller asked for the mutable override.
    pub mutable: bool,
}

impl InstanceName {
    pub fn parse(user: &str) -> Self {
        match user.strip_prefix(MUTABLE_PREFIX) {
            Some(rest) => Self {
                session_id: rest.to_string(),
                mutable: true,
            },
            None => Self {
                session_id: user.to_string(),
                mutable: false,
            },
        }
    }

    /// The owner encoded in the session id, or an empty string.
    pub fn owner(&self) -> &str {
        owner_from_instance_name(&self.session_id)
    }
}

/// Return the owner part of an instance name such as `user-alice-linux-amd64-0`.
///
/// The `mutable-` prefix is ignored. Anything not starting with `user-`, or
/// with no hyphen after the owner, yields an empty owner.
pub fn owner_from_instance_name(name: &str) -> &str {
    let name = name.strip_prefix(MUTABLE_PREFIX).unwrap_or(name);
    let Some(rest) = name.strip_prefix(USER_PREFIX) else {
        return "";
    };
    match rest.find('-') {
        Some(hyphen) => &rest[..hyphen],
        None => "",
    }
}

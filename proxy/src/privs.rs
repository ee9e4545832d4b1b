// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Privilege dropping for the proxy daemon.

use nix::unistd::{Gid, Group, Uid, User};
use std::ffi::CString;
use std::str::FromStr;
use thiserror::Error;

/// The target identity named on the command line: `user`, `:group`, or
/// `user:group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidGid {
    user: Option<String>,
    group: Option<String>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UidGidParseError {
    #[error("empty user/group specification")]
    Empty,
}

impl FromStr for UidGid {
    type Err = UidGidParseError;

    fn from_str(spec: &str) -> Result<UidGid, UidGidParseError> {
        let (user, group) = match spec.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (spec, None),
        };
        let user = (!user.is_empty()).then(|| user.to_string());
        let group = match group {
            Some(group) if group.is_empty() => return Err(UidGidParseError::Empty),
            Some(group) => Some(group.to_string()),
            None => None,
        };
        if user.is_none() && group.is_none() {
            return Err(UidGidParseError::Empty);
        }
        Ok(UidGid { user, group })
    }
}

#[derive(Error, Debug)]
pub enum PrivError {
    #[error("user not found: {0}")]
    UnknownUser(String),

    #[error("group not found: {0}")]
    UnknownGroup(String),

    #[error("user name is not a legal C string")]
    BadUserName,

    #[error("cannot drop privileges: {0}")]
    Sys(#[from] nix::Error),
}

/// Resolve `spec` and switch to it: supplementary groups first, then gid,
/// then uid, so no step can undo a later one.
///
/// # Errors
///
/// Unknown names and any failing system call. Callers must treat this as
/// fatal; continuing with partial privileges is worse than not starting.
pub fn drop_privileges(spec: &UidGid) -> Result<(), PrivError> {
    let user = match &spec.user {
        Some(name) => Some(
            User::from_name(name)?.ok_or_else(|| PrivError::UnknownUser(name.clone()))?,
        ),
        None => None,
    };
    let gid = match &spec.group {
        Some(name) => {
            Group::from_name(name)?
                .ok_or_else(|| PrivError::UnknownGroup(name.clone()))?
                .gid
        }
        None => match &user {
            Some(user) => user.gid,
            None => Gid::current(),
        },
    };

    match &user {
        Some(user) => {
            let name = CString::new(user.name.as_str()).map_err(|_| PrivError::BadUserName)?;
            nix::unistd::initgroups(&name, gid)?;
        }
        None => nix::unistd::setgroups(&[gid])?,
    }
    nix::unistd::setgid(gid)?;
    if let Some(user) = user {
        nix::unistd::setuid(user.uid)?;
        // Regaining root must be impossible from here on.
        if user.uid != Uid::from_raw(0) && nix::unistd::setuid(Uid::from_raw(0)).is_ok() {
            return Err(PrivError::Sys(nix::Error::EPERM));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{UidGid, UidGidParseError};
    use std::str::FromStr;

    #[test]
    fn parses_the_three_spec_forms() {
        assert_eq!(
            UidGid::from_str("alice").unwrap(),
            UidGid {
                user: Some("alice".to_string()),
                group: None,
            }
        );
        assert_eq!(
            UidGid::from_str(":wheel").unwrap(),
            UidGid {
                user: None,
                group: Some("wheel".to_string()),
            }
        );
        assert_eq!(
            UidGid::from_str("alice:wheel").unwrap(),
            UidGid {
                user: Some("alice".to_string()),
                group: Some("wheel".to_string()),
            }
        );
    }

    #[test]
    fn rejects_empty_specs() {
        assert_eq!(UidGid::from_str(""), Err(UidGidParseError::Empty));
        assert_eq!(UidGid::from_str(":"), Err(UidGidParseError::Empty));
        assert_eq!(UidGid::from_str("alice:"), Err(UidGidParseError::Empty));
    }
}

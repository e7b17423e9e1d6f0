//! Utility functions used to extract process ancestry from procfs

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
};

use nix::unistd::{Pid, Uid, User};
use serde::Serialize;
use thiserror::Error;

/// Value of `/proc/<pid>/loginuid` for processes without a login session.
const UNSET_LOGINUID: u32 = u32::MAX;

/// Upper bound on the number of ancestors collected for one process.
const MAX_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),
    #[error("user id for process {0} not found")]
    UserNotFound(Pid),
    #[error("invalid value {value:?} in {path}")]
    InvalidValue { path: String, value: String },
}

/// One step of a process ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ancestor {
    pub pid: i32,
    pub cmdline: String,
    pub username: String,
}

/// Returns the command line for the given process.
pub fn get_process_command_line(pid: Pid) -> Result<Vec<String>, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = fs::read(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(data
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect())
}

/// Returns the command name for the given process.
pub fn get_process_comm(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/comm");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(data.trim().to_owned())
}

/// Returns the value of a `Key:` line in `/proc/<pid>/status`.
fn get_status_field(pid: Pid, key: &str) -> Result<Option<String>, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some((name, value)) = line.split_once(':') {
            if name == key {
                return Ok(Some(value.trim().to_string()));
            }
        }
    }
    Ok(None)
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    let value = get_status_field(pid, "PPid")?.ok_or(ProcfsError::ParentNotFound(pid))?;
    value
        .parse()
        .map(Pid::from_raw)
        .map_err(|_| ProcfsError::InvalidValue {
            path: format!("/proc/{pid}/status"),
            value,
        })
}

/// Returns the real user id of a given process.
pub fn get_process_user_id(pid: Pid) -> Result<Uid, ProcfsError> {
    let value = get_status_field(pid, "Uid")?.ok_or(ProcfsError::UserNotFound(pid))?;
    value
        .split_whitespace()
        .next()
        .and_then(|uid| uid.parse().ok())
        .map(Uid::from_raw)
        .ok_or_else(|| ProcfsError::InvalidValue {
            path: format!("/proc/{pid}/status"),
            value,
        })
}

/// Returns the audit login uid of a given process, `None` when it is unset.
pub fn get_process_loginuid(pid: Pid) -> Result<Option<Uid>, ProcfsError> {
    let path = format!("/proc/{pid}/loginuid");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path: path.clone() })?;
    let loginuid: u32 = data
        .trim()
        .parse()
        .map_err(|_| ProcfsError::InvalidValue {
            path,
            value: data.trim().to_string(),
        })?;
    Ok((loginuid != UNSET_LOGINUID).then(|| Uid::from_raw(loginuid)))
}

/// Name of the user owning `uid`, or the numeric uid if it cannot be resolved.
pub fn username(uid: Uid) -> String {
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Describe a single process.
pub fn get_ancestor(pid: Pid) -> Result<Ancestor, ProcfsError> {
    let mut cmdline = get_process_command_line(pid)?.join(" ");
    // kernel threads have an empty command line
    if cmdline.is_empty() {
        cmdline = format!("[{}]", get_process_comm(pid)?);
    }
    let uid = get_process_user_id(pid)?;
    Ok(Ancestor {
        pid: pid.as_raw(),
        cmdline,
        username: username(uid),
    })
}

/// Collect the ancestry of `pid`, starting with the process itself and stopping
/// before init.
///
/// Fails only if `pid` itself cannot be inspected: an ancestor exiting while
/// we walk the tree just truncates the result.
pub fn crawl_process_tree(pid: Pid) -> Result<Vec<Ancestor>, ProcfsError> {
    let mut tree = vec![get_ancestor(pid)?];
    let mut current = get_process_parent_pid(pid)?;

    while current.as_raw() > 1 && tree.len() < MAX_DEPTH {
        let Ok(ancestor) = get_ancestor(current) else {
            break;
        };
        tree.push(ancestor);
        current = match get_process_parent_pid(current) {
            Ok(parent) => parent,
            Err(_) => break,
        };
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_tree() {
        let tree = crawl_process_tree(Pid::this()).unwrap();
        assert_eq!(tree[0].pid, Pid::this().as_raw());
        assert!(!tree[0].cmdline.is_empty());
        assert!(tree.iter().all(|ancestor| ancestor.pid > 1));
        assert_eq!(tree[0].username, username(nix::unistd::getuid()));
    }

    #[test]
    fn parent_matches_nix() {
        assert_eq!(
            get_process_parent_pid(Pid::this()).unwrap(),
            nix::unistd::getppid()
        );
    }

    #[test]
    fn vanished_process_is_an_error() {
        // pid_max is at most 2^22
        let err = crawl_process_tree(Pid::from_raw(i32::MAX)).unwrap_err();
        assert!(matches!(err, ProcfsError::ReadFile { .. }));
    }
}

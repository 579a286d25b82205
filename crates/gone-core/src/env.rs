//! Inheritance environment: decoding what a parent (or the supervisor)
//! announced, and encoding the same announcement for a child.
//!
//! Descriptors are passed positionally starting at [`LISTEN_FDS_START`].
//! `LISTEN_FDNAMES` and `GONE_FDINFO` are colon-separated lists aligned with
//! those slots.

use std::os::fd::RawFd;

use tracing::{debug, trace};

use crate::error::{EnvError, EnvResult};
use crate::file::{HandoffFile, HandoffKind};

/// Number of inherited descriptors.
pub const LISTEN_FDS: &str = "LISTEN_FDS";

/// PID the announcement is meant for.
pub const LISTEN_PID: &str = "LISTEN_PID";

/// When set, a mismatching `LISTEN_PID` is accepted anyway.
pub const LISTEN_PID_IGNORE: &str = "LISTEN_PID_IGNORE";

/// Colon-separated descriptor names.
pub const LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";

/// Colon-separated per-descriptor flags.
pub const GONE_FDINFO: &str = "GONE_FDINFO";

/// PID of a process waiting to be told its replacement is ready.
pub const NEWSTYLE_PID: &str = "NEWSTYLE_PID";

/// Signal number the waiting process wants to receive.
pub const NEWSTYLE_SIG: &str = "NEWSTYLE_SIG";

/// First descriptor slot used for passing.
pub const LISTEN_FDS_START: RawFd = 3;

/// `GONE_FDINFO` flag marking a descriptor as a UNIX socket path lock.
pub const FDINFO_LOCK: &str = "lock";

/// Variables consumed by [`parse_inheritance`] and cleared afterwards.
pub const INHERITANCE_VARS: [&str; 4] = [LISTEN_FDS, LISTEN_PID, LISTEN_FDNAMES, GONE_FDINFO];

/// A decoded announcement of inherited descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inheritance {
    /// One name per slot; empty when the parent gave none.
    pub names: Vec<String>,
    /// Whether each slot is a lock for the preceding socket.
    pub locks: Vec<bool>,
}

impl Inheritance {
    /// Number of inherited descriptors.
    pub fn count(&self) -> usize {
        self.names.len()
    }
}

/// Decodes the inheritance announcement visible through `lookup`.
///
/// Returns `Ok(None)` for a cold start (no or zero `LISTEN_FDS`) and for an
/// announcement addressed to a different PID, unless `LISTEN_PID_IGNORE` is
/// set.
pub fn parse_inheritance<F>(lookup: F, pid: u32) -> EnvResult<Option<Inheritance>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(LISTEN_PID) {
        let target: u32 = raw.trim().parse().map_err(|_| EnvError::Invalid {
            var: LISTEN_PID,
            reason: format!("{raw:?} is not a process id"),
        })?;
        if target != pid {
            if lookup(LISTEN_PID_IGNORE).is_none() {
                debug!(target, pid, "Ignoring inherited descriptors addressed to another process");
                return Ok(None);
            }
            debug!(target, pid, "LISTEN_PID mismatch ignored by request");
        }
    }

    let count = match lookup(LISTEN_FDS) {
        Some(raw) => parse_count(&raw)?,
        None => {
            trace!("No inherited descriptors: $LISTEN_FDS is missing");
            return Ok(None);
        }
    };
    if count == 0 {
        return Ok(None);
    }

    let names = match lookup(LISTEN_FDNAMES) {
        Some(raw) => split_aligned(LISTEN_FDNAMES, &raw, count)?,
        None => vec![String::new(); count],
    };

    let locks = match lookup(GONE_FDINFO) {
        Some(raw) => split_aligned(GONE_FDINFO, &raw, count)?
            .iter()
            .map(|entry| entry.split(',').any(|flag| flag == FDINFO_LOCK))
            .collect(),
        None => vec![false; count],
    };

    Ok(Some(Inheritance { names, locks }))
}

fn parse_count(raw: &str) -> EnvResult<usize> {
    let count: usize = raw.trim().parse().map_err(|_| EnvError::Invalid {
        var: LISTEN_FDS,
        reason: format!("{raw:?} is not a descriptor count"),
    })?;
    let fits = RawFd::try_from(count)
        .ok()
        .and_then(|n| n.checked_add(LISTEN_FDS_START))
        .is_some();
    if !fits {
        return Err(EnvError::Invalid {
            var: LISTEN_FDS,
            reason: format!("{count} is too large"),
        });
    }
    Ok(count)
}

fn split_aligned(var: &'static str, raw: &str, expected: usize) -> EnvResult<Vec<String>> {
    let parts: Vec<String> = raw.split(':').map(str::to_string).collect();
    if parts.len() != expected {
        return Err(EnvError::LengthMismatch {
            var,
            got: parts.len(),
            expected,
        });
    }
    Ok(parts)
}

/// Renders the announcement describing `files` placed at consecutive slots
/// from [`LISTEN_FDS_START`].
///
/// `GONE_FDINFO` is only emitted when at least one lock is present, keeping
/// the output readable by plain socket-activation consumers.
pub fn handoff_env(files: &[HandoffFile]) -> Vec<(&'static str, String)> {
    if files.is_empty() {
        return Vec::new();
    }

    let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    let mut vars = vec![
        (LISTEN_FDS, files.len().to_string()),
        (LISTEN_FDNAMES, names.join(":")),
    ];

    if files.iter().any(|f| f.kind == HandoffKind::Lock) {
        let info: Vec<&str> = files
            .iter()
            .map(|f| match f.kind {
                HandoffKind::Lock => FDINFO_LOCK,
                HandoffKind::Socket => "",
            })
            .collect();
        vars.push((GONE_FDINFO, info.join(":")));
    }

    vars
}

/// Returns true if `name` can be carried in `LISTEN_FDNAMES`.
pub fn is_valid_name(name: &str) -> bool {
    !name.contains([':', '\n', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_cold_start() {
        assert_eq!(parse_inheritance(lookup(&[]), 1).unwrap(), None);
        assert_eq!(
            parse_inheritance(lookup(&[(LISTEN_FDS, "0")]), 1).unwrap(),
            None
        );
    }

    #[test]
    fn test_names_and_locks() {
        let vars = lookup(&[
            (LISTEN_FDS, "3"),
            (LISTEN_PID, "42"),
            (LISTEN_FDNAMES, "web:web:admin"),
            (GONE_FDINFO, ":lock:"),
        ]);
        let inheritance = parse_inheritance(vars, 42).unwrap().unwrap();
        assert_eq!(inheritance.count(), 3);
        assert_eq!(inheritance.names, vec!["web", "web", "admin"]);
        assert_eq!(inheritance.locks, vec![false, true, false]);
    }

    #[test]
    fn test_missing_names_default_to_empty() {
        let inheritance = parse_inheritance(lookup(&[(LISTEN_FDS, "2")]), 1)
            .unwrap()
            .unwrap();
        assert_eq!(inheritance.names, vec!["", ""]);
        assert_eq!(inheritance.locks, vec![false, false]);
    }

    #[test]
    fn test_pid_mismatch() {
        let vars = [(LISTEN_FDS, "1"), (LISTEN_PID, "7")];
        assert_eq!(parse_inheritance(lookup(&vars), 8).unwrap(), None);

        let vars = [(LISTEN_FDS, "1"), (LISTEN_PID, "7"), (LISTEN_PID_IGNORE, "1")];
        assert!(parse_inheritance(lookup(&vars), 8).unwrap().is_some());
    }

    #[test]
    fn test_malformed_values() {
        let err = parse_inheritance(lookup(&[(LISTEN_FDS, "two")]), 1).unwrap_err();
        assert!(matches!(err, EnvError::Invalid { var: LISTEN_FDS, .. }));

        let err = parse_inheritance(lookup(&[(LISTEN_FDS, "1"), (LISTEN_PID, "x")]), 1)
            .unwrap_err();
        assert!(matches!(err, EnvError::Invalid { var: LISTEN_PID, .. }));

        let vars = [(LISTEN_FDS, "2"), (LISTEN_FDNAMES, "only-one")];
        let err = parse_inheritance(lookup(&vars), 1).unwrap_err();
        assert_eq!(
            err,
            EnvError::LengthMismatch {
                var: LISTEN_FDNAMES,
                got: 1,
                expected: 2
            }
        );

        let huge = (i32::MAX as u64).to_string();
        let err = parse_inheritance(lookup(&[(LISTEN_FDS, huge.as_str())]), 1).unwrap_err();
        assert!(matches!(err, EnvError::Invalid { var: LISTEN_FDS, .. }));
    }

    #[test]
    fn test_handoff_env_round_trips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let file = |name: &str, kind| HandoffFile {
            name: name.to_string(),
            fd: std::fs::File::create(dir.path().join(format!("{name}-{kind:?}")))
                .unwrap()
                .into(),
            kind,
        };
        let files = vec![
            file("web", HandoffKind::Socket),
            file("ctl", HandoffKind::Socket),
            file("ctl", HandoffKind::Lock),
        ];

        let vars = handoff_env(&files);
        let map: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        assert!(map.contains(&(LISTEN_FDS, "3")));
        assert!(map.contains(&(LISTEN_FDNAMES, "web:ctl:ctl")));
        assert!(map.contains(&(GONE_FDINFO, "::lock")));

        let inheritance = parse_inheritance(lookup(&map), 1).unwrap().unwrap();
        assert_eq!(inheritance.names, vec!["web", "ctl", "ctl"]);
        assert_eq!(inheritance.locks, vec![false, false, true]);
    }

    #[test]
    fn test_handoff_env_without_locks_omits_fdinfo() {
        let files = vec![HandoffFile {
            name: "web".to_string(),
            fd: tempfile::tempfile().unwrap().into(),
            kind: HandoffKind::Socket,
        }];
        let vars = handoff_env(&files);
        assert!(vars.iter().all(|(k, _)| *k != GONE_FDINFO));
        assert!(handoff_env(&[]).is_empty());
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name(""));
        assert!(!is_valid_name("a:b"));
        assert!(!is_valid_name("a\nb"));
    }
}

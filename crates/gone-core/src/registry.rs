//! The process-wide descriptor registry.
//!
//! The registry tracks two sets of descriptors:
//!
//! ```text
//!   inherit() ──▶ available ──file_with()──▶ caller ──export()──▶ active
//!                    ▲  │                                         │  │
//!                    │  └──cleanup() closes──▶ ✗      forget() ◀──┘  │
//!                    └──────────────────── reset() ◀─────────────────┘
//! ```
//!
//! `available` entries were inherited (or demoted by a reset) and are
//! waiting to be claimed; `active` entries are owned by a live exporter and
//! make up the next handoff to a child process or the supervisor.
//!
//! All state sits behind one mutex that is held only for map updates and
//! the cheap descriptor syscalls predicates make. Descriptors removed from
//! the registry are closed after the lock is released.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::env::{self, Inheritance, INHERITANCE_VARS, LISTEN_FDS, LISTEN_FDS_START};
use crate::error::{EnvError, RegistryError, RegistryResult};
use crate::fd;
use crate::file::{
    Disposition, FileSummary, HandoffFile, HandoffKind, InheritedFile, OwnerToken,
    RegisteredFile,
};
use crate::predicate::{self, Predicate};

/// What [`Registry::forget`] should release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgetTarget {
    /// The single entry exported under this token.
    Owner(OwnerToken),
    /// Every active entry exported under this name.
    Name(String),
}

impl From<OwnerToken> for ForgetTarget {
    fn from(token: OwnerToken) -> Self {
        Self::Owner(token)
    }
}

impl From<&str> for ForgetTarget {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for ForgetTarget {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

#[derive(Default)]
struct State {
    available: Vec<RegisteredFile>,
    active: BTreeMap<OwnerToken, RegisteredFile>,
    next_token: u64,
}

impl State {
    fn mint(&mut self) -> OwnerToken {
        self.next_token += 1;
        OwnerToken::new(self.next_token)
    }
}

/// Registry of inherited and exported descriptors.
///
/// Descriptor handoff is a process-level concern, so a program should build
/// exactly one registry at startup (normally with [`Registry::inherit`]) and
/// share it behind an `Arc`. Tests build isolated instances with
/// [`Registry::new`] or [`Registry::inherit_from`].
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
    inherit_error: Option<EnvError>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries())
            .field("inherit_error", &self.inherit_error)
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the process environment.
    ///
    /// Call once from `main`, before any other thread exists: the
    /// inheritance variables are removed from the environment afterwards so
    /// later children do not see stale announcements, and changing the
    /// environment is only sound while nothing else can read it. Decoding failures are recorded, not raised: the
    /// registry then starts with nothing available and
    /// [`inherit_error`](Self::inherit_error) reports what went wrong.
    pub fn inherit() -> Self {
        let registry = Self::inherit_from(
            |key| std::env::var(key).ok(),
            std::process::id(),
            LISTEN_FDS_START,
        );
        for var in INHERITANCE_VARS {
            std::env::remove_var(var);
        }
        registry
    }

    /// Builds the registry from an arbitrary environment lookup, adopting
    /// descriptors starting at `first_fd`.
    pub fn inherit_from<F>(lookup: F, pid: u32, first_fd: RawFd) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let announced = lookup(LISTEN_FDS).and_then(|raw| raw.trim().parse::<RawFd>().ok());

        let inheritance = match env::parse_inheritance(&lookup, pid) {
            Ok(Some(inheritance)) => inheritance,
            Ok(None) => return Self::new(),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed inheritance environment");
                if let Some(count) = announced {
                    seal_slots(first_fd, count);
                }
                return Self::failed(e);
            }
        };

        match adopt(first_fd, &inheritance) {
            Ok(available) => {
                info!(
                    count = available.len(),
                    names = ?inheritance.names,
                    "Inherited descriptors"
                );
                Self {
                    state: Mutex::new(State {
                        available,
                        ..State::default()
                    }),
                    inherit_error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Refusing inherited descriptors");
                Self::failed(e)
            }
        }
    }

    fn failed(error: EnvError) -> Self {
        Self {
            state: Mutex::default(),
            inherit_error: Some(error),
        }
    }

    /// Returns the error recorded while decoding the inheritance
    /// environment, if any.
    pub fn inherit_error(&self) -> Option<EnvError> {
        self.inherit_error.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mints a fresh owner token without exporting anything.
    pub fn mint_token(&self) -> OwnerToken {
        self.lock().mint()
    }

    /// Exports a duplicate of `file` under a freshly minted token.
    pub fn export(&self, name: &str, file: &impl AsFd) -> RegistryResult<OwnerToken> {
        let token = self.mint_token();
        self.export_as(token, name, file, None)?;
        Ok(token)
    }

    /// Exports a duplicate of `file` under `token`.
    ///
    /// The registry always keeps its own duplicate, so the caller may close
    /// `file` independently. The duplicate is switched to non-blocking mode
    /// (which, being a file status flag, the caller's copy shares). `lock` is
    /// the advisory lock guarding the socket's path, if there is one.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidName` if `name` cannot be announced
    /// - `RegistryError::AlreadyExported` if `token` is active, or the same
    ///   socket is already active under another token
    /// - `RegistryError::Io` if duplicating the descriptor fails
    pub fn export_as(
        &self,
        token: OwnerToken,
        name: &str,
        file: &impl AsFd,
        lock: Option<File>,
    ) -> RegistryResult<()> {
        if !env::is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let dup = file
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| RegistryError::io("dup", e))?;
        fd::ensure_nonblocking(dup.as_fd()).map_err(|e| RegistryError::io("fcntl", e))?;
        let identity = fd::socket_identity(dup.as_fd()).ok().flatten();

        let mut state = self.lock();
        if let Some(existing) = state.active.get(&token) {
            return Err(RegistryError::AlreadyExported {
                name: existing.name.clone(),
                token,
            });
        }
        if let Some(identity) = identity {
            let clash = state
                .active
                .iter()
                .find(|(_, entry)| entry.identity == Some(identity));
            if let Some((owner, entry)) = clash {
                return Err(RegistryError::AlreadyExported {
                    name: entry.name.clone(),
                    token: *owner,
                });
            }
        }

        debug!(%token, name, "Exported descriptor");
        state.active.insert(
            token,
            RegisteredFile {
                fd: dup,
                name: name.to_string(),
                lock,
                identity,
            },
        );
        Ok(())
    }

    /// Releases active entries, closing their descriptors and lock files.
    ///
    /// Returns the number of entries released.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotExported` if nothing matched
    pub fn forget(&self, target: impl Into<ForgetTarget>) -> RegistryResult<usize> {
        let target = target.into();
        let removed: Vec<RegisteredFile> = {
            let mut state = self.lock();
            match &target {
                ForgetTarget::Owner(token) => state.active.remove(token).into_iter().collect(),
                ForgetTarget::Name(name) => {
                    let tokens: Vec<OwnerToken> = state
                        .active
                        .iter()
                        .filter(|(_, entry)| &entry.name == name)
                        .map(|(token, _)| *token)
                        .collect();
                    tokens
                        .iter()
                        .filter_map(|token| state.active.remove(token))
                        .collect()
                }
            }
        };

        if removed.is_empty() {
            return Err(RegistryError::NotExported(match target {
                ForgetTarget::Owner(token) => token.to_string(),
                ForgetTarget::Name(name) => name,
            }));
        }

        debug!(count = removed.len(), ?target, "Forgot descriptors");
        Ok(removed.len())
    }

    /// Claims the first available entry named `want_name` (any name when
    /// empty) that satisfies every predicate.
    ///
    /// The entry leaves the registry entirely; export it again to keep it
    /// in the next handoff. Anything that should disqualify a candidate
    /// must be expressed as a predicate, since a claimed file cannot be put
    /// back.
    pub fn file_with(&self, want_name: &str, predicates: &[Predicate]) -> Option<InheritedFile> {
        let mut state = self.lock();
        let index = state.available.iter().position(|entry| {
            (want_name.is_empty() || entry.name == want_name)
                && predicate::all(predicates, entry.fd.as_fd())
        })?;
        let entry = state.available.remove(index);
        debug!(name = %entry.name, "Claimed available descriptor");
        Some(InheritedFile {
            fd: entry.fd,
            name: entry.name,
            lock: entry.lock,
        })
    }

    /// Closes every available entry nobody claimed.
    ///
    /// Returns the number of descriptors closed.
    pub fn cleanup(&self) -> usize {
        let unclaimed = std::mem::take(&mut self.lock().available);
        for entry in &unclaimed {
            debug!(name = %entry.name, "Closing unclaimed descriptor");
        }
        unclaimed.len()
    }

    /// Demotes every active entry back to available without closing it,
    /// so the next configuration can claim it again.
    pub fn reset(&self) {
        let mut state = self.lock();
        let active = std::mem::take(&mut state.active);
        let demoted = active.len();
        state.available.extend(active.into_values());
        debug!(demoted, available = state.available.len(), "Registry reset");
    }

    /// Promotes every available entry to active under fresh tokens.
    ///
    /// This undoes a [`reset`](Self::reset) whose follow-up configuration
    /// was abandoned, so the entries stay in the next handoff.
    pub fn reactivate(&self) -> Vec<OwnerToken> {
        let mut state = self.lock();
        let available = std::mem::take(&mut state.available);
        available
            .into_iter()
            .map(|entry| {
                let token = state.mint();
                state.active.insert(token, entry);
                token
            })
            .collect()
    }

    /// Duplicates every active descriptor, in export order, for passing to
    /// another process. A lock file follows the socket it guards.
    pub fn handoff_files(&self) -> RegistryResult<Vec<HandoffFile>> {
        let state = self.lock();
        let mut files = Vec::with_capacity(state.active.len());
        for entry in state.active.values() {
            files.push(HandoffFile {
                name: entry.name.clone(),
                fd: entry
                    .fd
                    .try_clone()
                    .map_err(|e| RegistryError::io("dup", e))?,
                kind: HandoffKind::Socket,
            });
            if let Some(lock) = &entry.lock {
                let lock = lock.try_clone().map_err(|e| RegistryError::io("dup", e))?;
                files.push(HandoffFile {
                    name: entry.name.clone(),
                    fd: OwnedFd::from(lock),
                    kind: HandoffKind::Lock,
                });
            }
        }
        Ok(files)
    }

    /// Returns a snapshot of every entry, available first.
    pub fn entries(&self) -> Vec<FileSummary> {
        let state = self.lock();
        state
            .available
            .iter()
            .map(|entry| entry.summary(Disposition::Available))
            .chain(
                state
                    .active
                    .values()
                    .map(|entry| entry.summary(Disposition::Active)),
            )
            .collect()
    }

    /// Number of entries waiting to be claimed.
    pub fn available_count(&self) -> usize {
        self.lock().available.len()
    }

    /// Names of the available entries, in match order.
    pub fn available_names(&self) -> Vec<String> {
        self.lock()
            .available
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of exported entries.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Returns true if `token` currently owns an active entry.
    pub fn is_active(&self, token: OwnerToken) -> bool {
        self.lock().active.contains_key(&token)
    }
}

/// Marks announced slots close-on-exec without adopting them.
fn seal_slots(first_fd: RawFd, count: RawFd) {
    for fd in (0..count).filter_map(|i| first_fd.checked_add(i)) {
        if fd::is_open(fd) {
            let _ = fd::set_cloexec_raw(fd);
        }
    }
}

/// Wraps every announced slot as an available entry, attaching lock slots
/// to the socket before them.
fn adopt(first_fd: RawFd, inheritance: &Inheritance) -> Result<Vec<RegisteredFile>, EnvError> {
    let slots: Vec<RawFd> = (0..inheritance.count())
        .map(|i| {
            RawFd::try_from(i)
                .ok()
                .and_then(|i| first_fd.checked_add(i))
                .ok_or(EnvError::BadDescriptor { fd: first_fd })
        })
        .collect::<Result<_, _>>()?;

    // Seal everything before deciding anything, so nothing leaks into a
    // child even if adoption is refused.
    for &slot in &slots {
        if !fd::is_open(slot) {
            seal_slots(first_fd, slots.len() as RawFd);
            return Err(EnvError::BadDescriptor { fd: slot });
        }
        fd::set_cloexec_raw(slot).map_err(|_| EnvError::BadDescriptor { fd: slot })?;
    }

    let mut available: Vec<RegisteredFile> = Vec::with_capacity(slots.len());
    for ((slot, name), is_lock) in slots
        .into_iter()
        .zip(&inheritance.names)
        .zip(&inheritance.locks)
    {
        // SAFETY: the slot was announced to this process, is open, and is
        // wrapped exactly once here.
        let owned = unsafe { OwnedFd::from_raw_fd(slot) };

        if *is_lock {
            match available.last_mut() {
                Some(owner) => owner.lock = Some(File::from(owned)),
                None => warn!(fd = slot, "Dropping lock descriptor with no socket before it"),
            }
            continue;
        }

        let identity = fd::socket_identity(owned.as_fd()).ok().flatten();
        available.push(RegisteredFile {
            fd: owned,
            name: name.clone(),
            lock: None,
            identity,
        });
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::net::TcpListener;

    #[test]
    fn test_export_twice_under_same_token_fails() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let token = registry.export("web", &listener).unwrap();
        let err = registry
            .export_as(token, "web", &listener, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExported { token: t, .. } if t == token));

        registry.forget(token).unwrap();
        registry.export_as(token, "web", &listener, None).unwrap();
        assert!(registry.is_active(token));
    }

    #[test]
    fn test_same_socket_under_two_tokens_fails() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let first = registry.export("a", &listener).unwrap();
        let err = registry.export("b", &listener).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExported { token, .. } if token == first));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_independent_opens_of_one_file_both_export() {
        let registry = Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let first = File::create(&path).unwrap();
        let second = File::open(&path).unwrap();

        registry.export("a", &first).unwrap();
        registry.export("b", &second).unwrap();
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_export_rejects_bad_names() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            registry.export("a:b", &listener),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_export_survives_caller_close() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        registry.export("web", &listener).unwrap();
        drop(listener);

        registry.reset();
        let file = registry
            .file_with("web", &[predicate::bound_to_inet(addr)])
            .expect("socket still registered");
        let listener = TcpListener::from(file.fd);
        assert_eq!(listener.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_forget_by_name_releases_all() {
        let registry = Registry::new();
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        let c = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("web", &a).unwrap();
        registry.export("web", &b).unwrap();
        registry.export("admin", &c).unwrap();

        assert_eq!(registry.forget("web").unwrap(), 2);
        assert_eq!(registry.active_count(), 1);
        assert!(matches!(
            registry.forget("web"),
            Err(RegistryError::NotExported(name)) if name == "web"
        ));
    }

    #[test]
    fn test_reset_keeps_descriptor_open() {
        let registry = Registry::new();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"still here").unwrap();

        registry.export("state", &file).unwrap();
        drop(file);
        registry.reset();

        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.available_names(), vec!["state"]);

        let claimed = registry.file_with("state", &[]).unwrap();
        let mut file = File::from(claimed.fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "still here");
    }

    #[test]
    fn test_file_with_is_exactly_once() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("web", &listener).unwrap();
        registry.reset();

        let preds = [predicate::is_listening()];
        assert!(registry.file_with("web", &preds).is_some());
        assert!(registry.file_with("web", &preds).is_none());
    }

    #[test]
    fn test_file_with_respects_order_and_predicates() {
        let registry = Registry::new();
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("first", &udp).unwrap();
        registry.export("second", &tcp).unwrap();
        registry.reset();

        let any = registry.file_with("", &[]).unwrap();
        assert_eq!(any.name, "first");

        registry.reset();
        assert!(registry.file_with("", &[predicate::is_listening()]).is_some());
    }

    #[test]
    fn test_cleanup_closes_only_unclaimed() {
        let registry = Registry::new();
        let listeners: Vec<TcpListener> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        for (i, l) in listeners.iter().enumerate() {
            registry.export(&format!("l{i}"), l).unwrap();
        }
        registry.reset();

        let claimed = registry.file_with("l1", &[]).unwrap();
        assert_eq!(registry.cleanup(), 2);
        assert_eq!(registry.available_count(), 0);

        let listener = TcpListener::from(claimed.fd);
        assert_eq!(
            listener.local_addr().unwrap(),
            listeners[1].local_addr().unwrap()
        );
    }

    #[test]
    fn test_reactivate_restores_handoff() {
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("web", &listener).unwrap();
        registry.reset();

        let tokens = registry.reactivate();
        assert_eq!(tokens.len(), 1);
        assert!(registry.is_active(tokens[0]));
        assert_eq!(registry.available_count(), 0);
    }

    #[test]
    fn test_handoff_files_include_locks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lock = File::create(dir.path().join("x.lock")).unwrap();

        let token = registry.mint_token();
        registry
            .export_as(token, "web", &listener, Some(lock))
            .unwrap();
        let other = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.export("admin", &other).unwrap();

        let files = registry.handoff_files().unwrap();
        let kinds: Vec<(&str, HandoffKind)> =
            files.iter().map(|f| (f.name.as_str(), f.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("web", HandoffKind::Socket),
                ("web", HandoffKind::Lock),
                ("admin", HandoffKind::Socket),
            ]
        );

        let summaries = registry.entries();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].locked);
        assert_eq!(summaries[0].disposition, Disposition::Active);
    }

    #[test]
    fn test_malformed_environment_is_recorded() {
        let registry = Registry::inherit_from(
            |key| match key {
                "LISTEN_FDS" => Some("nope".to_string()),
                _ => None,
            },
            1,
            LISTEN_FDS_START,
        );
        assert_eq!(registry.available_count(), 0);
        assert!(matches!(
            registry.inherit_error(),
            Some(EnvError::Invalid { var: "LISTEN_FDS", .. })
        ));
    }
}

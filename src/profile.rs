//! Profile files name the ordered list of database layers an engine
//! composes. One declaration per line, `kind:name` with kind one of
//! `user-db`, `system-db`, `service-db` or `file-db`; `#` starts a
//! comment. A bare name is shorthand: the first names a user database,
//! the rest name system databases.

use std::fs;
use std::path::{Path, PathBuf};

use sediment_core::Result;
use tracing::warn;

/// Where named profiles are looked up.
pub const PROFILE_DIR: &str = "/etc/sediment/profile";

/// Overrides the profile lookup; an absolute value names the file
/// directly, anything else is resolved under [`PROFILE_DIR`].
pub const PROFILE_ENV: &str = "SEDIMENT_PROFILE";

const MAX_LINE: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Writable per-user database under the config directory.
    User,
    /// Read-only database under `/etc`, maintained out of band.
    System,
    /// Writable ephemeral database under the runtime directory.
    Service,
    /// A table file opened from an explicit filename, read-only.
    File,
}

/// One layer declaration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceDesc {
    pub kind: SourceKind,
    pub name: String,
}

/// The ordered list of layers; index 0 is the only writable one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Profile {
    pub sources: Vec<SourceDesc>,
}

impl Profile {
    /// Parses profile text. Malformed lines are skipped with a
    /// diagnostic; an unreadable profile is therefore never fatal once
    /// its text has been obtained.
    pub fn parse(text: &str) -> Profile {
        let mut sources = Vec::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.len() > MAX_LINE {
                warn!("ignoring overlong line in profile");
                continue;
            }
            let desc = match line.split_once(':') {
                Some((kind, name)) => {
                    let kind = match kind {
                        "user-db" => SourceKind::User,
                        "system-db" => SourceKind::System,
                        "service-db" => SourceKind::Service,
                        "file-db" => SourceKind::File,
                        other => {
                            warn!("unknown database kind {:?} in profile", other);
                            continue;
                        }
                    };
                    SourceDesc {
                        kind,
                        name: name.to_owned(),
                    }
                }
                None => SourceDesc {
                    kind: if sources.is_empty() {
                        SourceKind::User
                    } else {
                        SourceKind::System
                    },
                    name: line.to_owned(),
                },
            };
            sources.push(desc);
        }
        Profile { sources }
    }

    /// Opens an explicitly requested profile. A missing file is an
    /// error here: the caller asked for this profile by name.
    pub fn open(path: &Path) -> Result<Profile> {
        Ok(Profile::parse(&fs::read_to_string(path)?))
    }

    /// Resolves the profile to use when none was requested explicitly:
    /// the environment override, then `/etc/sediment/profile/user`, then
    /// a single user database called "user".
    pub fn default_profile() -> Profile {
        if let Some(name) = std::env::var_os(PROFILE_ENV) {
            let path = if Path::new(&name).is_absolute() {
                PathBuf::from(&name)
            } else {
                Path::new(PROFILE_DIR).join(&name)
            };
            return match fs::read_to_string(&path) {
                Ok(text) => Profile::parse(&text),
                Err(e) => {
                    warn!(
                        "unable to open named profile {}: {}; using the null configuration",
                        path.display(),
                        e
                    );
                    Profile::default()
                }
            };
        }

        match fs::read_to_string(Path::new(PROFILE_DIR).join("user")) {
            Ok(text) => Profile::parse(&text),
            Err(_) => Profile {
                sources: vec![SourceDesc {
                    kind: SourceKind::User,
                    name: "user".to_owned(),
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_declarations() {
        let profile = Profile::parse(
            "# a comment\n\
             user-db:mine\n\
             \n\
             system-db:site\n\
             service-db:volatile\n\
             file-db:/var/lib/x/db\n",
        );
        let kinds: Vec<_> = profile.sources.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                SourceKind::User,
                SourceKind::System,
                SourceKind::Service,
                SourceKind::File
            ]
        );
        assert_eq!(profile.sources[3].name, "/var/lib/x/db");
    }

    #[test]
    fn bare_names_are_shorthand() {
        let profile = Profile::parse("user\nsite\nlocal\n");
        assert_eq!(profile.sources[0].kind, SourceKind::User);
        assert_eq!(profile.sources[0].name, "user");
        assert_eq!(profile.sources[1].kind, SourceKind::System);
        assert_eq!(profile.sources[2].kind, SourceKind::System);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let long = format!("user-db:{}", "x".repeat(90));
        let profile = Profile::parse(&format!("{}\nwhat-db:ever\nuser-db:ok\n", long));
        assert_eq!(profile.sources.len(), 1);
        assert_eq!(profile.sources[0].name, "ok");
    }

    #[test]
    fn explicit_open_fails_on_missing_file() {
        assert!(Profile::open(Path::new("/nonexistent/profile")).is_err());
    }
}

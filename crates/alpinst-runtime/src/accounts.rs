//! User accounts inside the target.
//!
//! `root` is always locked; administrators get sudo through membership in
//! `wheel`. Password hashes are written straight into `/etc/shadow` so no
//! plaintext ever reaches the target.

use crate::command::{CommandRunner, Invocation, Session};
use crate::staging::StagingRoot;
use crate::RuntimeError;
use alpinst_schema::UserAccount;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

pub const SHADOW: &str = "/etc/shadow";
pub const SUDOERS_DROPIN: &str = "/etc/sudoers.d/00-wheel";
const SUDOERS_WHEEL: &str = "%wheel ALL=(ALL) ALL\n";
const LOCKED: &str = "!";
const ADMIN_GROUP: &str = "wheel";

/// Names that can never be created: system accounts of a base install.
pub const RESERVED_NAMES: &[&str] = &[
    "root", "bin", "daemon", "adm", "lp", "sync", "shutdown", "halt", "mail", "news", "uucp",
    "operator", "man", "postmaster", "cron", "ftp", "sshd", "at", "squid", "xfs", "games",
    "cyrus", "vpopmail", "ntp", "smmsp", "guest", "nobody", "wheel",
];

/// Days since the Unix epoch, as used by the shadow "last change" field.
pub fn days_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() / 86_400)
}

/// Replace a user's hash and last-change date in shadow file content.
pub fn update_shadow(
    content: &str,
    user: &str,
    hash: &str,
    days: u64,
) -> Result<String, RuntimeError> {
    let mut found = false;
    let mut out = String::with_capacity(content.len() + hash.len());
    for line in content.lines() {
        let mut fields: Vec<&str> = line.split(':').collect();
        let days_str;
        if fields.first() == Some(&user) && fields.len() >= 3 {
            fields[1] = hash;
            days_str = days.to_string();
            fields[2] = &days_str;
            found = true;
        }
        out.push_str(&fields.join(":"));
        out.push('\n');
    }
    if !found {
        return Err(RuntimeError::UnexpectedOutput {
            program: "shadow".to_owned(),
            detail: format!("no entry for user '{user}'"),
        });
    }
    Ok(out)
}

fn set_hash(staging: &StagingRoot, user: &str, hash: &str) -> Result<(), RuntimeError> {
    let content = staging.read_file(SHADOW)?;
    let updated = update_shadow(&content, user, hash, days_since_epoch())?;
    staging.write_file(SHADOW, &updated, 0o640)
}

pub fn adduser_invocation(staging: &StagingRoot, account: &UserAccount) -> Invocation {
    let mut inv = Invocation::chroot(staging.path(), "adduser").arg("-D");
    if let Some(gecos) = &account.gecos {
        inv = inv.arg("-g").arg(gecos);
    }
    inv.args(["-s", "/bin/sh"]).arg(&account.name)
}

pub fn create_accounts(
    session: &Session<'_>,
    staging: &StagingRoot,
    users: &[UserAccount],
) -> Result<(), RuntimeError> {
    staging.write_file(SUDOERS_DROPIN, SUDOERS_WHEEL, 0o440)?;
    set_hash(staging, "root", LOCKED)?;

    for account in users {
        info!("creating user {}", account.name);
        session.run(&adduser_invocation(staging, account))?;
        set_hash(staging, &account.name, &account.password)?;
        if account.admin {
            session.run(
                &Invocation::chroot(staging.path(), "addgroup")
                    .arg(&account.name)
                    .arg(ADMIN_GROUP),
            )?;
        }
    }
    Ok(())
}

/// SHA-512 crypt hash of a plaintext password, via `openssl passwd`.
pub fn hash_password(runner: &dyn CommandRunner, plaintext: &str) -> Result<String, RuntimeError> {
    let out = runner.run(
        &Invocation::new("openssl")
            .args(["passwd", "-6", "-stdin"])
            .stdin(format!("{plaintext}\n")),
        Duration::from_secs(10),
    )?;
    let hash = out.stdout.trim();
    if !hash.starts_with("$6$") {
        return Err(RuntimeError::UnexpectedOutput {
            program: "openssl".to_owned(),
            detail: "not a SHA-512 crypt hash".to_owned(),
        });
    }
    Ok(hash.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HostRunner;
    use crate::mock::RecordingRunner;

    const SHADOW_FILE: &str = "root:*:19000:0:::::\nbin:!::0:::::\nalice:!:19000:0:99999:7:::\n";

    fn account(name: &str, admin: bool) -> UserAccount {
        UserAccount {
            name: name.to_owned(),
            password: "$6$salt$hash".to_owned(),
            gecos: Some("Test User".to_owned()),
            admin,
        }
    }

    #[test]
    fn updates_only_named_user() {
        let out = update_shadow(SHADOW_FILE, "alice", "$6$x$y", 20000).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "root:*:19000:0:::::");
        assert_eq!(lines[2], "alice:$6$x$y:20000:0:99999:7:::");
    }

    #[test]
    fn locks_root() {
        let out = update_shadow(SHADOW_FILE, "root", "!", 20000).unwrap();
        assert!(out.starts_with("root:!:20000:"));
    }

    #[test]
    fn missing_user_is_error() {
        assert!(update_shadow(SHADOW_FILE, "bob", "!", 1).is_err());
    }

    #[test]
    fn adduser_arguments() {
        let staging = StagingRoot::new("/mnt/t");
        assert_eq!(
            adduser_invocation(&staging, &account("alice", false)).display(),
            "chroot /mnt/t adduser -D -g Test User -s /bin/sh alice"
        );
    }

    #[test]
    fn creates_accounts_and_admin_membership() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingRoot::new(dir.path());
        staging.write_file(SHADOW, "root:*:0:0:::::\n", 0o640).unwrap();
        let runner = RecordingRunner::new();
        let session = Session::new(&runner, Duration::from_secs(60));

        create_accounts(&session, &staging, &[account("alice", true)]).unwrap();

        let shadow = staging.read_file(SHADOW).unwrap();
        assert!(shadow.starts_with("root:!:"));
        assert!(shadow.contains("alice:$6$salt$hash:"));
        assert_eq!(staging.read_file(SUDOERS_DROPIN).unwrap(), "%wheel ALL=(ALL) ALL\n");
        let programs = runner.programs();
        assert_eq!(programs, ["adduser", "addgroup"]);
    }

    #[test]
    fn hashes_with_openssl_when_available() {
        if std::process::Command::new("openssl").arg("version").output().is_err() {
            return;
        }
        let hash = hash_password(&HostRunner, "secret").unwrap();
        assert!(hash.starts_with("$6$"));
        assert!(!hash.contains(':'));
    }
}

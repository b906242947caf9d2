//! Accept-time trust decisions from peer credentials.

use nix::unistd::{Gid, Group, Uid, User};
use syrinx_protocol::TrustLevel;
use tokio::net::unix::UCred;

use crate::config::Config;

/// What the kernel told us about the peer, resolved to names.
struct PeerIdentity {
    user: String,
    group: String,
}

fn resolve_peer(peer: &UCred) -> PeerIdentity {
    let user = User::from_uid(Uid::from_raw(peer.uid()))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| peer.uid().to_string());
    let group = Group::from_gid(Gid::from_raw(peer.gid()))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| peer.gid().to_string());
    PeerIdentity { user, group }
}

/// Whether `user` (with primary group `group`) matches one of `patterns`:
/// a literal name, `@groupname`, or the `*` wildcard.
fn match_user(user: &str, group: &str, patterns: &[String]) -> bool {
    if patterns.iter().any(|p| p == "*") {
        return true;
    }
    if patterns.iter().any(|p| p == user) {
        return true;
    }
    for pattern in patterns {
        if let Some(group_name) = pattern.strip_prefix('@') {
            if group == group_name {
                return true;
            }
            if let Ok(Some(gr)) = Group::from_name(group_name) {
                if gr.mem.iter().any(|member| member == user) {
                    return true;
                }
            }
        }
    }
    false
}

/// Decide the trust level for a connecting peer, or reject it.
pub fn decide_trust(config: &Config, peer: &UCred) -> Result<TrustLevel, String> {
    let identity = resolve_peer(peer);

    let trusted = match_user(&identity.user, &identity.group, &config.trusted_users);

    let in_build_group = config
        .build_users_group
        .as_deref()
        .is_some_and(|g| identity.group == g);

    if (!trusted && !match_user(&identity.user, &identity.group, &config.allowed_users))
        || in_build_group
    {
        return Err(format!(
            "user '{}' is not allowed to connect to the daemon",
            identity.user
        ));
    }

    Ok(if trusted {
        TrustLevel::Trusted
    } else {
        TrustLevel::NotTrusted
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_anyone() {
        assert!(match_user("alice", "users", &["*".to_owned()]));
    }

    #[test]
    fn literal_name_matches() {
        let patterns = vec!["alice".to_owned(), "bob".to_owned()];
        assert!(match_user("alice", "users", &patterns));
        assert!(!match_user("mallory", "users", &patterns));
    }

    #[test]
    fn primary_group_reference_matches() {
        let patterns = vec!["@users".to_owned()];
        assert!(match_user("alice", "users", &patterns));
        assert!(!match_user("alice", "nogroup", &patterns));
    }

    #[test]
    fn empty_patterns_match_nobody() {
        assert!(!match_user("alice", "users", &[]));
    }
}

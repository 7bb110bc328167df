//! Bus subject construction and pattern matching.
//!
//! Control-plane traffic uses the `$LL.` namespace; RPC traffic uses
//! `$SRV.<service>.<method>`. Patterns support a single tail wildcard
//! (`>`) that matches one or more trailing tokens, mirroring the
//! substrate's semantics.

/// Prefix for register messages.
pub const REGISTER_PREFIX: &str = "$LL.register";

/// Prefix for heartbeat beacons.
pub const HEARTBEAT_PREFIX: &str = "$LL.heartbeat";

/// Prefix for control commands.
pub const CONTROL_PREFIX: &str = "$LL.control";

/// Prefix for RPC requests.
pub const RPC_PREFIX: &str = "$SRV";

/// Subject a service publishes its register message on.
pub fn register_subject(service: &str) -> String {
    format!("{REGISTER_PREFIX}.{service}")
}

/// Subject a service publishes heartbeats on.
pub fn heartbeat_subject(service: &str) -> String {
    format!("{HEARTBEAT_PREFIX}.{service}")
}

/// Subject the manager publishes control commands on.
pub fn control_subject(service: &str) -> String {
    format!("{CONTROL_PREFIX}.{service}")
}

/// Pattern an instance subscribes to for control commands.
pub fn control_wildcard(service: &str) -> String {
    format!("{CONTROL_PREFIX}.{service}.>")
}

/// Subject for an RPC request to a specific method.
pub fn rpc_subject(service: &str, method: &str) -> String {
    format!("{RPC_PREFIX}.{service}.{method}")
}

/// Pattern a service subscribes to for all of its RPC methods.
pub fn rpc_wildcard(service: &str) -> String {
    format!("{RPC_PREFIX}.{service}.>")
}

/// Extract the final token of a subject (e.g. the method name of an RPC
/// subject, or the service name of a register subject).
pub fn last_token(subject: &str) -> &str {
    subject.rsplit('.').next().unwrap_or(subject)
}

/// Check whether `subject` matches `pattern`.
///
/// Tokens are compared literally except for a trailing `>`, which matches
/// one or more remaining tokens. `>` anywhere but the tail never matches.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_builders() {
        assert_eq!(register_subject("math"), "$LL.register.math");
        assert_eq!(heartbeat_subject("math"), "$LL.heartbeat.math");
        assert_eq!(control_subject("math"), "$LL.control.math");
        assert_eq!(control_wildcard("math"), "$LL.control.math.>");
        assert_eq!(rpc_subject("math", "add"), "$SRV.math.add");
        assert_eq!(rpc_wildcard("math"), "$SRV.math.>");
    }

    #[test]
    fn exact_match() {
        assert!(subject_matches("$LL.register.math", "$LL.register.math"));
        assert!(!subject_matches("$LL.register.math", "$LL.register.text"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_tokens() {
        assert!(subject_matches("$LL.heartbeat.>", "$LL.heartbeat.math"));
        assert!(subject_matches("$SRV.math.>", "$SRV.math.backup.create"));
        // `>` requires at least one token
        assert!(!subject_matches("$LL.heartbeat.>", "$LL.heartbeat"));
    }

    #[test]
    fn wildcard_must_be_tail() {
        assert!(!subject_matches("$LL.>.math", "$LL.register.math"));
    }

    #[test]
    fn length_mismatch_without_wildcard() {
        assert!(!subject_matches("$SRV.math.add", "$SRV.math.add.extra"));
        assert!(!subject_matches("$SRV.math.add.extra", "$SRV.math.add"));
    }

    #[test]
    fn last_token_extraction() {
        assert_eq!(last_token("$SRV.math.add"), "add");
        assert_eq!(last_token("$LL.register.math"), "math");
        assert_eq!(last_token("plain"), "plain");
    }
}

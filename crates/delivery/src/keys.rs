//! Redis key layout for the delivery subsystem.
//!
//! Composite members in the global expiry index use `user|device|job` — device
//! ids registered by clients never contain `|`, and job ids are opaque to the
//! split because they take the remainder of the member.

use uuid::Uuid;

pub const PENDING_INDEX: &str = "pending:index";

pub fn presence(user: &Uuid) -> String {
    format!("presence:{user}")
}

pub fn job(job_id: &str) -> String {
    format!("job:{job_id}")
}

pub fn dedup(job_id: &str, target: &str) -> String {
    format!("dedup:{job_id}:{target}")
}

pub fn pending(user: &Uuid, device: &str) -> String {
    format!("pending:{user}:{device}")
}

pub fn waiting(job_id: &str) -> String {
    format!("pending:waiting:{job_id}")
}

pub fn attempts(user: &Uuid, device: &str, job_id: &str) -> String {
    format!("attempts:{user}:{device}:{job_id}")
}

pub fn mute(user: &Uuid) -> String {
    format!("mute:{user}")
}

pub fn queue_delayed(namespace: &str) -> String {
    format!("queue:{namespace}:delayed")
}

pub fn queue_ready(namespace: &str) -> String {
    format!("queue:{namespace}:ready")
}

pub fn lock(name: &str) -> String {
    format!("lock:{name}")
}

pub fn index_member(user: &Uuid, device: &str, job_id: &str) -> String {
    format!("{user}|{device}|{job_id}")
}

/// Member form used in a job's waiting set.
pub fn device_member(user: &Uuid, device: &str) -> String {
    format!("{user}|{device}")
}

pub fn parse_index_member(member: &str) -> Option<(Uuid, String, String)> {
    let mut parts = member.splitn(3, '|');
    let user = parts.next()?.parse().ok()?;
    let device = parts.next()?.to_string();
    let job_id = parts.next()?.to_string();
    Some((user, device, job_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_member_roundtrip() {
        let user = Uuid::new_v4();
        let member = index_member(&user, "device-1", "job:with:colons");
        let (u, d, j) = parse_index_member(&member).unwrap();
        assert_eq!(u, user);
        assert_eq!(d, "device-1");
        assert_eq!(j, "job:with:colons");
    }

    #[test]
    fn test_parse_index_member_rejects_garbage() {
        assert!(parse_index_member("not-a-uuid|d|j").is_none());
        assert!(parse_index_member("").is_none());
    }
}

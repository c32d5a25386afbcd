/// Identifier factory - counters, tags, branch IDs, Call-IDs, URN UUIDs
/// Reference: RFC 3261 8.1.1.7 (branch magic cookie), 19.3 (tags)

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use digest::Digest;
use md5::Md5;
use rand::Rng;
use sha2::Sha256;
use uuid::Uuid;

/// Monotonic per-category counter. Returns the current value and advances.
#[derive(Debug)]
pub struct Counter(AtomicU32);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client identifier state. The registration tag and the URN UUID are
/// allocated once at construction and stay stable for the client's lifetime.
#[derive(Debug)]
pub struct IdentityFactory {
    local_ip: String,
    local_port: u16,
    tags: Mutex<HashSet<String>>,
    register_tag: String,
    urn_uuid: String,

    pub invite_cseq: Counter,
    pub register_cseq: Counter,
    pub subscribe_cseq: Counter,
    pub bye_cseq: Counter,
    call_id_seed: Counter,
    session_id_seed: Counter,
}

impl IdentityFactory {
    pub fn new(local_ip: &str, local_port: u16) -> Self {
        let tags = Mutex::new(HashSet::new());
        let register_tag = fresh_tag(&tags);
        Self {
            local_ip: local_ip.to_string(),
            local_port,
            tags,
            register_tag,
            urn_uuid: Uuid::new_v4().to_string().to_uppercase(),
            invite_cseq: Counter::new(),
            register_cseq: Counter::new(),
            subscribe_cseq: Counter::new(),
            bye_cseq: Counter::new(),
            call_id_seed: Counter::new(),
            session_id_seed: Counter::new(),
        }
    }

    /// Branch parameter: the RFC 3261 magic cookie plus 25 random hex chars.
    pub fn branch(&self) -> String {
        let random: u128 = rand::thread_rng().gen();
        let hex = format!("{:032x}", random);
        format!("z9hG4bK{}", &hex[..25])
    }

    /// Session-unique tag: first 8 hex chars of MD5 over a random u32.
    pub fn tag(&self) -> String {
        fresh_tag(&self.tags)
    }

    /// The tag used in From for every REGISTER of this client.
    pub fn register_tag(&self) -> &str {
        &self.register_tag
    }

    /// Call-ID: first 32 hex chars of SHA-256 over a counter, at the
    /// local address.
    pub fn call_id(&self) -> String {
        let seed = self.call_id_seed.next();
        let digest = Sha256::digest(seed.to_string().as_bytes());
        format!(
            "{}@{}:{}",
            &hex_encode(&digest)[..32],
            self.local_ip,
            self.local_port
        )
    }

    pub fn session_id(&self) -> u32 {
        self.session_id_seed.next()
    }

    /// Uppercase random UUID, allocated once and reused as +sip.instance
    /// across all registrations.
    pub fn urn_uuid(&self) -> &str {
        &self.urn_uuid
    }
}

fn fresh_tag(tags: &Mutex<HashSet<String>>) -> String {
    let mut tags = tags.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        let random: u32 = rand::thread_rng().gen();
        let tag = hex_encode(&Md5::digest(random.to_string().as_bytes()))[..8].to_string();
        if tags.insert(tag.clone()) {
            return tag;
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_one() {
        let c = Counter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.current(), 3);
    }

    #[test]
    fn test_branch_has_magic_cookie_and_length() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        for _ in 0..10 {
            let branch = factory.branch();
            assert!(branch.starts_with("z9hG4bK"));
            assert_eq!(branch.len(), 7 + 25);
            assert!(branch[7..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_branches_unique() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        assert_ne!(factory.branch(), factory.branch());
    }

    #[test]
    fn test_tag_format_and_uniqueness() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let tag = factory.tag();
            assert_eq!(tag.len(), 8);
            assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(tag), "tag collided");
        }
    }

    #[test]
    fn test_register_tag_stable() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        let first = factory.register_tag().to_string();
        let _ = factory.tag();
        let _ = factory.tag();
        assert_eq!(factory.register_tag(), first);
    }

    #[test]
    fn test_call_id_format() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        let call_id = factory.call_id();
        assert!(call_id.ends_with("@192.0.2.1:5060"));
        let hash = call_id.split('@').next().unwrap();
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_call_ids_unique() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        assert_ne!(factory.call_id(), factory.call_id());
    }

    #[test]
    fn test_urn_uuid_uppercase_and_stable() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        let urn = factory.urn_uuid().to_string();
        assert_eq!(urn, urn.to_uppercase());
        assert_eq!(urn.len(), 36);
        assert_eq!(factory.urn_uuid(), urn);
    }

    #[test]
    fn test_session_ids_advance() {
        let factory = IdentityFactory::new("192.0.2.1", 5060);
        let a = factory.session_id();
        let b = factory.session_id();
        assert_eq!(b, a + 1);
    }
}

use std::collections::HashMap;

/// The replicated application. `apply` must be deterministic: every replica
/// feeds it the same entries in the same order and must produce the same
/// results.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &[u8]) -> Vec<u8>;
}

/// In-memory key/value store speaking UTF-8 commands:
/// `SET <key> <value>`, `GET <key>`, `DEL <key>`.
#[derive(Default)]
pub struct KvStore {
    map: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, entry: &[u8]) -> Vec<u8> {
        let Ok(text) = std::str::from_utf8(entry) else {
            return b"ERR not utf-8".to_vec();
        };
        let mut parts = text.splitn(3, ' ');
        let reply = match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                self.map.insert(key.to_string(), value.to_string());
                "OK".to_string()
            }
            (Some("GET"), Some(key), None) => match self.map.get(key) {
                Some(value) => value.clone(),
                None => "NOT_FOUND".to_string(),
            },
            (Some("DEL"), Some(key), None) => match self.map.remove(key) {
                Some(_) => "OK".to_string(),
                None => "NOT_FOUND".to_string(),
            },
            _ => format!("ERR bad command: {text}"),
        };
        reply.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(b"SET lang rust"), b"OK");
        assert_eq!(kv.apply(b"GET lang"), b"rust");
        assert_eq!(kv.apply(b"DEL lang"), b"OK");
        assert_eq!(kv.apply(b"GET lang"), b"NOT_FOUND");
        assert_eq!(kv.apply(b"DEL lang"), b"NOT_FOUND");
    }

    #[test]
    fn values_may_contain_spaces() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(b"SET greeting hello there"), b"OK");
        assert_eq!(kv.apply(b"GET greeting"), b"hello there");
    }

    #[test]
    fn bad_commands_report_errors() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(b"NOPE"), b"ERR bad command: NOPE");
        assert_eq!(kv.apply(&[0xff, 0xfe]), b"ERR not utf-8");
    }
}

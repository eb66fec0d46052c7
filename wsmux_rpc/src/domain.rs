use {
    crate::new_type,
    chrono::Utc,
    once_cell::sync::Lazy,
    regex::Regex,
    std::sync::Arc,
};

/// Number of unix-millisecond bytes at the front of a generated
/// [`ClientId`]. Keeps generated ids lexicographically time-ordered.
const CLIENT_ID_TIME_BYTES: usize = 6;

/// Number of random bytes following the timestamp prefix.
const CLIENT_ID_RAND_BYTES: usize = 10;

/// Default maximum topic length in characters.
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 128;

static DEFAULT_TOPIC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9:_./-]{1,128}$").expect("invalid default topic pattern"));

new_type!(
    #[doc = "Represents the client ID type."]
    #[as_ref(forward)]
    #[from(forward)]
    ClientId: Arc<str>
);

impl ClientId {
    /// Generates a new server-owned client id: 48 bits of unix-millis
    /// followed by 80 random bits, hex-encoded. Ids sort by creation
    /// time and are never accepted from clients.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;

        let mut data = [0u8; CLIENT_ID_TIME_BYTES + CLIENT_ID_RAND_BYTES];
        data[..CLIENT_ID_TIME_BYTES]
            .copy_from_slice(&millis.to_be_bytes()[8 - CLIENT_ID_TIME_BYTES..]);
        rand::Rng::fill(&mut rand::thread_rng(), &mut data[CLIENT_ID_TIME_BYTES..]);

        Self(data_encoding::HEXLOWER.encode(&data).into())
    }
}

new_type!(
    #[doc = "Represents the topic type."]
    #[as_ref(forward)]
    #[from(forward)]
    Topic: Arc<str>
);

new_type!(
    #[doc = "Represents the correlation ID type."]
    #[as_ref(forward)]
    #[from(forward)]
    CorrelationId: Arc<str>
);

new_type!(
    #[doc = "Represents the message type discriminant."]
    #[as_ref(forward)]
    #[from(forward)]
    MessageType: Arc<str>
);

/// Errors covering topic validation problems.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TopicViolation {
    #[error("Topic is too long ({actual} > {limit})")]
    TooLong { actual: usize, limit: usize },

    #[error("Topic does not match the allowed pattern")]
    Pattern,
}

/// Validation policy applied to every topic before it reaches an
/// adapter: a length cap plus a character pattern.
#[derive(Debug, Clone)]
pub struct TopicPolicy {
    max_length: usize,
    pattern: Regex,
}

impl TopicPolicy {
    pub fn new(max_length: usize, pattern: Regex) -> Self {
        Self {
            max_length,
            pattern,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Validates a topic against the policy. Length is checked before
    /// the pattern so oversized topics report the length violation.
    pub fn validate(&self, topic: &Topic) -> Result<(), TopicViolation> {
        let len = topic.as_ref().chars().count();

        if len > self.max_length {
            return Err(TopicViolation::TooLong {
                actual: len,
                limit: self.max_length,
            });
        }

        if !self.pattern.is_match(topic.as_ref()) {
            return Err(TopicViolation::Pattern);
        }

        Ok(())
    }
}

impl Default for TopicPolicy {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_TOPIC_LENGTH,
            pattern: DEFAULT_TOPIC_PATTERN.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_id_format() {
        let id = ClientId::generate();

        assert_eq!(id.as_ref().len(), (CLIENT_ID_TIME_BYTES + CLIENT_ID_RAND_BYTES) * 2);
        assert!(id.as_ref().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn client_id_time_prefix() {
        let before = Utc::now().timestamp_millis() as u64;
        let id = ClientId::generate();
        let after = Utc::now().timestamp_millis() as u64;

        let decoded = data_encoding::HEXLOWER
            .decode(id.as_ref().as_bytes())
            .unwrap();

        let mut millis_bytes = [0u8; 8];
        millis_bytes[8 - CLIENT_ID_TIME_BYTES..].copy_from_slice(&decoded[..CLIENT_ID_TIME_BYTES]);
        let millis = u64::from_be_bytes(millis_bytes);

        assert!(millis >= before && millis <= after);
    }

    #[test]
    fn topic_length_boundary() {
        let policy = TopicPolicy::default();

        let exact: Topic = "a".repeat(DEFAULT_MAX_TOPIC_LENGTH).into();
        assert_eq!(policy.validate(&exact), Ok(()));

        let over: Topic = "a".repeat(DEFAULT_MAX_TOPIC_LENGTH + 1).into();
        assert_eq!(
            policy.validate(&over),
            Err(TopicViolation::TooLong {
                actual: DEFAULT_MAX_TOPIC_LENGTH + 1,
                limit: DEFAULT_MAX_TOPIC_LENGTH,
            })
        );
    }

    #[test]
    fn topic_pattern() {
        let policy = TopicPolicy::default();

        assert_eq!(policy.validate(&"room:1/chat.events-x_y".into()), Ok(()));
        assert_eq!(
            policy.validate(&"room 1".into()),
            Err(TopicViolation::Pattern)
        );
        assert_eq!(policy.validate(&"".into()), Err(TopicViolation::Pattern));
    }
}

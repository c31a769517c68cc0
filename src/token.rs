//! Claim tokens
//!
//! A token is a capability string, not a credential: hardware tag plus a
//! millisecond timestamp. Timestamps are forced strictly increasing so no two
//! tokens issued by one generator collide; an anchored generator also stays
//! clear of tokens from earlier runs.

use chrono::Utc;
use std::time::Instant;

const TAG_LEN: usize = 6;

/// Opaque token the owner sends back as `/start <token>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues tokens for one device lifetime
#[derive(Debug)]
pub struct TokenGenerator {
    tag: String,
    epoch: Instant,
    base_ms: u64,
    last_ms: Option<u64>,
}

impl TokenGenerator {
    /// Timestamps count from `epoch`
    pub fn new(hardware_id: &str, epoch: Instant) -> Self {
        Self {
            tag: hardware_tag(hardware_id),
            epoch,
            base_ms: 0,
            last_ms: None,
        }
    }

    /// Timestamps count from the Unix epoch, with `epoch` pinned to now
    pub fn anchored(hardware_id: &str, epoch: Instant) -> Self {
        let mut tokens = Self::new(hardware_id, epoch);
        tokens.base_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        tokens
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next token; never repeats an earlier one
    pub fn issue(&mut self, now: Instant) -> ClaimToken {
        let elapsed = self.base_ms + now.saturating_duration_since(self.epoch).as_millis() as u64;
        let ms = match self.last_ms {
            Some(last) if elapsed <= last => last + 1,
            _ => elapsed,
        };
        self.last_ms = Some(ms);
        ClaimToken(format!("{}{:X}", self.tag, ms))
    }
}

/// Fixed-width uppercase hex tag taken from the end of the hardware id
pub fn hardware_tag(hardware_id: &str) -> String {
    let digits: String = hardware_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_uppercase();

    let source = if digits.len() >= TAG_LEN {
        digits
    } else {
        hex::encode_upper(hardware_id.as_bytes())
    };

    let tail: String = source
        .chars()
        .skip(source.len().saturating_sub(TAG_LEN))
        .collect();
    format!("{:0>width$}", tail, width = TAG_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_hardware_tag_from_hex_id() {
        assert_eq!(hardware_tag("a1b2c3d4e5f6"), "D4E5F6");
        assert_eq!(hardware_tag("AA:BB:CC:DD:EE:FF"), "DDEEFF");
    }

    #[test]
    fn test_hardware_tag_from_non_hex_id() {
        // "xyz" -> 78797A
        assert_eq!(hardware_tag("xyz"), "78797A");
    }

    #[test]
    fn test_hardware_tag_pads_short_input() {
        assert_eq!(hardware_tag(""), "000000");
        assert_eq!(hardware_tag("z"), "00007A");
    }

    #[test]
    fn test_token_starts_with_tag() {
        let epoch = Instant::now();
        let mut tokens = TokenGenerator::new("a1b2c3d4e5f6", epoch);
        let token = tokens.issue(epoch + Duration::from_millis(0x1F4));
        assert_eq!(token.as_str(), "D4E5F61F4");
    }

    #[test]
    fn test_same_instant_still_unique() {
        let epoch = Instant::now();
        let mut tokens = TokenGenerator::new("a1b2c3d4e5f6", epoch);
        let a = tokens.issue(epoch);
        let b = tokens.issue(epoch);
        assert_ne!(a, b);
    }

    #[test]
    fn test_clock_before_epoch_is_clamped() {
        let now = Instant::now();
        let mut tokens = TokenGenerator::new("a1b2c3d4e5f6", now + Duration::from_secs(5));
        let token = tokens.issue(now);
        assert_eq!(token.as_str(), "D4E5F60");
    }

    #[test]
    fn test_anchored_generators_do_not_repeat() {
        let first = TokenGenerator::anchored("a1b2c3d4e5f6", Instant::now()).issue(Instant::now());
        std::thread::sleep(Duration::from_millis(5));
        let second = TokenGenerator::anchored("a1b2c3d4e5f6", Instant::now()).issue(Instant::now());
        assert_ne!(first, second);
        assert!(second.as_str().starts_with("D4E5F6"));
    }

    #[test]
    fn test_many_tokens_unique() {
        let epoch = Instant::now();
        let mut tokens = TokenGenerator::new("a1b2c3d4e5f6", epoch);
        let mut seen = HashSet::new();
        for i in 0..500u64 {
            // Time jumps around, including backwards
            let offset = Duration::from_millis((i * 7919) % 300);
            assert!(seen.insert(tokens.issue(epoch + offset)));
        }
    }
}

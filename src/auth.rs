//! Password record and failed-login throttling.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::crypto::{
    constant_time_eq, decode_b64, derive_key, encode_b64, random_bytes, DEFAULT_PBKDF2_ITERATIONS,
    SALT_LEN,
};
use crate::error::{Result, StoreError};
use crate::util::write_text_file;

pub const AUTH_FILE: &str = "auth.json";

/// Stored verifier for the master password: a PBKDF2 output and its salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub salt: String,
    pub hash: String,
    #[serde(default)]
    pub iterations: u32,
}

impl AuthRecord {
    pub fn create(password: &str, iterations: u32) -> Result<Self> {
        if password.is_empty() {
            return Err(StoreError::InvalidInput("Password is required.".to_string()));
        }
        let iterations = iterations.max(1);
        let salt = random_bytes::<SALT_LEN>();
        let hash = derive_key(password, &salt, iterations);
        Ok(Self {
            salt: encode_b64(&salt),
            hash: encode_b64(hash.as_slice()),
            iterations,
        })
    }

    /// Re-derives the hash for `password` and compares in constant time.
    pub fn verify(&self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }
        let (Ok(salt), Ok(expected)) = (decode_b64(&self.salt), decode_b64(&self.hash)) else {
            return false;
        };
        let candidate = derive_key(password, &salt, self.iterations.max(1));
        constant_time_eq(candidate.as_slice(), &expected)
    }
}

/// Reads `auth.json`. A missing, unreadable or incomplete record counts as
/// "not set up".
pub fn read_record(dir: &Path) -> Result<Option<AuthRecord>> {
    let path = dir.join(AUTH_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let Ok(mut record) = serde_json::from_str::<AuthRecord>(&raw) else {
        tracing::warn!("auth record is not valid json");
        return Ok(None);
    };
    if record.salt.is_empty() || record.hash.is_empty() {
        return Ok(None);
    }
    if record.iterations == 0 {
        record.iterations = DEFAULT_PBKDF2_ITERATIONS;
    }
    Ok(Some(record))
}

pub fn write_record(dir: &Path, record: &AuthRecord, atomic: bool) -> Result<()> {
    let content = serde_json::to_string_pretty(record)?;
    write_text_file(&dir.join(AUTH_FILE), &content, atomic)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub max_attempts: u32,
    #[serde(deserialize_with = "crate::config::secs")]
    pub window: Duration,
    #[serde(deserialize_with = "crate::config::secs")]
    pub lockout: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(5 * 60),
            lockout: Duration::from_secs(2 * 60),
        }
    }
}

/// Counts failed logins inside a sliding window and locks out for a while
/// once the limit is hit.
#[derive(Debug)]
pub struct LoginThrottle {
    policy: ThrottlePolicy,
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

impl LoginThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            failures: VecDeque::new(),
            locked_until: None,
        }
    }

    /// Errors with `LockedOut` while a lockout is running.
    pub fn check(&mut self, now: Instant) -> Result<()> {
        match self.locked_until {
            Some(until) if now < until => Err(StoreError::LockedOut {
                retry_after: until - now,
            }),
            Some(_) => {
                self.locked_until = None;
                self.failures.clear();
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.policy.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        if self.failures.len() >= self.policy.max_attempts.max(1) as usize {
            tracing::warn!(
                attempts = self.failures.len(),
                lockout_secs = self.policy.lockout.as_secs(),
                "too many failed logins, locking"
            );
            self.locked_until = Some(now + self.policy.lockout);
            self.failures.clear();
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.locked_until = None;
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.policy
            .max_attempts
            .saturating_sub(self.failures.len() as u32)
    }
}

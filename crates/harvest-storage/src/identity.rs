//! Client identity rotation.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Header set presented to a remote site for a stretch of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}

impl ClientIdentity {
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept_language: default_accept_language(),
            extra_headers: Vec::new(),
        }
    }
}

pub fn default_identities() -> Vec<ClientIdentity> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:130.0) Gecko/20100101 Firefox/130.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:129.0) Gecko/20100101 Firefox/129.0",
    ]
    .into_iter()
    .map(ClientIdentity::with_user_agent)
    .collect()
}

/// Hands out identities, switching to the next one every `rotate_every` requests regardless
/// of how those requests ended.
#[derive(Debug)]
pub struct IdentityRotator {
    pool: Vec<ClientIdentity>,
    rotate_every: usize,
    offset: usize,
    issued: AtomicUsize,
}

impl IdentityRotator {
    /// Starts at a random position in the pool.
    pub fn new(pool: Vec<ClientIdentity>, rotate_every: usize) -> Self {
        let pool = if pool.is_empty() { default_identities() } else { pool };
        let offset = rand::rng().random_range(0..pool.len());
        Self::starting_at(pool, rotate_every, offset)
    }

    pub fn starting_at(pool: Vec<ClientIdentity>, rotate_every: usize, offset: usize) -> Self {
        let pool = if pool.is_empty() { default_identities() } else { pool };
        let offset = offset % pool.len();
        Self {
            pool,
            rotate_every: rotate_every.max(1),
            offset,
            issued: AtomicUsize::new(0),
        }
    }

    pub fn next_identity(&self) -> ClientIdentity {
        let n = self.issued.fetch_add(1, Ordering::Relaxed);
        let index = (self.offset + n / self.rotate_every) % self.pool.len();
        self.pool[index].clone()
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{OffloadError, Result};
use crate::state::StateStore;

const SECRET_KEY: &str = "advmo_token_secret";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Start bulk runs.
    ManageOffload,
    /// Poll progress.
    ViewProgress,
}

/// Identity and credentials presented with a control request.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user: String,
    pub capabilities: Vec<Capability>,
    pub token: String,
}

impl Caller {
    pub fn can(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.can(cap) {
            Ok(())
        } else {
            Err(OffloadError::PermissionDenied)
        }
    }
}

/// Issues and verifies short-lived request tokens bound to an action and user.
///
/// A token covers one half-lifetime tick; the previous tick is still accepted,
/// so a token stays valid between half and the full lifetime.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: [u8; 32],
    lifetime_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: [u8; 32], lifetime_secs: u64) -> Self {
        Self {
            secret,
            lifetime_secs: lifetime_secs.max(2),
        }
    }

    /// Load the installation secret, creating it on first use.
    pub fn load_or_create(store: &dyn StateStore, lifetime_secs: u64) -> Result<Self> {
        for _ in 0..2 {
            if let Some(raw) = store.get(SECRET_KEY)? {
                let secret: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    OffloadError::Codec("token secret has the wrong length".into())
                })?;
                return Ok(Self::new(secret, lifetime_secs));
            }
            let mut secret = [0u8; 32];
            getrandom::getrandom(&mut secret)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            if store.compare_and_swap(SECRET_KEY, None, Some(&secret))? {
                return Ok(Self::new(secret, lifetime_secs));
            }
        }
        Err(OffloadError::Codec("token secret could not be established".into()))
    }

    fn tick(&self, now: OffsetDateTime) -> i64 {
        now.unix_timestamp()
            .div_euclid((self.lifetime_secs / 2) as i64)
    }

    fn digest(&self, tick: i64, action: &str, user: &str) -> blake3::Hash {
        let mut h = blake3::Hasher::new_keyed(&self.secret);
        h.update(&tick.to_le_bytes());
        h.update(&(action.len() as u64).to_le_bytes());
        h.update(action.as_bytes());
        h.update(user.as_bytes());
        h.finalize()
    }

    pub fn issue(&self, action: &str, user: &str, now: OffsetDateTime) -> String {
        self.digest(self.tick(now), action, user).to_hex().to_string()
    }

    pub fn verify(&self, token: &str, action: &str, user: &str, now: OffsetDateTime) -> bool {
        let Ok(presented) = blake3::Hash::from_hex(token.trim()) else {
            return false;
        };
        let tick = self.tick(now);
        // blake3::Hash equality is constant-time
        [tick, tick - 1]
            .into_iter()
            .any(|t| self.digest(t, action, user) == presented)
    }

    pub fn check(&self, caller: &Caller, action: &str, now: OffsetDateTime) -> Result<()> {
        if self.verify(&caller.token, action, &caller.user, now) {
            Ok(())
        } else {
            Err(OffloadError::InvalidToken)
        }
    }
}

/// Random hex identifier for run ownership.
pub fn random_id() -> Result<String> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf).map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(hex::encode(buf))
}

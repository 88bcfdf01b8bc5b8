//! Shared-secret authentication.
//!
//! The gate holds the deployment's single token.  When `auth.required` is
//! off every `auth` attempt succeeds and connections start authenticated.

use std::time::Duration;

use uuid::Uuid;

/// Delay between a failed `auth` reply and closing the socket, so the client
/// can read the `auth_response` first.
pub const AUTH_FAILURE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AuthGate {
    required: bool,
    token: String,
}

impl AuthGate {
    /// Builds the gate.  Returns the gate and, when the token had to be
    /// generated, a copy of it so the caller can log it.
    pub fn new(required: bool, token: Option<String>) -> (Self, Option<String>) {
        match token {
            Some(token) => (Self { required, token }, None),
            None if required => {
                let token = generate_token();
                (
                    Self {
                        required,
                        token: token.clone(),
                    },
                    Some(token),
                )
            }
            None => (
                Self {
                    required,
                    token: String::new(),
                },
                None,
            ),
        }
    }

    pub fn required(&self) -> bool {
        self.required
    }

    /// Checks a presented token.  Always `true` when auth is not required.
    pub fn verify(&self, provided: &str) -> bool {
        !self.required || tokens_match(&self.token, provided)
    }
}

/// A 256-bit random token as 64 lowercase hex characters.
///
/// Two v4 UUIDs drawn from the OS RNG, hyphens stripped.
pub fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Compares two tokens in time independent of where they first differ.
///
/// The length difference is folded into the result instead of returning
/// early, and every byte of the longer input is visited.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    let a = expected.as_bytes();
    let b = provided.as_bytes();
    let len = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u64;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= u64::from(x ^ y);
    }
    diff == 0
}

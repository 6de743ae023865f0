//! Shared-secret authentication
//!
//! A single secret carried in the `X-SECRET` header. No secret configured
//! means the hub is open; CORS preflight always passes regardless.

use agentry_core::{Error, Result};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedAuth {
    secret: Option<String>,
}

impl ResolvedAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn verify(&self, provided: Option<&str>) -> Result<()> {
        let Some(expected) = self.secret.as_deref() else {
            return Ok(());
        };
        let provided = provided.ok_or_else(|| Error::auth_failed("X-SECRET header required"))?;
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(Error::auth_failed("invalid secret"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_required_when_configured() {
        let auth = ResolvedAuth::new(Some("s3cret".into()));
        assert!(auth.verify(Some("s3cret")).is_ok());
        assert!(auth.verify(Some("wrong")).is_err());
        assert!(auth.verify(None).is_err());
    }

    #[test]
    fn open_when_no_secret() {
        let auth = ResolvedAuth::new(None);
        assert!(auth.verify(None).is_ok());
        assert!(auth.verify(Some("anything")).is_ok());
    }
}

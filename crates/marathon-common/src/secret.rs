use std::fmt::{Debug, Formatter};

use zeroize::ZeroizeOnDrop;

/// An in-memory secret (API key, access token, shared heartbeat key). The
/// backing storage is zeroed when the value is dropped and never appears in
/// `Debug` output.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Secret {
    value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret::new(value)
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(len={})", self.value.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_the_value() {
        let secret = Secret::new("sk-ant-do-not-log");
        let debug = format!("{secret:?}");

        assert!(!debug.contains("sk-ant"));
        assert_eq!(debug, "Secret(len=17)");
    }

    #[test]
    fn expose_returns_the_value() {
        let secret = Secret::new("ghp_token");
        assert_eq!(secret.expose(), "ghp_token");
        assert!(!secret.is_empty());
        assert!(Secret::new("").is_empty());
    }
}

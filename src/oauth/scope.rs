/// OAuth scopes as a bitmap over a fixed vocabulary
use crate::error::{IdpError, IdpResult};
use crate::identity::Provider;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit `i` grants `SCOPES[i]`; new names are only ever appended
pub const SCOPES: [&str; 4] = ["identify", "discord", "github", "google"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(u64);

impl ScopeSet {
    /// Bits beyond the vocabulary are dropped
    pub fn from_bits(bits: u64) -> Self {
        let known = (1u64 << SCOPES.len()) - 1;
        Self(bits & known)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Encode scope names; an unknown name is rejected
    pub fn from_names<I, S>(names: I) -> IdpResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bits = 0u64;
        for name in names {
            let name = name.as_ref();
            let index = SCOPES
                .iter()
                .position(|scope| *scope == name)
                .ok_or_else(|| IdpError::Validation(format!("Unknown scope: {}", name)))?;
            bits |= 1 << index;
        }
        Ok(Self(bits))
    }

    /// Decimal wire form, as sent in `scope` parameters and claims
    pub fn parse(raw: &str) -> IdpResult<Self> {
        raw.trim()
            .parse::<u64>()
            .map(Self::from_bits)
            .map_err(|_| IdpError::Validation("Scope must be a decimal bitmap".to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        SCOPES
            .iter()
            .enumerate()
            .filter(|(index, _)| self.0 & (1 << index) != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        SCOPES
            .iter()
            .position(|scope| *scope == name)
            .map(|index| self.0 & (1 << index) != 0)
            .unwrap_or(false)
    }

    /// Whether identities from `provider` may be disclosed
    pub fn grants_provider(&self, provider: Provider) -> bool {
        match provider {
            Provider::Password => false,
            other => self.contains(other.as_str()),
        }
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

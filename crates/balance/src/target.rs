//! Backend target model.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

fn default_weight() -> u32 {
    1
}

/// A backend proxy endpoint, identified by the loopback port it listens on.
///
/// Two targets are equal iff their `id`s are equal; `weight` is fixed at
/// registration and only consulted by the weighted strategies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Target {
    /// Loopback port of the backend; the transport identity.
    pub id: u16,

    /// Static scheduling weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Target {
    /// Create a target with the default weight of 1.
    pub fn new(id: u16) -> Self {
        Self { id, weight: 1 }
    }

    /// Create a target with an explicit weight.
    pub fn with_weight(id: u16, weight: u32) -> Self {
        Self { id, weight }
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_weight() {
        assert_eq!(Target::new(1081), Target::with_weight(1081, 9));
        assert_ne!(Target::new(1081), Target::new(1082));
    }

    #[test]
    fn test_weight_defaults_to_one() {
        let target: Target = serde_yaml::from_str("id: 1081").unwrap();
        assert_eq!(target.weight, 1);

        let target: Target = serde_yaml::from_str("id: 1081\nweight: 3").unwrap();
        assert_eq!(target.weight, 3);
    }
}

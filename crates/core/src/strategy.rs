use crate::error::{EngineError, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

const ROLLING_BUCKET_SPACE: u128 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    /// One shared index for everything under this strategy.
    Fixed,
    /// Bounded index count: knowledge bases hash into buckets of `rolling_step`.
    Rolling,
    /// One index per knowledge base, strongest isolation.
    #[default]
    PerDataset,
    /// One index shared by all of a user's knowledge bases.
    PerUser,
}

/// Deterministic policy mapping a knowledge base or user to a physical
/// index/collection name. Missing required fields fail validation rather
/// than defaulting silently.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexStrategy {
    pub mode: StrategyMode,
    pub prefix: Option<String>,
    pub fixed_name: Option<String>,
    pub rolling_step: Option<u32>,
}

impl IndexStrategy {
    pub fn per_dataset(prefix: impl Into<String>) -> Self {
        Self {
            mode: StrategyMode::PerDataset,
            prefix: Some(prefix.into()),
            fixed_name: None,
            rolling_step: None,
        }
    }

    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            mode: StrategyMode::Fixed,
            prefix: None,
            fixed_name: Some(name.into()),
            rolling_step: None,
        }
    }

    pub fn rolling(prefix: impl Into<String>, rolling_step: u32) -> Self {
        Self {
            mode: StrategyMode::Rolling,
            prefix: Some(prefix.into()),
            fixed_name: None,
            rolling_step: Some(rolling_step),
        }
    }

    pub fn per_user(prefix: impl Into<String>) -> Self {
        Self {
            mode: StrategyMode::PerUser,
            prefix: Some(prefix.into()),
            fixed_name: None,
            rolling_step: None,
        }
    }
}

/// Identity an index name is resolved for.
#[derive(Debug, Clone, Default)]
pub struct IndexScope {
    pub knowledge_id: Option<String>,
    pub user_id: Option<String>,
}

impl IndexScope {
    pub fn knowledge(knowledge_id: impl Into<String>) -> Self {
        Self {
            knowledge_id: Some(knowledge_id.into()),
            user_id: None,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            knowledge_id: None,
            user_id: Some(user_id.into()),
        }
    }
}

/// Pure resolution of the physical index name. Identical inputs always yield
/// the identical name, across calls and across process restarts.
pub fn resolve_index_name(strategy: &IndexStrategy, scope: &IndexScope) -> Result<String> {
    match strategy.mode {
        StrategyMode::Fixed => {
            let name = strategy
                .fixed_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| {
                    EngineError::Config("fixed strategy requires fixed_name".to_string())
                })?;
            Ok(name.to_string())
        }
        StrategyMode::Rolling => {
            let prefix = require_prefix(strategy)?;
            let step = strategy
                .rolling_step
                .filter(|step| *step > 0)
                .ok_or_else(|| {
                    EngineError::Config("rolling strategy requires rolling_step > 0".to_string())
                })?;
            let knowledge_id = require_knowledge_id(scope)?;
            let bucket = rolling_bucket(knowledge_id, step);
            Ok(format!("{prefix}_kb_{bucket}"))
        }
        StrategyMode::PerDataset => {
            let prefix = require_prefix(strategy)?;
            let knowledge_id = require_knowledge_id(scope)?;
            Ok(format!("{prefix}_kb_{knowledge_id}"))
        }
        StrategyMode::PerUser => {
            let prefix = require_prefix(strategy)?;
            let user_id = scope
                .user_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| {
                    EngineError::Config("per_user strategy requires user_id".to_string())
                })?;
            Ok(format!("{prefix}_user_{user_id}"))
        }
    }
}

/// Buckets are multiples of `step` within [0, 10000).
pub fn rolling_bucket(knowledge_id: &str, step: u32) -> u32 {
    let digest = Md5::digest(knowledge_id.as_bytes());
    let value = u128::from_be_bytes(digest.into());
    let slot = (value % ROLLING_BUCKET_SPACE) as u32;
    (slot / step) * step
}

fn require_prefix<'a>(strategy: &'a IndexStrategy) -> Result<&'a str> {
    strategy
        .prefix
        .as_deref()
        .filter(|prefix| !prefix.trim().is_empty())
        .ok_or_else(|| EngineError::Config(format!("{:?} strategy requires prefix", strategy.mode)))
}

fn require_knowledge_id<'a>(scope: &'a IndexScope) -> Result<&'a str> {
    scope
        .knowledge_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| EngineError::Config("index scope requires knowledge_id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_ignores_scope() {
        let strategy = IndexStrategy::fixed("kb_shared");
        let with_kb = resolve_index_name(&strategy, &IndexScope::knowledge("42")).unwrap();
        let without_kb = resolve_index_name(&strategy, &IndexScope::default()).unwrap();
        assert_eq!(with_kb, "kb_shared");
        assert_eq!(without_kb, "kb_shared");
    }

    #[test]
    fn per_dataset_embeds_knowledge_id() {
        let strategy = IndexStrategy::per_dataset("wegent");
        let name = resolve_index_name(&strategy, &IndexScope::knowledge("42")).unwrap();
        assert_eq!(name, "wegent_kb_42");
    }

    #[test]
    fn per_user_embeds_user_id() {
        let strategy = IndexStrategy::per_user("wegent");
        let name = resolve_index_name(&strategy, &IndexScope::user("alice")).unwrap();
        assert_eq!(name, "wegent_user_alice");
    }

    #[test]
    fn rolling_bucket_is_aligned_and_bounded() {
        for knowledge_id in ["42", "abc", "kb-9001", ""] {
            for step in [1u32, 7, 100, 2500, 5000] {
                let bucket = rolling_bucket(knowledge_id, step);
                assert!(bucket < 10_000);
                assert_eq!(bucket % step, 0);
            }
        }
    }

    #[test]
    fn rolling_name_is_stable_across_calls() {
        let strategy = IndexStrategy::rolling("wegent", 5000);
        let scope = IndexScope::knowledge("42");
        let first = resolve_index_name(&strategy, &scope).unwrap();
        let second = resolve_index_name(&strategy, &scope).unwrap();
        assert_eq!(first, second);

        let suffix: u32 = first
            .rsplit('_')
            .next()
            .and_then(|raw| raw.parse().ok())
            .expect("rolling name ends in a numeric bucket");
        assert_eq!(suffix % 5000, 0);
    }

    #[test]
    fn missing_required_fields_are_config_errors() {
        let no_fixed_name = IndexStrategy {
            mode: StrategyMode::Fixed,
            ..Default::default()
        };
        assert!(matches!(
            resolve_index_name(&no_fixed_name, &IndexScope::default()),
            Err(EngineError::Config(_))
        ));

        let no_step = IndexStrategy {
            mode: StrategyMode::Rolling,
            prefix: Some("wegent".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_index_name(&no_step, &IndexScope::knowledge("42")),
            Err(EngineError::Config(_))
        ));

        let zero_step = IndexStrategy::rolling("wegent", 0);
        assert!(matches!(
            resolve_index_name(&zero_step, &IndexScope::knowledge("42")),
            Err(EngineError::Config(_))
        ));

        let no_knowledge = IndexStrategy::per_dataset("wegent");
        assert!(matches!(
            resolve_index_name(&no_knowledge, &IndexScope::default()),
            Err(EngineError::Config(_))
        ));
    }
}

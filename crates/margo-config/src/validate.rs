use std::collections::HashSet;

use thiserror::Error;

use crate::{MargoConfig, PoolRef};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}")]
    Parse(String),

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("invalid {kind} name (not a valid identifier): {name}")]
    InvalidName { kind: &'static str, name: String },

    #[error("scheduler in xstream {xstream} references unresolved pool {pool_ref}")]
    UnresolvedPoolRef { xstream: String, pool_ref: String },

    #[error("__primary__ pool declared while the library is already initialized externally")]
    PrimaryAlreadyExternal,

    #[error("progress pool {0:?} is not the first pool of any execution stream — this would starve the progress ULT")]
    ProgressPoolStarved(String),
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate `cfg`, returning non-fatal starvation-avoidance warnings
/// alongside the parsed document, or a hard `ConfigError` for a
/// structural reject or the one fatal starvation arrangement.
pub fn validate(cfg: &MargoConfig, library_already_initialized_externally: bool) -> Result<Vec<String>, ConfigError> {
    let mut warnings = Vec::new();

    let mut pool_names = HashSet::new();
    let mut resolved_pool_names: Vec<String> = Vec::new();
    for (idx, pool) in cfg.argobots.pools.iter().enumerate() {
        let name = pool
            .name
            .clone()
            .unwrap_or_else(|| format!("__pool_{idx}__"));
        if name == "__primary__" && library_already_initialized_externally {
            return Err(ConfigError::PrimaryAlreadyExternal);
        }
        if !is_valid_identifier(&name) {
            return Err(ConfigError::InvalidName { kind: "pool", name });
        }
        if !pool_names.insert(name.clone()) {
            return Err(ConfigError::DuplicateName { kind: "pool", name });
        }
        resolved_pool_names.push(name);
    }

    let mut es_names = HashSet::new();
    for (idx, es) in cfg.argobots.xstreams.iter().enumerate() {
        let name = es.name.clone().unwrap_or_else(|| format!("__xstream_{idx}__"));
        if !is_valid_identifier(&name) {
            return Err(ConfigError::InvalidName { kind: "xstream", name });
        }
        if !es_names.insert(name.clone()) {
            return Err(ConfigError::DuplicateName { kind: "xstream", name });
        }
        for pool_ref in &es.scheduler.pools {
            let resolved = match pool_ref {
                PoolRef::Name(n) => resolved_pool_names.contains(n) || n == "__primary__",
                PoolRef::Index(i) => *i < resolved_pool_names.len(),
            };
            if !resolved {
                return Err(ConfigError::UnresolvedPoolRef {
                    xstream: name.clone(),
                    pool_ref: format!("{pool_ref:?}"),
                });
            }
        }
    }

    // Starvation avoidance: a pool attached to no ES at all.
    let mut attached: HashSet<String> = HashSet::new();
    for es in &cfg.argobots.xstreams {
        for pool_ref in &es.scheduler.pools {
            if let PoolRef::Name(n) = pool_ref {
                attached.insert(n.clone());
            }
        }
    }
    for name in &resolved_pool_names {
        if !attached.contains(name) {
            warnings.push(format!("pool {name:?} is attached to no execution stream"));
        }
    }

    // A non-progress pool that is not first in any ES's scheduler may starve.
    for es in &cfg.argobots.xstreams {
        for (pos, pool_ref) in es.scheduler.pools.iter().enumerate() {
            if pos == 0 {
                continue;
            }
            if let PoolRef::Name(n) = pool_ref {
                if n != &cfg.progress_pool {
                    warnings.push(format!(
                        "pool {n:?} is not first in xstream's scheduler and may never run"
                    ));
                }
            }
        }
    }

    // The one fatal case: the progress pool must be first-in-scheduler
    // for at least one ES, or the progress ULT itself can starve.
    let progress_pool_is_first_somewhere = cfg.argobots.xstreams.iter().any(|es| {
        es.scheduler
            .pools
            .first()
            .map(|p| matches!(p, PoolRef::Name(n) if n == &cfg.progress_pool))
            .unwrap_or(cfg.progress_pool == "__primary__" && es.name.as_deref() == Some("__primary__"))
    }) || cfg.argobots.xstreams.is_empty() && cfg.progress_pool == "__primary__";

    if !progress_pool_is_first_somewhere {
        return Err(ConfigError::ProgressPoolStarved(cfg.progress_pool.clone()));
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PoolConfig, SchedulerConfig, XstreamConfig};

    #[test]
    fn default_config_validates_clean() {
        let cfg = MargoConfig::default();
        let warnings = validate(&cfg, false).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn primary_pool_rejected_when_already_initialized_externally() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("__primary__".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        let err = validate(&cfg, true).unwrap_err();
        assert_eq!(err, ConfigError::PrimaryAlreadyExternal);
    }

    #[test]
    fn duplicate_pool_name_is_rejected() {
        let mut cfg = MargoConfig::default();
        for _ in 0..2 {
            cfg.argobots.pools.push(PoolConfig {
                name: Some("handlers".to_string()),
                kind: Default::default(),
                access: Default::default(),
            });
        }
        let err = validate(&cfg, false).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateName { kind: "pool", name: "handlers".to_string() }
        );
    }

    #[test]
    fn invalid_pool_identifier_is_rejected() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("1-not-an-identifier".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        let err = validate(&cfg, false).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName { kind: "pool", .. }));
    }

    #[test]
    fn xstream_referencing_unknown_pool_name_is_rejected() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-a".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name("nonexistent".to_string())],
            },
        });
        let err = validate(&cfg, false).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedPoolRef { .. }));
    }

    #[test]
    fn xstream_referencing_unknown_pool_index_is_rejected() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-a".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Index(0)],
            },
        });
        let err = validate(&cfg, false).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedPoolRef { .. }));
    }

    #[test]
    fn unattached_pool_warns_but_does_not_fail() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("orphan".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        let warnings = validate(&cfg, false).unwrap();
        assert!(warnings.iter().any(|w| w.contains("orphan")));
    }

    #[test]
    fn non_first_non_progress_pool_warns_but_does_not_fail() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("handlers".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-a".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name("__primary__".to_string()), PoolRef::Name("handlers".to_string())],
            },
        });
        let warnings = validate(&cfg, false).unwrap();
        assert!(warnings.iter().any(|w| w.contains("handlers") && w.contains("not first")));
    }

    #[test]
    fn progress_pool_starved_when_no_xstream_schedules_it_first() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("handlers".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        cfg.progress_pool = "handlers".to_string();
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-a".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name("__primary__".to_string())],
            },
        });
        let err = validate(&cfg, false).unwrap_err();
        assert_eq!(err, ConfigError::ProgressPoolStarved("handlers".to_string()));
    }

    #[test]
    fn progress_pool_first_in_some_xstream_is_enough() {
        let mut cfg = MargoConfig::default();
        cfg.argobots.pools.push(PoolConfig {
            name: Some("handlers".to_string()),
            kind: Default::default(),
            access: Default::default(),
        });
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-handlers".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name("handlers".to_string())],
            },
        });
        cfg.argobots.xstreams.push(XstreamConfig {
            name: Some("xs-progress".to_string()),
            cpubind: None,
            affinity: Vec::new(),
            scheduler: SchedulerConfig {
                kind: Default::default(),
                pools: vec![PoolRef::Name("__primary__".to_string())],
            },
        });
        let warnings = validate(&cfg, false).unwrap();
        assert!(warnings.is_empty());
    }
}
